//! The set of build plates and the multi-plate slice driver.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use slicekit_config::{DynamicConfig, PrinterProfile};
use slicekit_math::{Vec2, Vec3};
use slicekit_model::{Model, ObjectId};
use slicekit_print::{GCodeExporter, GCodeProcessorResult, NozzleFilamentRules, Print, PrintWarning};
use tracing::{debug, info, warn};

use crate::error::{PlateError, Result};
use crate::plate::{InstanceKey, PartPlate};

/// Upper bound on printable plates.
pub const MAX_PLATES_COUNT: usize = 36;

/// Gap between neighbouring plates, as a fraction of the plate size.
const PLATE_GAP: f64 = 0.2;

/// Columns of the square-ish grid that holds `count` plates.
pub fn compute_colum_count(count: usize) -> usize {
    let value = (count as f64).sqrt();
    let rounded = value.round();
    let cols = if value > rounded { rounded as usize + 1 } else { rounded as usize };
    cols.max(1)
}

/// Outcome of [`PartPlateList::slice_all`].
///
/// Plate-fatal failures and object-scoped failures are kept apart so a caller
/// can tell "plate 3 is invalid" from "plate 2, object 5 failed".
#[derive(Debug, Default)]
pub struct SliceReport {
    /// Plates that finished processing.
    pub sliced: Vec<usize>,
    /// Failures that stopped a whole plate, by plate index.
    pub plate_errors: BTreeMap<usize, PlateError>,
    /// Failures bound to one object, by plate index and object.
    pub object_errors: BTreeMap<(usize, ObjectId), String>,
    /// Non-fatal problems, by plate index and object.
    pub warnings: BTreeMap<(usize, ObjectId), Vec<String>>,
}

impl SliceReport {
    /// True when nothing failed.
    pub fn is_success(&self) -> bool {
        self.plate_errors.is_empty() && self.object_errors.is_empty()
    }

    /// Plates with any failure, plate-fatal or object-scoped.
    pub fn failed_plates(&self) -> BTreeSet<usize> {
        self.plate_errors
            .keys()
            .copied()
            .chain(self.object_errors.keys().map(|(p, _)| *p))
            .collect()
    }
}

/// Every printable plate, the plate collecting instances that fit nowhere,
/// and one [`Print`] per plate.
pub struct PartPlateList {
    plates: Vec<PartPlate>,
    unprintable_plate: PartPlate,
    prints: BTreeMap<usize, Print>,
    results: BTreeMap<usize, GCodeProcessorResult>,
    next_print_index: usize,
    current_plate: usize,
    plate_cols: usize,
    plate_width: f64,
    plate_depth: f64,
    plate_height: f64,
    exclude_areas: Vec<Vec<[f64; 2]>>,
    filament_count: usize,
    rules: NozzleFilamentRules,
}

impl PartPlateList {
    /// One empty plate of the given size.
    pub fn new(width: f64, depth: f64, height: f64) -> Self {
        let mut list = Self {
            plates: Vec::new(),
            unprintable_plate: PartPlate::new(0, Vec3::zeros(), width, depth, height, false),
            prints: BTreeMap::new(),
            results: BTreeMap::new(),
            next_print_index: 0,
            current_plate: 0,
            plate_cols: 1,
            plate_width: width,
            plate_depth: depth,
            plate_height: height,
            exclude_areas: Vec::new(),
            filament_count: 1,
            rules: NozzleFilamentRules::builtin(),
        };
        list.push_plate();
        let origin = list.compute_origin_for_unprintable();
        list.unprintable_plate
            .set_pos_and_size(origin, width, depth, height, None, false);
        list
    }

    /// One empty plate sized and shaped after `profile`.
    pub fn from_profile(profile: &PrinterProfile) -> Self {
        let mut list = Self::new(profile.bed_x, profile.bed_y, profile.bed_z);
        list.exclude_areas = profile.exclude_areas.clone();
        for plate in &mut list.plates {
            plate.set_shape(&list.exclude_areas);
        }
        list
    }

    /// Replace the nozzle/filament restriction table used before slicing.
    pub fn set_nozzle_filament_rules(&mut self, rules: NozzleFilamentRules) {
        self.rules = rules;
    }

    /// Printable plates.
    pub fn plates(&self) -> &[PartPlate] {
        &self.plates
    }

    /// Printable plate by index.
    pub fn plate(&self, index: usize) -> Option<&PartPlate> {
        self.plates.get(index)
    }

    /// Mutable printable plate by index.
    pub fn plate_mut(&mut self, index: usize) -> Option<&mut PartPlate> {
        self.plates.get_mut(index)
    }

    /// Number of printable plates.
    pub fn plate_count(&self) -> usize {
        self.plates.len()
    }

    /// The plate holding instances no printable plate overlaps.
    pub fn unprintable_plate(&self) -> &PartPlate {
        &self.unprintable_plate
    }

    /// Index of the selected plate.
    pub fn current_plate_index(&self) -> usize {
        self.current_plate
    }

    /// Select a plate.
    pub fn select_plate(&mut self, index: usize) -> Result<()> {
        if index >= self.plates.len() {
            return Err(PlateError::PlateIndex(index));
        }
        self.current_plate = index;
        Ok(())
    }

    /// Columns of the current plate grid.
    pub fn plate_cols(&self) -> usize {
        self.plate_cols
    }

    /// Distance between plate origins along X.
    pub fn plate_stride_x(&self) -> f64 {
        self.plate_width * (1.0 + PLATE_GAP)
    }

    /// Distance between plate origins along Y.
    pub fn plate_stride_y(&self) -> f64 {
        self.plate_depth * (1.0 + PLATE_GAP)
    }

    /// Grid position of plate `index` in a grid of `cols` columns. Rows grow
    /// towards negative Y.
    pub fn compute_shape_position(&self, index: usize, cols: usize) -> Vec2 {
        let cols = cols.max(1);
        let row = index / cols;
        let col = index % cols;
        Vec2::new(col as f64 * self.plate_stride_x(), -(row as f64) * self.plate_stride_y())
    }

    /// Origin of plate `index` in a grid of `cols` columns.
    pub fn compute_origin(&self, index: usize, cols: usize) -> Vec3 {
        let pos = self.compute_shape_position(index, cols);
        Vec3::new(pos.x, pos.y, 0.0)
    }

    /// Origin of the unprintable plate: the next free grid cell, or a new
    /// column when the grid is full.
    pub fn compute_origin_for_unprintable(&self) -> Vec3 {
        let count = self.plates.len();
        let max_count = self.plate_cols * self.plate_cols;
        if count == max_count {
            self.compute_origin(max_count + self.plate_cols - 1, self.plate_cols + 1)
        } else {
            self.compute_origin(count, self.plate_cols)
        }
    }

    fn push_plate(&mut self) -> usize {
        let index = self.plates.len();
        let cols = compute_colum_count(index + 1);
        let origin = self.compute_origin(index, cols);
        let mut plate = PartPlate::new(index, origin, self.plate_width, self.plate_depth, self.plate_height, true);
        plate.set_shape(&self.exclude_areas);

        let print_index = self.next_print_index;
        self.next_print_index += 1;
        self.prints.insert(print_index, Print::new());
        plate.set_print_index(Some(print_index));

        self.plates.push(plate);
        self.plate_cols = cols;
        self.unprintable_plate.set_index(self.plates.len());
        info!(plate = index, print_index, "plate created");
        index
    }

    fn update_all_plates_pos_and_size(
        &mut self,
        mut model: Option<&mut Model>,
        adjust_position: bool,
        with_unprintable_move: bool,
    ) {
        let (width, depth, height) = (self.plate_width, self.plate_depth, self.plate_height);
        for i in 0..self.plates.len() {
            let origin = self.compute_origin(i, self.plate_cols);
            let model = if adjust_position { model.as_deref_mut() } else { None };
            self.plates[i].set_pos_and_size(origin, width, depth, height, model, false);
        }
        let origin = self.compute_origin_for_unprintable();
        let model = if with_unprintable_move { model } else { None };
        self.unprintable_plate
            .set_pos_and_size(origin, width, depth, height, model, false);
    }

    /// Append an empty plate and return its index.
    ///
    /// The new plate takes the grid cell of the unprintable plate; with
    /// `adjust_position` the instances parked there move onto it.
    pub fn create_plate(&mut self, model: &mut Model, adjust_position: bool) -> Result<usize> {
        if self.plates.len() >= MAX_PLATES_COUNT {
            warn!(count = self.plates.len(), "plate limit reached");
            return Err(PlateError::TooManyPlates(MAX_PLATES_COUNT));
        }
        let old_cols = self.plate_cols;
        let index = self.push_plate();
        if self.plate_cols != old_cols {
            debug!(old_cols, new_cols = self.plate_cols, "plate grid resized");
            self.update_all_plates_pos_and_size(Some(&mut *model), adjust_position, false);
        } else {
            let origin = self.compute_origin_for_unprintable();
            let (width, depth, height) = (self.plate_width, self.plate_depth, self.plate_height);
            self.unprintable_plate
                .set_pos_and_size(origin, width, depth, height, None, false);
        }
        if adjust_position {
            self.construct_objects_list_for_new_plate(model, index)?;
        }
        Ok(index)
    }

    /// Drop the print with the given pool index and its export result.
    pub fn destroy_print(&mut self, print_index: usize) {
        if self.prints.remove(&print_index).is_some() {
            info!(print_index, "print destroyed");
        }
        self.results.remove(&print_index);
    }

    /// Delete plate `index`.
    ///
    /// Later plates shift down one cell, taking their instances along. The
    /// deleted plate's instances go to the new last plate when they overlap
    /// it, else to the unprintable plate.
    pub fn delete_plate(&mut self, model: &mut Model, index: usize) -> Result<()> {
        debug!(plate = index, count = self.plates.len(), "deleting plate");
        if index >= self.plates.len() {
            warn!(plate = index, "can not find plate");
            return Err(PlateError::PlateIndex(index));
        }
        if self.plates.len() <= 1 {
            warn!("only one plate left, can not delete");
            return Err(PlateError::LastPlate);
        }

        let old_cols = self.plate_cols;
        let mut plate = self.plates.remove(index);
        self.plate_cols = compute_colum_count(self.plates.len());
        let (width, depth, height) = (self.plate_width, self.plate_depth, self.plate_height);

        let origin = self.compute_origin_for_unprintable();
        plate.set_pos_and_size(origin, width, depth, height, Some(&mut *model), true);

        for i in index..self.plates.len() {
            let origin = self.compute_origin(i, self.plate_cols);
            let moved = &mut self.plates[i];
            moved.set_index(i);
            moved.set_pos_and_size(origin, width, depth, height, Some(&mut *model), true);
        }

        if self.current_plate >= index && self.current_plate > 0 {
            self.current_plate -= 1;
        }
        self.unprintable_plate.set_index(self.plates.len());

        if old_cols != self.plate_cols {
            self.update_all_plates_pos_and_size(Some(&mut *model), true, true);
        } else {
            let origin = self.compute_origin_for_unprintable();
            self.unprintable_plate
                .set_pos_and_size(origin, width, depth, height, Some(&mut *model), true);
        }

        let last = self.plates.len() - 1;
        plate.move_instances_to(model, &mut self.plates[last], &mut self.unprintable_plate)?;
        if let Some(print_index) = plate.print_index() {
            self.destroy_print(print_index);
        }
        info!(plate = index, count = self.plates.len(), "plate deleted");
        Ok(())
    }

    /// Move plate `old_index` to `new_index`, shifting the plates in between
    /// and their instances.
    pub fn move_plate_to_index(&mut self, model: &mut Model, old_index: usize, new_index: usize) -> Result<()> {
        let count = self.plates.len();
        if old_index >= count {
            return Err(PlateError::PlateIndex(old_index));
        }
        if new_index >= count {
            return Err(PlateError::PlateIndex(new_index));
        }
        if old_index == new_index {
            warn!(plate = old_index, "plate moved onto itself");
            return Ok(());
        }

        let plate = self.plates.remove(old_index);
        self.plates.insert(new_index, plate);
        let (width, depth, height) = (self.plate_width, self.plate_depth, self.plate_height);
        for i in old_index.min(new_index)..=old_index.max(new_index) {
            let origin = self.compute_origin(i, self.plate_cols);
            let plate = &mut self.plates[i];
            plate.set_index(i);
            plate.set_pos_and_size(origin, width, depth, height, Some(&mut *model), false);
        }
        self.current_plate = new_index;
        Ok(())
    }

    /// Lock or unlock plate `index`.
    pub fn lock_plate(&mut self, index: usize, state: bool) -> Result<()> {
        let plate = self.plates.get_mut(index).ok_or_else(|| {
            warn!(plate = index, "can not get plate");
            PlateError::PlateIndex(index)
        })?;
        info!(plate = index, state, "lock plate");
        plate.lock(state);
        Ok(())
    }

    /// Plate owning the print with pool index `print_index`.
    pub fn find_plate_by_print_index(&self, print_index: usize) -> Option<usize> {
        self.plates
            .iter()
            .position(|p| p.print_index() == Some(print_index))
    }

    /// Printable plate the instance is assigned to.
    pub fn find_instance(&self, key: InstanceKey) -> Option<usize> {
        self.plates.iter().position(|p| p.contain_instance(key))
    }

    /// Printable plate that holds the instance fully inside.
    pub fn find_instance_belongs(&self, key: InstanceKey) -> Option<usize> {
        self.plates
            .iter()
            .position(|p| p.contain_instance_totally(key))
    }

    /// Re-home an instance that was added or moved.
    ///
    /// An instance still overlapping its plate stays there with a fresh
    /// outside check. Otherwise it goes to the first printable plate it
    /// overlaps, or to the unprintable plate. New instances landing on a
    /// spiral vase plate get the vase settings.
    pub fn notify_instance_update(&mut self, model: &mut Model, key: InstanceKey, is_new: bool) -> Result<()> {
        let bbox = model
            .object(key.0)?
            .instance_convex_hull_bounding_box(key.1)?;
        debug!(object = key.0, instance = key.1, "instance updated");

        if let Some(index) = self.find_instance(key) {
            let plate = &mut self.plates[index];
            if plate.intersect_instance(model, key, Some(&bbox)) {
                plate.update_instance_exclude_status(model, key, Some(&bbox))?;
                plate.update_states();
                plate.update_slice_result_valid_state(false);
                return Ok(());
            }
            debug!(plate = index, "instance left its plate");
            plate.remove_instance(key)?;
            plate.update_slice_result_valid_state(false);
        } else if self.unprintable_plate.contain_instance(key) {
            if !self
                .plates
                .iter()
                .any(|p| p.intersect_instance(model, key, Some(&bbox)))
            {
                return Ok(());
            }
            self.unprintable_plate.remove_instance(key)?;
        }

        for (index, plate) in self.plates.iter_mut().enumerate() {
            if !plate.intersect_instance(model, key, Some(&bbox)) {
                continue;
            }
            plate.add_instance(model, key, Some(&bbox))?;
            let spiral = plate.config().opt_bool("spiral_mode").unwrap_or(false);
            if spiral && !is_vase_compatible(&model.objects[key.0].config) {
                if is_new {
                    plate.set_vase_mode_related_object_config(model, Some(key.0));
                } else {
                    warn!(plate = index, object = key.0, "object settings conflict with spiral vase mode");
                }
            }
            plate.update_slice_result_valid_state(false);
            debug!(plate = index, object = key.0, instance = key.1, "instance moved to plate");
            return Ok(());
        }

        self.unprintable_plate.add_instance(model, key, Some(&bbox))?;
        debug!(object = key.0, instance = key.1, "instance moved to unprintable plate");
        Ok(())
    }

    /// Forget a removed instance. `instance == None` means the whole model
    /// object at `object` was deleted and higher object indices shift down.
    pub fn notify_instance_removed(&mut self, object: usize, instance: Option<usize>) {
        debug!(object, ?instance, "instance removed");
        match instance {
            Some(i) => {
                let key = (object, i);
                if let Some(index) = self.find_instance(key) {
                    let plate = &mut self.plates[index];
                    if let Err(e) = plate.remove_instance(key) {
                        debug!(plate = index, error = %e, "remove_instance failed");
                    }
                    plate.update_slice_result_valid_state(false);
                }
                if self.unprintable_plate.contain_instance(key) {
                    if let Err(e) = self.unprintable_plate.remove_instance(key) {
                        debug!(error = %e, "remove_instance failed on unprintable plate");
                    }
                }
            }
            None => {
                for plate in &mut self.plates {
                    if plate.instances().iter().any(|k| k.0 == object) {
                        plate.update_slice_result_valid_state(false);
                    }
                    plate.update_object_index(object);
                    plate.update_states();
                }
                self.unprintable_plate.update_object_index(object);
            }
        }
    }

    /// Move an instance to the center of `plate_index`.
    pub fn add_to_plate(&mut self, model: &mut Model, key: InstanceKey, plate_index: usize) -> Result<()> {
        if plate_index >= self.plates.len() {
            return Err(PlateError::PlateIndex(plate_index));
        }
        match self.find_instance(key) {
            Some(index) if index == plate_index => {
                debug!(plate = index, "instance already on this plate");
                return Ok(());
            }
            Some(index) => {
                self.plates[index].remove_instance(key)?;
            }
            None => {
                if self.unprintable_plate.contain_instance(key) {
                    self.unprintable_plate.remove_instance(key)?;
                }
            }
        }
        self.plates[plate_index].add_instance_centered(model, key)
    }

    /// Unassign every instance. Locked plates keep theirs with
    /// `except_locked`.
    pub fn clear(&mut self, clear_sliced_result: bool, except_locked: bool) {
        for plate in &mut self.plates {
            if except_locked && plate.is_locked() {
                continue;
            }
            plate.clear(clear_sliced_result);
        }
        self.unprintable_plate.clear(false);
    }

    /// Reassign every model instance: first overlapping plate, else the
    /// unprintable plate.
    pub fn reload_all_objects(&mut self, model: &Model, except_locked: bool) -> Result<()> {
        self.clear(false, except_locked);
        for (o, object) in model.objects.iter().enumerate() {
            for i in 0..object.instances.len() {
                let key = (o, i);
                let locked = |p: &PartPlate| except_locked && p.is_locked();
                if self.plates.iter().any(|p| locked(p) && p.contain_instance(key)) {
                    continue;
                }
                let bbox = object.instance_convex_hull_bounding_box(i)?;
                match self
                    .plates
                    .iter()
                    .position(|p| !locked(p) && p.intersect_instance(model, key, Some(&bbox)))
                {
                    Some(index) => {
                        debug!(plate = index, object = o, instance = i, "found plate");
                        self.plates[index].add_instance(model, key, Some(&bbox))?;
                    }
                    None => {
                        debug!(object = o, instance = i, "found in unprintable plate");
                        self.unprintable_plate.add_instance(model, key, Some(&bbox))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fill a freshly created plate with the instances it overlaps that no
    /// earlier plate holds; the rest go to the unprintable plate.
    pub fn construct_objects_list_for_new_plate(&mut self, model: &Model, plate_index: usize) -> Result<()> {
        if plate_index >= self.plates.len() {
            return Err(PlateError::PlateIndex(plate_index));
        }
        self.unprintable_plate.clear(false);
        for (o, object) in model.objects.iter().enumerate() {
            for i in 0..object.instances.len() {
                let key = (o, i);
                if self.plates[..plate_index].iter().any(|p| p.contain_instance(key)) {
                    continue;
                }
                let bbox = object.instance_convex_hull_bounding_box(i)?;
                let plate = &mut self.plates[plate_index];
                if plate.intersect_instance(model, key, Some(&bbox)) {
                    plate.add_instance(model, key, Some(&bbox))?;
                    debug!(plate = plate_index, object = o, instance = i, "added to new plate");
                } else {
                    self.unprintable_plate.add_instance(model, key, Some(&bbox))?;
                }
            }
        }
        Ok(())
    }

    /// Reassign instances after an arrangement, then with `recycle_plates`
    /// delete trailing plates that hold nothing printable. Locked plates
    /// with printable content are skipped; plate 0 always stays.
    pub fn rebuild_plates_after_arrangement(
        &mut self,
        model: &mut Model,
        recycle_plates: bool,
        except_locked: bool,
    ) -> Result<()> {
        info!(count = self.plates.len(), recycle_plates, "rebuilding plates");
        self.reload_all_objects(model, except_locked)?;
        if recycle_plates {
            for i in (1..self.plates.len()).rev() {
                let plate = &self.plates[i];
                if plate.empty() || !plate.has_printable_instances(model) {
                    info!(plate = i, "deleting empty plate");
                    self.delete_plate(model, i)?;
                } else if plate.is_locked() {
                    continue;
                } else {
                    break;
                }
            }
        }
        info!(count = self.plates.len(), "plates rebuilt");
        Ok(())
    }

    /// Resize every plate and reassign the instances.
    pub fn reset_size(&mut self, model: &Model, width: f64, depth: f64, height: f64) -> Result<()> {
        if width == self.plate_width && depth == self.plate_depth && height == self.plate_height {
            return Ok(());
        }
        info!(width, depth, height, "plate size changed");
        self.plate_width = width;
        self.plate_depth = depth;
        self.plate_height = height;
        self.update_all_plates_pos_and_size(None, false, false);
        self.reload_all_objects(model, false)
    }

    /// Replace the exclusion areas of every plate and re-run the outside
    /// check for every assigned instance.
    pub fn set_shapes(&mut self, model: &Model, exclude_areas: &[Vec<[f64; 2]>]) -> Result<()> {
        self.exclude_areas = exclude_areas.to_vec();
        for plate in &mut self.plates {
            if !plate.set_shape(exclude_areas) {
                continue;
            }
            let keys: Vec<InstanceKey> = plate.instances().iter().copied().collect();
            for key in keys {
                plate.update_instance_exclude_status(model, key, None)?;
            }
            plate.update_states();
            plate.update_slice_result_valid_state(false);
        }
        Ok(())
    }

    /// Mark every slice result stale.
    pub fn invalid_all_slice_result(&mut self) {
        for plate in &mut self.plates {
            plate.update_slice_result_valid_state(false);
        }
    }

    /// True when every plate's result is current.
    pub fn is_all_slice_results_valid(&self) -> bool {
        self.plates.iter().all(PartPlate::is_slice_result_valid)
    }

    /// True when every plate with printable content has a result ready for
    /// printing and at least one plate does.
    pub fn is_all_slice_results_ready_for_print(&self, model: &Model) -> bool {
        let mut ready = false;
        for plate in &self.plates {
            if !plate.empty() && !plate.is_all_instances_unprintable(model) && !plate.is_slice_result_ready_for_print() {
                return false;
            }
            ready |= plate.is_slice_result_ready_for_print();
        }
        ready
    }

    /// Like [`is_all_slice_results_ready_for_print`](Self::is_all_slice_results_ready_for_print),
    /// and every ready plate also has something printable.
    pub fn is_all_slice_result_ready_for_export(&self, model: &Model) -> bool {
        let mut ready = false;
        for plate in &self.plates {
            if !plate.empty() && !plate.is_all_instances_unprintable(model) && !plate.is_slice_result_ready_for_print() {
                return false;
            }
            if plate.is_slice_result_ready_for_print() {
                if !plate.has_printable_instances(model) {
                    return false;
                }
                ready = true;
            }
        }
        ready
    }

    /// True when at least one plate can be sliced.
    pub fn is_all_plates_ready_for_slice(&self) -> bool {
        self.plates.iter().any(PartPlate::can_slice)
    }

    /// Indices of plates holding instances.
    pub fn get_nonempty_plate_list(&self) -> Vec<usize> {
        self.plates
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Filaments currently loaded.
    pub fn filament_count(&self) -> usize {
        self.filament_count
    }

    /// Propagate a new filament count to every plate map.
    pub fn set_filament_count(&mut self, count: usize) {
        self.filament_count = count;
        for plate in &mut self.plates {
            plate.set_filament_count(count);
        }
    }

    /// A filament was appended.
    pub fn on_filament_added(&mut self) {
        self.filament_count += 1;
        for plate in &mut self.plates {
            plate.on_filament_added();
        }
    }

    /// 0-based filament `id` was removed.
    pub fn on_filament_deleted(&mut self, id: usize) {
        self.filament_count = self.filament_count.saturating_sub(1);
        for plate in &mut self.plates {
            plate.on_filament_deleted(id);
        }
    }

    /// The machine's extruder count changed.
    pub fn on_extruder_count_changed(&mut self, extruder_count: usize) {
        for plate in &mut self.plates {
            plate.on_extruder_count_changed(extruder_count);
        }
    }

    /// Print of plate `index`.
    pub fn get_print(&self, index: usize) -> Option<&Print> {
        let print_index = self.plates.get(index)?.print_index()?;
        self.prints.get(&print_index)
    }

    /// Last export result of plate `index`.
    pub fn slice_result(&self, index: usize) -> Option<&GCodeProcessorResult> {
        let print_index = self.plates.get(index)?.print_index()?;
        self.results.get(&print_index)
    }

    fn ensure_print(&mut self, index: usize) -> usize {
        if let Some(print_index) = self.plates[index].print_index() {
            self.prints.entry(print_index).or_insert_with(Print::new);
            return print_index;
        }
        let print_index = self.next_print_index;
        self.next_print_index += 1;
        self.prints.insert(print_index, Print::new());
        self.plates[index].set_print_index(Some(print_index));
        info!(plate = index, print_index, "print created");
        print_index
    }

    /// Run the print pipeline of plate `index` up to skirt and brim.
    ///
    /// Readiness, printable content and filament compatibility are checked
    /// before any work starts. On success the plate result becomes valid and
    /// the per-object warnings are returned; on failure only this plate's
    /// result is invalidated.
    pub fn slice_plate(&mut self, model: &Model, index: usize, global: &DynamicConfig) -> Result<Vec<PrintWarning>> {
        let plate = self.plates.get(index).ok_or(PlateError::PlateIndex(index))?;
        if !plate.is_ready_for_slice() {
            warn!(plate = index, "objects outside the printable area");
            return Err(PlateError::NotReady(index));
        }
        let filter = plate.printable_instances(model);
        if filter.is_empty() {
            return Err(PlateError::NoPrintableInstances(index));
        }
        let config = plate.build_config(global);
        let checked = plate
            .check_filament_printable(model, global)
            .and_then(|_| plate.check_compatible_of_nozzle_and_filament(model, global, &self.rules));
        if let Err(e) = checked {
            warn!(plate = index, error = %e, "filament check failed");
            self.plates[index].update_slice_result_valid_state(false);
            return Err(e);
        }
        if !plate.check_mixture_of_pla_and_petg(model, &config) {
            warn!(plate = index, "PLA and PETG printed together may not stick to each other");
        }
        let origin = plate.origin();

        let print_index = self.ensure_print(index);
        let Some(print) = self.prints.get_mut(&print_index) else {
            return Err(PlateError::PrintIndex(print_index));
        };
        match run_print(print, model, &filter, &config, index, origin) {
            Ok(()) => {
                let used: Vec<u32> = print.extruders().into_iter().collect();
                let warnings = print.warnings().to_vec();
                let plate = &mut self.plates[index];
                plate.set_used_filaments(used);
                plate.update_slice_result_valid_state(true);
                info!(plate = index, warnings = warnings.len(), "plate sliced");
                Ok(warnings)
            }
            Err(source) => {
                warn!(plate = index, error = %source, "plate slicing failed");
                self.plates[index].update_slice_result_valid_state(false);
                Err(PlateError::Print {
                    plate_index: index,
                    source,
                })
            }
        }
    }

    /// Export plate `index` through `exporter` and keep the result.
    ///
    /// A toolpath conflict found after writing invalidates the plate.
    pub fn export_plate_gcode(
        &mut self,
        index: usize,
        path: &Path,
        exporter: &dyn GCodeExporter,
    ) -> Result<GCodeProcessorResult> {
        let print_index = self
            .plates
            .get(index)
            .ok_or(PlateError::PlateIndex(index))?
            .print_index()
            .ok_or(PlateError::NotReady(index))?;
        let print = self
            .prints
            .get_mut(&print_index)
            .ok_or(PlateError::PrintIndex(print_index))?;
        match print.export_gcode(path, exporter) {
            Ok(result) => {
                self.results.insert(print_index, result.clone());
                Ok(result)
            }
            Err(source) => {
                self.plates[index].update_slice_result_valid_state(false);
                self.results.remove(&print_index);
                Err(PlateError::Print {
                    plate_index: index,
                    source,
                })
            }
        }
    }

    /// Slice every non-empty plate. One plate failing never stops the others.
    pub fn slice_all(&mut self, model: &Model, global: &DynamicConfig) -> SliceReport {
        let mut report = SliceReport::default();
        for index in 0..self.plates.len() {
            if self.plates[index].empty() {
                continue;
            }
            match self.slice_plate(model, index, global) {
                Ok(warnings) => {
                    report.sliced.push(index);
                    for w in warnings {
                        report
                            .warnings
                            .entry((index, w.object_id))
                            .or_default()
                            .push(w.message);
                    }
                }
                Err(e) => match e.object_id() {
                    Some(id) => {
                        report.object_errors.insert((index, id), e.to_string());
                    }
                    None => {
                        report.plate_errors.insert(index, e);
                    }
                },
            }
        }
        info!(
            sliced = report.sliced.len(),
            failed = report.failed_plates().len(),
            "slicing finished"
        );
        report
    }
}

fn run_print(
    print: &mut Print,
    model: &Model,
    filter: &BTreeSet<InstanceKey>,
    config: &DynamicConfig,
    plate_index: usize,
    origin: Vec3,
) -> slicekit_print::Result<()> {
    print.set_plate_index(plate_index);
    print.set_plate_origin(origin);
    print.apply(model, Some(filter), config)?;
    print.validate()?;
    print.process()
}

fn is_vase_compatible(config: &DynamicConfig) -> bool {
    config.opt_int("wall_loops").ok() == Some(1)
        && config.opt_int("top_shell_layers").ok() == Some(0)
        && config.opt_float("sparse_infill_density").ok() == Some(0.0)
        && config.opt_bool("enable_support").ok() == Some(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use slicekit_math::Point3;
    use slicekit_model::{ModelInstance, ModelObject, ModelVolume, TriangleMesh};

    fn cube_model(offsets: &[Vec3]) -> Model {
        let mut model = Model::new();
        for (i, at) in offsets.iter().enumerate() {
            let mut object = ModelObject::new(format!("cube_{i}"));
            object.add_volume(ModelVolume::new(
                "part",
                TriangleMesh::cuboid(Point3::origin(), [10.0, 10.0, 4.0]),
            ));
            object.add_instance(ModelInstance::new(*at));
            model.add_object(object);
        }
        model
    }

    fn holders(list: &PartPlateList, key: InstanceKey) -> usize {
        list.plates().iter().filter(|p| p.contain_instance(key)).count()
            + usize::from(list.unprintable_plate().contain_instance(key))
    }

    #[test]
    fn test_column_count() {
        let cols: Vec<usize> = [1, 2, 3, 4, 5, 9, 10, 36].iter().map(|&n| compute_colum_count(n)).collect();
        assert_eq!(cols, vec![1, 2, 2, 2, 3, 3, 4, 6]);
        assert_eq!(compute_colum_count(0), 1);
    }

    #[test]
    fn test_grid_layout() {
        let mut model = Model::new();
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        assert_relative_eq!(list.compute_origin_for_unprintable().x, 240.0);

        list.create_plate(&mut model, false).unwrap();
        list.create_plate(&mut model, false).unwrap();
        assert_eq!(list.plate_cols(), 2);
        assert_relative_eq!(list.plate(1).unwrap().origin().x, 240.0);
        assert_relative_eq!(list.plate(2).unwrap().origin().x, 0.0);
        assert_relative_eq!(list.plate(2).unwrap().origin().y, -240.0);
        // Fourth cell of the 2×2 grid.
        assert_relative_eq!(list.unprintable_plate().origin().x, 240.0);
        assert_relative_eq!(list.unprintable_plate().origin().y, -240.0);
    }

    #[test]
    fn test_plate_limit() {
        let mut model = Model::new();
        let mut list = PartPlateList::new(100.0, 100.0, 100.0);
        for _ in 1..MAX_PLATES_COUNT {
            list.create_plate(&mut model, false).unwrap();
        }
        assert!(matches!(
            list.create_plate(&mut model, false),
            Err(PlateError::TooManyPlates(MAX_PLATES_COUNT))
        ));
    }

    #[test]
    fn test_reload_partitions_instances() {
        let mut model = cube_model(&[
            Vec3::new(50.0, 50.0, 0.0),
            Vec3::new(300.0, 50.0, 0.0),
            Vec3::new(50.0, 900.0, 0.0),
        ]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.create_plate(&mut model, false).unwrap();
        list.reload_all_objects(&model, false).unwrap();

        assert_eq!(list.find_instance((0, 0)), Some(0));
        assert_eq!(list.find_instance((1, 0)), Some(1));
        assert_eq!(list.find_instance((2, 0)), None);
        assert!(list.unprintable_plate().contain_instance((2, 0)));
        for o in 0..3 {
            assert_eq!(holders(&list, (o, 0)), 1);
        }
    }

    #[test]
    fn test_new_plate_takes_unprintable_instances() {
        let mut model = cube_model(&[Vec3::new(50.0, 50.0, 0.0), Vec3::new(300.0, 50.0, 0.0)]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.reload_all_objects(&model, false).unwrap();
        assert!(list.unprintable_plate().contain_instance((1, 0)));

        // Plate 1 is created where the unprintable plate used to be.
        let index = list.create_plate(&mut model, true).unwrap();
        assert_eq!(index, 1);
        assert_eq!(list.find_instance((1, 0)), Some(1));
        assert!(list.unprintable_plate().empty());
    }

    #[test]
    fn test_delete_plate_moves_instances() {
        let mut model = cube_model(&[Vec3::new(50.0, 50.0, 0.0), Vec3::new(300.0, 50.0, 0.0)]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.create_plate(&mut model, false).unwrap();
        list.reload_all_objects(&model, false).unwrap();
        let print_index = list.plate(1).unwrap().print_index().unwrap();

        list.delete_plate(&mut model, 1).unwrap();
        assert_eq!(list.plate_count(), 1);
        assert!(list.unprintable_plate().contain_instance((1, 0)));
        assert_eq!(holders(&list, (1, 0)), 1);
        assert_eq!(list.find_plate_by_print_index(print_index), None);

        assert!(matches!(list.delete_plate(&mut model, 0), Err(PlateError::LastPlate)));
        assert!(matches!(list.delete_plate(&mut model, 4), Err(PlateError::PlateIndex(4))));
    }

    #[test]
    fn test_move_plate_carries_instances() {
        let mut model = cube_model(&[Vec3::new(50.0, 50.0, 0.0)]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.create_plate(&mut model, false).unwrap();
        list.reload_all_objects(&model, false).unwrap();

        list.move_plate_to_index(&mut model, 0, 1).unwrap();
        assert_eq!(list.current_plate_index(), 1);
        assert!(list.plate(1).unwrap().contain_instance((0, 0)));
        assert_relative_eq!(model.objects[0].instances[0].offset.x, 290.0);
    }

    #[test]
    fn test_instance_update_changes_plate() {
        let mut model = cube_model(&[Vec3::new(50.0, 50.0, 0.0)]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.create_plate(&mut model, false).unwrap();
        list.reload_all_objects(&model, false).unwrap();
        list.plate_mut(0).unwrap().update_slice_result_valid_state(true);

        model.objects[0].instances[0].set_offset(Vec3::new(300.0, 50.0, 0.0));
        list.notify_instance_update(&mut model, (0, 0), false).unwrap();
        assert_eq!(list.find_instance((0, 0)), Some(1));
        assert!(!list.plate(0).unwrap().is_slice_result_valid());

        model.objects[0].instances[0].set_offset(Vec3::new(1000.0, 1000.0, 0.0));
        list.notify_instance_update(&mut model, (0, 0), false).unwrap();
        assert!(list.unprintable_plate().contain_instance((0, 0)));

        model.objects[0].instances[0].set_offset(Vec3::new(50.0, 50.0, 0.0));
        list.notify_instance_update(&mut model, (0, 0), false).unwrap();
        assert_eq!(list.find_instance((0, 0)), Some(0));
        assert_eq!(holders(&list, (0, 0)), 1);
    }

    #[test]
    fn test_new_instance_on_vase_plate_gets_vase_settings() {
        let mut model = cube_model(&[Vec3::new(1000.0, 1000.0, 0.0)]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.reload_all_objects(&model, false).unwrap();
        list.plate_mut(0)
            .unwrap()
            .set_spiral_vase_mode(true, false, &DynamicConfig::defaults());

        model.objects[0].instances[0].set_offset(Vec3::new(50.0, 50.0, 0.0));
        list.notify_instance_update(&mut model, (0, 0), true).unwrap();
        assert_eq!(model.objects[0].config.opt_int("wall_loops").unwrap(), 1);
        assert!(!model.objects[0].config.opt_bool("enable_support").unwrap());
    }

    #[test]
    fn test_object_removal_renumbers() {
        let mut model = cube_model(&[Vec3::new(20.0, 20.0, 0.0); 5]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.reload_all_objects(&model, false).unwrap();

        model.delete_object(2).unwrap();
        list.notify_instance_removed(2, None);
        let keys: Vec<InstanceKey> = list.plate(0).unwrap().instances().iter().copied().collect();
        assert_eq!(keys, vec![(0, 0), (1, 0), (2, 0), (3, 0)]);
    }

    #[test]
    fn test_instance_removal_clears_owner() {
        let model = cube_model(&[Vec3::new(20.0, 20.0, 0.0), Vec3::new(1000.0, 0.0, 0.0)]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.reload_all_objects(&model, false).unwrap();
        assert!(list.unprintable_plate().contain_instance((1, 0)));
        list.plate_mut(0).unwrap().update_slice_result_valid_state(true);

        list.notify_instance_removed(0, Some(0));
        list.notify_instance_removed(1, Some(0));
        assert_eq!(list.find_instance((0, 0)), None);
        assert!(list.plate(0).unwrap().empty());
        assert!(!list.plate(0).unwrap().is_slice_result_valid());
        assert!(list.unprintable_plate().empty());

        // A second notification for the same key is a no-op.
        list.notify_instance_removed(0, Some(0));
        assert!(list.plate(0).unwrap().empty());
    }

    #[test]
    fn test_add_to_plate_centers_instance() {
        let mut model = cube_model(&[Vec3::new(1000.0, 0.0, 0.0)]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.create_plate(&mut model, false).unwrap();
        list.reload_all_objects(&model, false).unwrap();

        list.add_to_plate(&mut model, (0, 0), 1).unwrap();
        assert_eq!(list.find_instance((0, 0)), Some(1));
        assert!(!list.unprintable_plate().contain_instance((0, 0)));
        assert_relative_eq!(model.objects[0].instances[0].offset.x, 340.0);
    }

    #[test]
    fn test_rebuild_recycles_trailing_plates() {
        let mut model = cube_model(&[Vec3::new(50.0, 50.0, 0.0)]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.create_plate(&mut model, false).unwrap();
        list.create_plate(&mut model, false).unwrap();

        list.rebuild_plates_after_arrangement(&mut model, true, false).unwrap();
        assert_eq!(list.plate_count(), 1);
        assert_eq!(list.find_instance((0, 0)), Some(0));
    }

    #[test]
    fn test_exclusion_shapes_update_ready_state() {
        let model = cube_model(&[Vec3::new(5.0, 5.0, 0.0)]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.reload_all_objects(&model, false).unwrap();
        assert!(list.plate(0).unwrap().is_ready_for_slice());

        list.set_shapes(&model, &[vec![[0.0, 0.0], [18.0, 0.0], [18.0, 28.0], [0.0, 28.0]]])
            .unwrap();
        assert!(!list.plate(0).unwrap().is_ready_for_slice());
        assert!(!list.is_all_plates_ready_for_slice());
        assert_eq!(list.find_instance_belongs((0, 0)), None);
    }

    #[test]
    fn test_slice_rejects_plates_before_work() {
        let mut model = cube_model(&[Vec3::new(195.0, 50.0, 0.0)]);
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.reload_all_objects(&model, false).unwrap();
        let global = DynamicConfig::defaults();
        assert!(matches!(
            list.slice_plate(&model, 0, &global),
            Err(PlateError::NotReady(0))
        ));

        model.objects[0].instances[0].set_offset(Vec3::new(50.0, 50.0, 0.0));
        model.objects[0].instances[0].printable = false;
        list.reload_all_objects(&model, false).unwrap();
        assert!(matches!(
            list.slice_plate(&model, 0, &global),
            Err(PlateError::NoPrintableInstances(0))
        ));
        assert!(matches!(
            list.slice_plate(&model, 3, &global),
            Err(PlateError::PlateIndex(3))
        ));
    }

    #[test]
    fn test_filament_count_propagates() {
        let mut list = PartPlateList::new(200.0, 200.0, 250.0);
        list.plate_mut(0).unwrap().set_filament_maps(&[1, 2]);
        list.on_filament_added();
        assert_eq!(list.filament_count(), 2);
        assert_eq!(list.plate(0).unwrap().get_filament_maps(), vec![1, 2, 1]);
        list.on_filament_deleted(0);
        assert_eq!(list.plate(0).unwrap().get_filament_maps(), vec![2, 1]);
    }
}
