//! One build plate and the instances assigned to it.

use std::collections::BTreeSet;
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use slicekit_config::{BedType, DynamicConfig, FilamentMapMode, PrintSequence, VOLUME_EXTRUDER_KEY};
use slicekit_math::{intersection_ex, BoundingBox3, ExPolygon, Point2, Point3, Polygon, Vec2, Vec3, EPSILON};
use slicekit_model::{Model, ModelInstance};
use slicekit_print::{compat, NozzleFilamentRules};
use tracing::{debug, error, info};

use crate::error::{PlateError, Result};

/// `(object index, instance index)` into a [`Model`].
pub type InstanceKey = (usize, usize);

const BED_TYPE_KEY: &str = "curr_bed_type";
const PRINT_SEQUENCE_KEY: &str = "print_sequence";
const SPIRAL_MODE_KEY: &str = "spiral_mode";
const FILAMENT_MAP_MODE_KEY: &str = "filament_map_mode";
const FILAMENT_MAP_KEY: &str = "filament_map";

const EXCLUDE_CORNER_POINTS: usize = 8;
const EXCLUDE_FIRST_CORNER_RADIUS: f64 = 8.0;
const EXCLUDE_THIRD_CORNER_RADIUS: f64 = 3.0;

fn arc_points(center: Point2, radius: f64, start: f64, stop: f64) -> impl Iterator<Item = Point2> {
    let step = (stop - start) / (EXCLUDE_CORNER_POINTS - 1) as f64;
    (0..EXCLUDE_CORNER_POINTS).map(move |j| {
        let angle = start + j as f64 * step;
        Point2::new(center.x + angle.cos() * radius, center.y + angle.sin() * radius)
    })
}

/// Outline of an exclusion area.
///
/// Four-point areas are treated as rectangles listed from their lower-left
/// corner and get rounded corners: radius 8 at the first corner, radius 3 at
/// the third. Other shapes are used as given.
pub fn rounded_exclude_polygon(area: &[Point2]) -> Polygon {
    if area.len() != 4 {
        return Polygon::new(area.to_vec());
    }
    let r0 = EXCLUDE_FIRST_CORNER_RADIUS;
    let r2 = EXCLUDE_THIRD_CORNER_RADIUS;
    let mut points = Vec::with_capacity(2 * EXCLUDE_CORNER_POINTS + 2);
    points.extend(arc_points(area[0] + Vec2::new(r0, r0), r0, PI, 1.5 * PI));
    points.push(area[1]);
    points.extend(arc_points(area[2] - Vec2::new(r2, r2), r2, 0.0, 0.5 * PI));
    points.push(area[3]);
    Polygon::new(points)
}

/// An independent build area holding a subset of the model's instances.
///
/// The plate never owns the model. Every operation that needs instance
/// geometry takes the [`Model`] as an argument and addresses instances by
/// [`InstanceKey`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartPlate {
    index: usize,
    origin: Vec3,
    width: f64,
    depth: f64,
    height: f64,
    printable: bool,
    exclude_areas: Vec<Vec<[f64; 2]>>,
    exclude_polygons: Vec<ExPolygon>,
    obj_to_instance_set: BTreeSet<InstanceKey>,
    instance_outside_set: BTreeSet<InstanceKey>,
    config: DynamicConfig,
    locked: bool,
    ready_for_slice: bool,
    slice_result_valid: bool,
    print_index: Option<usize>,
    used_filaments: Vec<u32>,
}

impl PartPlate {
    /// Empty plate. `printable` is false only for the plate collecting
    /// instances that fit nowhere else.
    pub fn new(index: usize, origin: Vec3, width: f64, depth: f64, height: f64, printable: bool) -> Self {
        Self {
            index,
            origin,
            width,
            depth,
            height,
            printable,
            exclude_areas: Vec::new(),
            exclude_polygons: Vec::new(),
            obj_to_instance_set: BTreeSet::new(),
            instance_outside_set: BTreeSet::new(),
            config: DynamicConfig::new(),
            locked: false,
            ready_for_slice: true,
            slice_result_valid: false,
            print_index: None,
            used_filaments: Vec::new(),
        }
    }

    /// Position of the plate in the plate list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        if index != self.index {
            debug!(from = self.index, to = index, "plate index changed");
        }
        self.index = index;
    }

    /// Lower-left corner in world coordinates.
    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    /// Size along X (mm).
    pub fn width(&self) -> f64 {
        self.width
    }

    /// Size along Y (mm).
    pub fn depth(&self) -> f64 {
        self.depth
    }

    /// Printable height (mm).
    pub fn height(&self) -> f64 {
        self.height
    }

    /// False for the unprintable plate.
    pub fn is_printable(&self) -> bool {
        self.printable
    }

    /// Plate volume in world coordinates.
    pub fn plate_box(&self) -> BoundingBox3 {
        BoundingBox3::new(
            Point3::new(self.origin.x, self.origin.y, self.origin.z),
            Point3::new(
                self.origin.x + self.width,
                self.origin.y + self.depth,
                self.origin.z + self.height,
            ),
        )
    }

    /// Center of the plate surface.
    pub fn center_origin(&self) -> Vec3 {
        Vec3::new(
            self.origin.x + self.width / 2.0,
            self.origin.y + self.depth / 2.0,
            self.origin.z,
        )
    }

    /// Per-plate option overrides.
    pub fn config(&self) -> &DynamicConfig {
        &self.config
    }

    /// Global config with this plate's overrides applied.
    pub fn build_config(&self, global: &DynamicConfig) -> DynamicConfig {
        let mut config = global.clone();
        config.apply(&self.config);
        config
    }

    /// Replace the exclusion areas, given in plate coordinates. Returns
    /// false when nothing changed.
    pub fn set_shape(&mut self, exclude_areas: &[Vec<[f64; 2]>]) -> bool {
        if self.exclude_areas == exclude_areas {
            return false;
        }
        self.exclude_areas = exclude_areas.to_vec();
        self.regenerate_exclude_polygons();
        true
    }

    /// Exclusion polygons in world coordinates.
    pub fn exclude_polygons(&self) -> &[ExPolygon] {
        &self.exclude_polygons
    }

    fn regenerate_exclude_polygons(&mut self) {
        let shift = Vec2::new(self.origin.x, self.origin.y);
        self.exclude_polygons = self
            .exclude_areas
            .iter()
            .map(|area| {
                let points: Vec<Point2> = area.iter().map(|p| Point2::new(p[0], p[1]) + shift).collect();
                ExPolygon::new(rounded_exclude_polygon(&points))
            })
            .collect();
    }

    /// Move or resize the plate.
    ///
    /// With a model, assigned instances travel with the plate (kept centered
    /// when the size changes). Without one, `do_clear` drops them instead.
    pub fn set_pos_and_size(
        &mut self,
        origin: Vec3,
        width: f64,
        depth: f64,
        height: f64,
        model: Option<&mut Model>,
        do_clear: bool,
    ) {
        let size_changed = (width - self.width).abs() > EPSILON
            || (depth - self.depth).abs() > EPSILON
            || (height - self.height).abs() > EPSILON;
        let pos_changed = (origin - self.origin).norm() > EPSILON;
        if !size_changed && !pos_changed {
            return;
        }

        if let Some(model) = model {
            let mut delta = Vec3::new(origin.x - self.origin.x, origin.y - self.origin.y, 0.0);
            if size_changed {
                delta.x += (width - self.width) / 2.0;
                delta.y += (depth - self.depth) / 2.0;
            }
            for &(o, i) in &self.obj_to_instance_set {
                if let Some(instance) = instance_mut(model, (o, i)) {
                    let offset = instance.offset + delta;
                    instance.set_offset(offset);
                }
            }
        } else if do_clear {
            self.clear(true);
        }

        info!(
            plate = self.index,
            x = origin.x,
            y = origin.y,
            width,
            depth,
            height,
            "plate moved"
        );
        self.origin = origin;
        self.width = width;
        self.depth = depth;
        self.height = height;
        self.regenerate_exclude_polygons();
    }

    /// True when `key` addresses an existing instance of `model`.
    pub fn valid_instance(&self, model: &Model, key: InstanceKey) -> bool {
        model
            .objects
            .get(key.0)
            .is_some_and(|o| key.1 < o.instances.len())
    }

    /// True when `key` is assigned to this plate.
    pub fn contain_instance(&self, key: InstanceKey) -> bool {
        self.obj_to_instance_set.contains(&key)
    }

    /// True when `key` is assigned to this plate and lies fully inside it.
    pub fn contain_instance_totally(&self, key: InstanceKey) -> bool {
        self.contain_instance(key) && !self.instance_outside_set.contains(&key)
    }

    /// Assigned instances.
    pub fn instances(&self) -> &BTreeSet<InstanceKey> {
        &self.obj_to_instance_set
    }

    /// Assigned instances protruding from the printable area.
    pub fn outside_instances(&self) -> &BTreeSet<InstanceKey> {
        &self.instance_outside_set
    }

    /// True unless the instance's hull box fits the plate volume and its hull
    /// touches no exclusion polygon. Objects sunk below the bed are not
    /// outside on that account.
    pub fn check_outside(&self, model: &Model, key: InstanceKey, bbox: Option<&BoundingBox3>) -> Result<bool> {
        let object = model.object(key.0)?;
        let instance_box = match bbox {
            Some(b) => *b,
            None => object.instance_convex_hull_bounding_box(key.1)?,
        };
        let mut plate_box = self.plate_box();
        if instance_box.max.z > plate_box.min.z {
            plate_box.min.z += instance_box.min.z;
        }
        if !plate_box.contains(&instance_box) {
            return Ok(true);
        }
        if self.exclude_polygons.is_empty() {
            return Ok(false);
        }
        let hull = vec![ExPolygon::new(object.instance_convex_hull(key.1)?)];
        Ok(self
            .exclude_polygons
            .iter()
            .any(|p| !intersection_ex(&hull, std::slice::from_ref(p)).is_empty()))
    }

    /// True when the instance's hull box overlaps the plate rectangle. The
    /// unprintable plate accepts every valid instance.
    pub fn intersect_instance(&self, model: &Model, key: InstanceKey, bbox: Option<&BoundingBox3>) -> bool {
        if !self.valid_instance(model, key) {
            error!(plate = self.index, object = key.0, instance = key.1, "invalid instance");
            return false;
        }
        if !self.printable {
            return true;
        }
        let instance_box = match bbox {
            Some(b) => *b,
            None => match model.objects[key.0].instance_convex_hull_bounding_box(key.1) {
                Ok(b) => b,
                Err(_) => return false,
            },
        };
        self.plate_box().to_2d().overlaps(&instance_box.to_2d())
    }

    /// Assign `key` to this plate and classify it as inside or outside.
    pub fn add_instance(&mut self, model: &Model, key: InstanceKey, bbox: Option<&BoundingBox3>) -> Result<()> {
        if !self.valid_instance(model, key) {
            error!(plate = self.index, object = key.0, instance = key.1, "can not add invalid instance");
            return Err(PlateError::InvalidInstance {
                object: key.0,
                instance: key.1,
            });
        }
        let outside = self.check_outside(model, key, bbox)?;
        self.obj_to_instance_set.insert(key);
        if outside {
            self.instance_outside_set.insert(key);
        } else {
            self.instance_outside_set.remove(&key);
        }
        debug!(plate = self.index, object = key.0, instance = key.1, outside, "instance added");
        self.update_states();
        Ok(())
    }

    /// Move the instance to the plate center, keeping its Z, then assign it.
    pub fn add_instance_centered(&mut self, model: &mut Model, key: InstanceKey) -> Result<()> {
        let center = self.center_origin();
        let instance = instance_mut(model, key).ok_or(PlateError::InvalidInstance {
            object: key.0,
            instance: key.1,
        })?;
        let offset = Vec3::new(center.x, center.y, instance.offset.z);
        instance.set_offset(offset);
        self.add_instance(model, key, None)
    }

    /// Unassign `key`.
    pub fn remove_instance(&mut self, key: InstanceKey) -> Result<()> {
        if !self.obj_to_instance_set.remove(&key) {
            debug!(plate = self.index, object = key.0, instance = key.1, "instance not on plate");
            return Err(PlateError::InstanceNotFound {
                object: key.0,
                instance: key.1,
            });
        }
        self.instance_outside_set.remove(&key);
        debug!(plate = self.index, object = key.0, instance = key.1, "instance removed");
        if !self.ready_for_slice {
            self.update_states();
        }
        Ok(())
    }

    /// Recompute the ready flag from the outside set.
    pub fn update_states(&mut self) {
        let ready = self
            .obj_to_instance_set
            .iter()
            .all(|k| !self.instance_outside_set.contains(k));
        if ready != self.ready_for_slice {
            info!(plate = self.index, ready, "ready for slice changed");
        }
        self.ready_for_slice = ready;
    }

    /// Re-run the outside check for one instance.
    pub fn update_instance_exclude_status(
        &mut self,
        model: &Model,
        key: InstanceKey,
        bbox: Option<&BoundingBox3>,
    ) -> Result<()> {
        if self.check_outside(model, key, bbox)? {
            self.instance_outside_set.insert(key);
        } else {
            self.instance_outside_set.remove(&key);
        }
        Ok(())
    }

    /// Renumber after the model object at `removed` was deleted: its entries
    /// go away and higher object indices shift down by one.
    pub fn update_object_index(&mut self, removed: usize) {
        let remap = |set: &BTreeSet<InstanceKey>| -> BTreeSet<InstanceKey> {
            set.iter()
                .filter(|(o, _)| *o != removed)
                .map(|&(o, i)| if o > removed { (o - 1, i) } else { (o, i) })
                .collect()
        };
        self.obj_to_instance_set = remap(&self.obj_to_instance_set);
        self.instance_outside_set = remap(&self.instance_outside_set);
    }

    fn assigned_instances<'a>(&'a self, model: &'a Model) -> impl Iterator<Item = (InstanceKey, &'a ModelInstance)> {
        self.obj_to_instance_set.iter().filter_map(move |&(o, i)| {
            model
                .objects
                .get(o)
                .and_then(|obj| obj.instances.get(i))
                .map(|inst| ((o, i), inst))
        })
    }

    /// Printable instances fully inside the plate.
    pub fn printable_instances(&self, model: &Model) -> BTreeSet<InstanceKey> {
        self.assigned_instances(model)
            .filter(|(k, inst)| inst.printable && !self.instance_outside_set.contains(k))
            .map(|(k, _)| k)
            .collect()
    }

    /// Number of printable instances fully inside the plate.
    pub fn printable_instance_size(&self, model: &Model) -> usize {
        self.printable_instances(model).len()
    }

    /// True when at least one instance can be printed.
    pub fn has_printable_instances(&self, model: &Model) -> bool {
        self.assigned_instances(model)
            .any(|(k, inst)| inst.printable && !self.instance_outside_set.contains(&k))
    }

    /// True when every assigned instance is flagged unprintable.
    pub fn is_all_instances_unprintable(&self, model: &Model) -> bool {
        self.assigned_instances(model).all(|(_, inst)| !inst.printable)
    }

    /// True when nothing is assigned.
    pub fn empty(&self) -> bool {
        self.obj_to_instance_set.is_empty()
    }

    /// True when every assigned instance lies inside the plate.
    pub fn is_ready_for_slice(&self) -> bool {
        self.ready_for_slice
    }

    /// True when the plate holds instances and all of them fit.
    pub fn can_slice(&self) -> bool {
        self.ready_for_slice && !self.empty()
    }

    /// Unassign everything. With `clear_sliced_result` the plate also
    /// forgets its slice result.
    pub fn clear(&mut self, clear_sliced_result: bool) {
        self.obj_to_instance_set.clear();
        self.instance_outside_set.clear();
        if clear_sliced_result {
            self.ready_for_slice = true;
            self.update_slice_result_valid_state(false);
            self.used_filaments.clear();
        }
    }

    /// Union of the assigned instances' boxes.
    pub fn get_objects_bounding_box(&self, model: &Model) -> BoundingBox3 {
        let mut bbox = BoundingBox3::empty();
        for &(o, i) in &self.obj_to_instance_set {
            if let Ok(b) = model.instance_bounding_box(o, i) {
                bbox.merge(&b);
            }
        }
        bbox
    }

    /// Shift every assigned instance by `delta`.
    pub fn translate_all_instance(&self, model: &mut Model, delta: Vec3) {
        for &key in &self.obj_to_instance_set {
            if let Some(instance) = instance_mut(model, key) {
                let offset = instance.offset + delta;
                instance.set_offset(offset);
            }
        }
    }

    /// Hand every assigned instance to `left` if it overlaps it, else to
    /// `right`.
    pub fn move_instances_to(&self, model: &Model, left: &mut PartPlate, right: &mut PartPlate) -> Result<()> {
        for &key in &self.obj_to_instance_set {
            if left.intersect_instance(model, key, None) {
                left.add_instance(model, key, None)?;
            } else {
                right.add_instance(model, key, None)?;
            }
        }
        Ok(())
    }

    /// Apply the settings spiral vase mode needs to objects on this plate,
    /// or only to `object` when given.
    pub fn set_vase_mode_related_object_config(&self, model: &mut Model, object: Option<usize>) {
        let objects: BTreeSet<usize> = match object {
            Some(o) => BTreeSet::from([o]),
            None => self.obj_to_instance_set.iter().map(|k| k.0).collect(),
        };
        for o in objects {
            if let Some(obj) = model.objects.get_mut(o) {
                obj.config.set("wall_loops", 1i64);
                obj.config.set("top_shell_layers", 0i64);
                obj.config.set("sparse_infill_density", 0.0);
                obj.config.set("enable_support", false);
            }
        }
    }

    /// 1-based filaments the plate's objects are configured to use.
    pub fn get_extruders(&self, model: &Model, global: &DynamicConfig) -> Vec<u32> {
        let global_support =
            global.opt_bool("enable_support").unwrap_or(false) || global.opt_int("raft_layers").unwrap_or(0) > 0;
        let positive = |c: &DynamicConfig, key: &str| c.opt_int(key).ok().filter(|&e| e > 0).map(|e| e as u32);

        let objects: BTreeSet<usize> = self
            .obj_to_instance_set
            .iter()
            .filter(|k| !self.instance_outside_set.contains(k))
            .map(|k| k.0)
            .collect();
        let mut extruders = BTreeSet::new();
        for object in objects.into_iter().filter_map(|o| model.objects.get(o)) {
            let object_extruder = positive(&object.config, VOLUME_EXTRUDER_KEY).unwrap_or(1);
            for volume in &object.volumes {
                if volume.is_model_part() {
                    extruders.insert(volume.extruder_id().unwrap_or(object_extruder));
                } else if volume.is_modifier() {
                    extruders.extend(volume.extruder_id());
                }
                extruders.extend(volume.painted_extruders());
            }
            for range in &object.layer_config_ranges {
                extruders.extend(positive(&range.config, VOLUME_EXTRUDER_KEY));
            }

            let support = if object.config.has("enable_support") || object.config.has("raft_layers") {
                object.config.opt_bool("enable_support").unwrap_or(false)
                    || object.config.opt_int("raft_layers").unwrap_or(0) > 0
            } else {
                global_support
            };
            if support {
                for key in ["support_interface_filament", "support_filament"] {
                    extruders.extend(positive(&object.config, key).or_else(|| positive(global, key)));
                }
            }
        }
        extruders.into_iter().collect()
    }

    /// Filaments consumed by the last successful slice.
    pub fn get_used_filaments(&self) -> &[u32] {
        &self.used_filaments
    }

    pub(crate) fn set_used_filaments(&mut self, filaments: Vec<u32>) {
        self.used_filaments = filaments;
    }

    /// Under manual filament mapping, fail on the first filament mapped to a
    /// nozzle that cannot print it.
    pub fn check_filament_printable(&self, model: &Model, global: &DynamicConfig) -> Result<()> {
        let config = self.build_config(global);
        let used = self.get_extruders(model, &config);
        let maps = self.get_real_filament_maps(global);
        compat::check_filament_printable(&config, &used, self.get_real_filament_map_mode(global), &maps)
            .map_err(|e| PlateError::Incompatible(e.to_string()))
    }

    /// Report every used filament that the installed nozzles cannot take.
    pub fn check_compatible_of_nozzle_and_filament(
        &self,
        model: &Model,
        global: &DynamicConfig,
        rules: &NozzleFilamentRules,
    ) -> Result<()> {
        let config = self.build_config(global);
        let used = self.get_extruders(model, &config);
        compat::check_compatible_of_nozzle_and_filament(&config, &used, rules)
            .map_err(|e| PlateError::Incompatible(e.to_string()))
    }

    /// False when the plate mixes PLA and PETG.
    pub fn check_mixture_of_pla_and_petg(&self, model: &Model, global: &DynamicConfig) -> bool {
        let types: Vec<String> = self
            .get_extruders(model, global)
            .into_iter()
            .map(|f| compat::filament_type(global, f))
            .collect();
        compat::check_mixture_of_pla_and_petg(&types)
    }

    /// Bed type override, [`BedType::Default`] when unset.
    pub fn get_bed_type(&self) -> BedType {
        self.config.opt_enum(BED_TYPE_KEY).unwrap_or(BedType::Default)
    }

    /// Bed type after resolving the override against `global`.
    pub fn get_real_bed_type(&self, global: &DynamicConfig) -> BedType {
        match self.get_bed_type() {
            BedType::Default => global.opt_enum(BED_TYPE_KEY).unwrap_or(BedType::Default),
            bed => bed,
        }
    }

    /// Override the bed type. A change of the resolved type invalidates the
    /// slice result.
    pub fn set_bed_type(&mut self, bed_type: BedType, global: &DynamicConfig) {
        let old_real = self.get_real_bed_type(global);
        if bed_type == BedType::Default {
            self.config.erase(BED_TYPE_KEY);
        } else {
            self.config.set(BED_TYPE_KEY, bed_type.as_str());
        }
        if self.get_real_bed_type(global) != old_real {
            self.update_slice_result_valid_state(false);
        }
    }

    /// Drop the bed type override.
    pub fn reset_bed_type(&mut self) {
        self.config.erase(BED_TYPE_KEY);
    }

    /// Print sequence override, [`PrintSequence::ByDefault`] when unset.
    pub fn get_print_seq(&self) -> PrintSequence {
        self.config
            .opt_enum(PRINT_SEQUENCE_KEY)
            .unwrap_or(PrintSequence::ByDefault)
    }

    /// Print sequence after resolving the override against `global`.
    pub fn get_real_print_seq(&self, global: &DynamicConfig) -> PrintSequence {
        match self.get_print_seq() {
            PrintSequence::ByDefault => global
                .opt_enum(PRINT_SEQUENCE_KEY)
                .unwrap_or(PrintSequence::ByLayer),
            seq => seq,
        }
    }

    /// Override the print sequence. A change of the resolved sequence
    /// invalidates the slice result.
    pub fn set_print_seq(&mut self, seq: PrintSequence, global: &DynamicConfig) {
        let old_real = self.get_real_print_seq(global);
        if seq == PrintSequence::ByDefault {
            self.config.erase(PRINT_SEQUENCE_KEY);
        } else {
            self.config.set(PRINT_SEQUENCE_KEY, seq.as_str());
        }
        if self.get_real_print_seq(global) != old_real {
            self.update_slice_result_valid_state(false);
        }
    }

    /// True when the plate overrides spiral vase mode.
    pub fn has_spiral_mode_config(&self) -> bool {
        self.config.has(SPIRAL_MODE_KEY)
    }

    /// Spiral vase mode after resolving the override against `global`.
    pub fn get_spiral_vase_mode(&self, global: &DynamicConfig) -> bool {
        self.config
            .opt_bool(SPIRAL_MODE_KEY)
            .or_else(|_| global.opt_bool(SPIRAL_MODE_KEY))
            .unwrap_or(false)
    }

    /// Override spiral vase mode, or follow `global` when `as_global`.
    pub fn set_spiral_vase_mode(&mut self, spiral: bool, as_global: bool, global: &DynamicConfig) {
        let old_real = self.get_spiral_vase_mode(global);
        if as_global {
            self.config.erase(SPIRAL_MODE_KEY);
        } else {
            self.config.set(SPIRAL_MODE_KEY, spiral);
        }
        if self.get_spiral_vase_mode(global) != old_real {
            self.update_slice_result_valid_state(false);
        }
    }

    /// Filament map mode override, [`FilamentMapMode::Default`] when unset.
    pub fn get_filament_map_mode(&self) -> FilamentMapMode {
        self.config
            .opt_enum(FILAMENT_MAP_MODE_KEY)
            .unwrap_or(FilamentMapMode::Default)
    }

    /// Filament map mode after resolving the override against `global`.
    pub fn get_real_filament_map_mode(&self, global: &DynamicConfig) -> FilamentMapMode {
        match self.get_filament_map_mode() {
            FilamentMapMode::Default => global
                .opt_enum(FILAMENT_MAP_MODE_KEY)
                .unwrap_or(FilamentMapMode::AutoForFlush),
            mode => mode,
        }
    }

    /// Override the filament map mode.
    ///
    /// An explicit map made under one resolved mode is not reused under
    /// another: when the resolved mode changes the plate's map is dropped.
    pub fn set_filament_map_mode(&mut self, mode: FilamentMapMode, global: &DynamicConfig) {
        let old_real = self.get_real_filament_map_mode(global);
        let new_real = match mode {
            FilamentMapMode::Default => global
                .opt_enum(FILAMENT_MAP_MODE_KEY)
                .unwrap_or(FilamentMapMode::AutoForFlush),
            m => m,
        };
        if old_real != new_real {
            debug!(plate = self.index, from = %old_real, to = %new_real, "filament map mode changed");
            self.clear_filament_map();
        }
        if mode == FilamentMapMode::Default {
            self.clear_filament_map_mode();
        } else {
            self.config.set(FILAMENT_MAP_MODE_KEY, mode.as_str());
        }
    }

    /// Plate's own filament-to-extruder map (1-based extruders), empty when
    /// unset.
    pub fn get_filament_maps(&self) -> Vec<u32> {
        self.config
            .opt_ints(FILAMENT_MAP_KEY)
            .map(|v| v.into_iter().map(|e| e.max(1) as u32).collect())
            .unwrap_or_default()
    }

    /// Set the plate's filament-to-extruder map.
    pub fn set_filament_maps(&mut self, maps: &[u32]) {
        self.config.set(
            FILAMENT_MAP_KEY,
            maps.iter().map(|&e| i64::from(e)).collect::<Vec<_>>(),
        );
    }

    /// Plate map, or the global one when the plate has none.
    pub fn get_real_filament_maps(&self, global: &DynamicConfig) -> Vec<u32> {
        let maps = self.get_filament_maps();
        if !maps.is_empty() {
            return maps;
        }
        global
            .opt_ints(FILAMENT_MAP_KEY)
            .map(|v| v.into_iter().map(|e| e.max(1) as u32).collect())
            .unwrap_or_default()
    }

    /// Drop the plate's filament map.
    pub fn clear_filament_map(&mut self) {
        self.config.erase(FILAMENT_MAP_KEY);
    }

    /// Drop the filament map mode override.
    pub fn clear_filament_map_mode(&mut self) {
        self.config.erase(FILAMENT_MAP_MODE_KEY);
    }

    /// Single-extruder machines have nothing to map: drop the map and fall
    /// back to flush-optimized grouping.
    pub fn on_extruder_count_changed(&mut self, extruder_count: usize) {
        if extruder_count < 2 {
            self.clear_filament_map();
            self.config
                .set(FILAMENT_MAP_MODE_KEY, FilamentMapMode::AutoForFlush.as_str());
        }
    }

    /// Resize the plate's map, new filaments going to extruder 1.
    pub fn set_filament_count(&mut self, filament_count: usize) {
        let mut maps = self.get_filament_maps();
        if maps.is_empty() {
            return;
        }
        maps.resize(filament_count, 1);
        self.set_filament_maps(&maps);
    }

    /// Map a newly added filament to extruder 1.
    pub fn on_filament_added(&mut self) {
        let mut maps = self.get_filament_maps();
        if maps.is_empty() {
            return;
        }
        maps.push(1);
        self.set_filament_maps(&maps);
    }

    /// Drop the map entry of 0-based `filament_id`.
    pub fn on_filament_deleted(&mut self, filament_id: usize) {
        let mut maps = self.get_filament_maps();
        if filament_id < maps.len() {
            maps.remove(filament_id);
            self.set_filament_maps(&maps);
        }
    }

    /// 0-based physical extruder printing 1-based `filament`.
    ///
    /// Logical extruders come from the filament map; `physical_extruder_map`
    /// translates them when the machine numbers its nozzles differently.
    pub fn get_physical_extruder_by_filament_id(&self, global: &DynamicConfig, filament: u32) -> Option<usize> {
        let maps = self.get_real_filament_maps(global);
        let logical = *maps.get((filament as usize).checked_sub(1)?)? as usize - 1;
        if global.has("physical_extruder_map") {
            global
                .opt_ints("physical_extruder_map")
                .ok()
                .and_then(|m| m.get(logical).copied())
                .map(|p| p.max(0) as usize)
        } else {
            Some(logical)
        }
    }

    /// Mark the slice result valid or stale.
    pub fn update_slice_result_valid_state(&mut self, valid: bool) {
        if valid != self.slice_result_valid {
            info!(plate = self.index, valid, "slice result state changed");
        }
        self.slice_result_valid = valid;
    }

    /// True when the last slice still matches the plate.
    pub fn is_slice_result_valid(&self) -> bool {
        self.slice_result_valid
    }

    /// True when the plate has a valid result and nothing protrudes.
    pub fn is_slice_result_ready_for_print(&self) -> bool {
        self.slice_result_valid && self.ready_for_slice
    }

    /// Lock or unlock the plate against rearrangement.
    pub fn lock(&mut self, state: bool) {
        self.locked = state;
    }

    /// True when locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Key of the plate's print in the plate list's pool.
    pub fn print_index(&self) -> Option<usize> {
        self.print_index
    }

    pub(crate) fn set_print_index(&mut self, index: Option<usize>) {
        self.print_index = index;
    }
}

fn instance_mut(model: &mut Model, key: InstanceKey) -> Option<&mut ModelInstance> {
    model
        .objects
        .get_mut(key.0)
        .and_then(|o| o.instances.get_mut(key.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use slicekit_model::{ModelObject, ModelVolume, TriangleMesh};

    fn cube_model(offsets: &[Vec3]) -> Model {
        let mut model = Model::new();
        for (i, at) in offsets.iter().enumerate() {
            let mut object = ModelObject::new(format!("cube_{i}"));
            object.add_volume(ModelVolume::new(
                "part",
                TriangleMesh::cuboid(Point3::origin(), [10.0, 10.0, 10.0]),
            ));
            object.add_instance(ModelInstance::new(*at));
            model.add_object(object);
        }
        model
    }

    fn plate() -> PartPlate {
        PartPlate::new(0, Vec3::zeros(), 220.0, 220.0, 250.0, true)
    }

    #[test]
    fn test_rounded_rectangle_corners() {
        let area = [
            Point2::new(0.0, 0.0),
            Point2::new(18.0, 0.0),
            Point2::new(18.0, 28.0),
            Point2::new(0.0, 28.0),
        ];
        let polygon = rounded_exclude_polygon(&area);
        assert_eq!(polygon.len(), 18);
        approx::assert_relative_eq!(polygon.points[0].x, 0.0, epsilon = 1e-9);
        approx::assert_relative_eq!(polygon.points[0].y, 8.0, epsilon = 1e-9);
        approx::assert_relative_eq!(polygon.points[7].x, 8.0, epsilon = 1e-9);
        approx::assert_relative_eq!(polygon.points[7].y, 0.0, epsilon = 1e-9);
        approx::assert_relative_eq!(polygon.points[9].x, 18.0, epsilon = 1e-9);
        approx::assert_relative_eq!(polygon.points[9].y, 25.0, epsilon = 1e-9);
        // Rounding only removes area.
        assert!(polygon.area() < 18.0 * 28.0);
    }

    #[test]
    fn test_inside_instance_is_not_outside() {
        let model = cube_model(&[Vec3::new(100.0, 100.0, 0.0)]);
        assert!(!plate().check_outside(&model, (0, 0), None).unwrap());
    }

    #[test]
    fn test_instance_over_edge_is_outside() {
        let model = cube_model(&[Vec3::new(215.0, 100.0, 0.0)]);
        assert!(plate().check_outside(&model, (0, 0), None).unwrap());
    }

    #[test]
    fn test_exclusion_zone_makes_instance_outside() {
        let model = cube_model(&[Vec3::new(5.0, 5.0, 0.0), Vec3::new(100.0, 100.0, 0.0)]);
        let mut plate = plate();
        plate.set_shape(&[vec![[0.0, 0.0], [18.0, 0.0], [18.0, 28.0], [0.0, 28.0]]]);
        assert!(plate.check_outside(&model, (0, 0), None).unwrap());
        assert!(!plate.check_outside(&model, (1, 0), None).unwrap());
    }

    #[test]
    fn test_sunk_instance_is_not_outside() {
        let model = cube_model(&[Vec3::new(100.0, 100.0, -4.0)]);
        assert!(!plate().check_outside(&model, (0, 0), None).unwrap());
    }

    #[test]
    fn test_ready_flag_follows_outside_instances() {
        let model = cube_model(&[
            Vec3::new(50.0, 50.0, 0.0),
            Vec3::new(215.0, 50.0, 0.0),
            Vec3::new(100.0, 100.0, 0.0),
        ]);
        let mut plate = plate();
        plate.add_instance(&model, (0, 0), None).unwrap();
        assert!(plate.is_ready_for_slice());
        plate.add_instance(&model, (1, 0), None).unwrap();
        plate.add_instance(&model, (2, 0), None).unwrap();
        assert!(!plate.is_ready_for_slice());
        assert!(!plate.contain_instance_totally((1, 0)));

        plate.remove_instance((1, 0)).unwrap();
        assert!(plate.is_ready_for_slice());
        assert_eq!(plate.printable_instance_size(&model), 2);
    }

    #[test]
    fn test_add_invalid_instance_fails() {
        let model = cube_model(&[Vec3::new(50.0, 50.0, 0.0)]);
        let mut plate = plate();
        assert!(matches!(
            plate.add_instance(&model, (0, 3), None),
            Err(PlateError::InvalidInstance { object: 0, instance: 3 })
        ));
        assert!(plate.empty());
        assert!(matches!(
            plate.remove_instance((0, 0)),
            Err(PlateError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn test_update_object_index() {
        let model = cube_model(&[Vec3::new(20.0, 20.0, 0.0); 5]);
        let mut plate = plate();
        for o in 0..5 {
            plate.add_instance(&model, (o, 0), None).unwrap();
        }
        plate.update_object_index(2);
        let keys: Vec<InstanceKey> = plate.instances().iter().copied().collect();
        assert_eq!(keys, vec![(0, 0), (1, 0), (2, 0), (3, 0)]);
    }

    #[test]
    fn test_center_and_move_with_plate() {
        let mut model = cube_model(&[Vec3::new(0.0, 0.0, 0.0)]);
        let mut plate = plate();
        plate.add_instance_centered(&mut model, (0, 0)).unwrap();
        approx::assert_relative_eq!(model.objects[0].instances[0].offset.x, 110.0);

        plate.set_pos_and_size(Vec3::new(264.0, 0.0, 0.0), 220.0, 220.0, 250.0, Some(&mut model), false);
        approx::assert_relative_eq!(model.objects[0].instances[0].offset.x, 374.0);
        assert!(plate.contain_instance((0, 0)));
    }

    #[test]
    fn test_filament_map_mode_change_drops_map() {
        let global = DynamicConfig::defaults();
        let mut plate = plate();
        plate.set_filament_maps(&[1, 2]);
        // Resolves to the global mode, so the map stays.
        plate.set_filament_map_mode(FilamentMapMode::AutoForFlush, &global);
        assert_eq!(plate.get_filament_maps(), vec![1, 2]);

        plate.set_filament_map_mode(FilamentMapMode::Manual, &global);
        assert!(plate.get_filament_maps().is_empty());
        assert_eq!(plate.get_real_filament_map_mode(&global), FilamentMapMode::Manual);

        plate.set_filament_map_mode(FilamentMapMode::Default, &global);
        assert_eq!(plate.get_filament_map_mode(), FilamentMapMode::Default);
        assert_eq!(plate.get_real_filament_map_mode(&global), FilamentMapMode::AutoForFlush);
    }

    #[test]
    fn test_filament_count_edits() {
        let mut plate = plate();
        plate.set_filament_maps(&[1, 2, 2]);
        plate.on_filament_added();
        assert_eq!(plate.get_filament_maps(), vec![1, 2, 2, 1]);
        plate.on_filament_deleted(1);
        assert_eq!(plate.get_filament_maps(), vec![1, 2, 1]);
        plate.set_filament_count(2);
        assert_eq!(plate.get_filament_maps(), vec![1, 2]);
        plate.on_extruder_count_changed(1);
        assert!(plate.get_filament_maps().is_empty());
    }

    #[test]
    fn test_bed_type_change_invalidates_result() {
        let global = DynamicConfig::defaults();
        let mut plate = plate();
        plate.update_slice_result_valid_state(true);
        // Same as the global bed type.
        plate.set_bed_type(BedType::TexturedPlate, &global);
        assert!(plate.is_slice_result_valid());
        plate.set_bed_type(BedType::CoolPlate, &global);
        assert!(!plate.is_slice_result_valid());
        assert_eq!(plate.get_real_bed_type(&global), BedType::CoolPlate);
        assert_eq!(plate.build_config(&global).opt_string(BED_TYPE_KEY).unwrap(), "cool_plate");
    }

    #[test]
    fn test_get_extruders_includes_support() {
        let mut model = cube_model(&[Vec3::new(50.0, 50.0, 0.0)]);
        model.objects[0].config.set("enable_support", true);
        model.objects[0].config.set("support_filament", 2i64);
        let mut plate = plate();
        plate.add_instance(&model, (0, 0), None).unwrap();
        assert_eq!(plate.get_extruders(&model, &DynamicConfig::defaults()), vec![1, 2]);
    }

    #[test]
    fn test_physical_extruder_lookup() {
        let mut global = DynamicConfig::defaults();
        global.set("filament_map", vec![1i64, 2]);
        let plate = plate();
        assert_eq!(plate.get_physical_extruder_by_filament_id(&global, 2), Some(1));
        global.set("physical_extruder_map", vec![1i64, 0]);
        assert_eq!(plate.get_physical_extruder_by_filament_id(&global, 2), Some(0));
        assert_eq!(plate.get_physical_extruder_by_filament_id(&global, 5), None);
    }
}
