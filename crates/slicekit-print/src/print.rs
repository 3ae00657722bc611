//! The whole-plate print: applying a model, running every step and handing
//! the result to a G-code backend.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slicekit_config::{is_print_key, DynamicConfig, PrintSequence};
use slicekit_math::{overlaps, ExPolygon, Polygon, Transform, Vec2, Vec3, EPSILON};
use slicekit_model::{MeshSlicer, Model, ModelObject, ObjectId, PlanarSlicer};
use tracing::{debug, info, warn};

use crate::compat::{check_mixture_of_pla_and_petg, filament_type, get_compatible_filament_type, get_filament_temp_type};
use crate::conflict::{find_conflict, ConflictResult};
use crate::error::{PrintError, PrintWarning, Result};
use crate::gcode::{GCodeExporter, GCodeProcessorResult};
use crate::invalidation::{object_steps_for_options, print_steps_for_options};
use crate::layer::{ExtrusionEntityCollection, Layer, SupportLayer};
use crate::pipeline::PipelineConfig;
use crate::print_object::{object_config, PrintInstance, PrintObject, StepContext};
use crate::region::{PrintObjectRegions, RegionAssigner};
use crate::skirt_brim::{first_layer_convex_hull, make_brims, make_skirt};
use crate::slicing::SlicingParameters;
use crate::statistics::PrintStatistics;
use crate::step::{print_closure_of_object, CancelToken, PipelineStep, PrintObjectStep, PrintStep, StepState};
use crate::tool_ordering::ToolOrdering;
use crate::wipe_tower::{has_wipe_tower, WipeTowerData};

const EMPTY_PRINT: &str = "Nothing to be sliced, either the print is empty or no object is fully inside the print volume";

/// What [`Print::apply`] did to the existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    /// Nothing changed.
    Unchanged,
    /// Something changed without clearing any finished step.
    Changed,
    /// At least one finished step was cleared.
    Invalidated,
}

#[derive(Serialize)]
struct ObjectCacheRef<'a> {
    fingerprint: u64,
    layers: &'a [Layer],
    support_layers: &'a [SupportLayer],
    slicing_params: &'a SlicingParameters,
    done_steps: Vec<PrintObjectStep>,
}

#[derive(Deserialize)]
struct ObjectCache {
    fingerprint: u64,
    layers: Vec<Layer>,
    support_layers: Vec<SupportLayer>,
    slicing_params: SlicingParameters,
    done_steps: Vec<PrintObjectStep>,
}

type CancelCallback = Box<dyn Fn() + Send + Sync>;

/// Every object of one plate and the whole-plate results.
pub struct Print {
    model: Model,
    config: DynamicConfig,
    objects: Vec<PrintObject>,
    state: StepState<PrintStep>,
    cancel: CancelToken,
    cancel_callback: Option<CancelCallback>,
    slicer: Arc<dyn MeshSlicer>,
    plate_index: usize,
    plate_origin: Vec3,
    tool_ordering: ToolOrdering,
    wipe_tower_data: WipeTowerData,
    statistics: PrintStatistics,
    skirt: ExtrusionEntityCollection,
    brim: BTreeMap<ObjectId, ExtrusionEntityCollection>,
    first_layer_convex_hull: Polygon,
    conflict_result: Option<ConflictResult>,
    warnings: Vec<PrintWarning>,
}

impl fmt::Debug for Print {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Print")
            .field("plate_index", &self.plate_index)
            .field("objects", &self.objects.len())
            .field("done", &self.state.done_steps())
            .field("warnings", &self.warnings.len())
            .finish_non_exhaustive()
    }
}

impl Default for Print {
    fn default() -> Self {
        Self::new()
    }
}

impl Print {
    /// Empty print slicing with [`PlanarSlicer`].
    pub fn new() -> Self {
        Self::with_slicer(Arc::new(PlanarSlicer))
    }

    /// Empty print slicing with `slicer`.
    pub fn with_slicer(slicer: Arc<dyn MeshSlicer>) -> Self {
        Self {
            model: Model::default(),
            config: DynamicConfig::defaults(),
            objects: Vec::new(),
            state: StepState::new(),
            cancel: CancelToken::new(),
            cancel_callback: None,
            slicer,
            plate_index: 0,
            plate_origin: Vec3::zeros(),
            tool_ordering: ToolOrdering::default(),
            wipe_tower_data: WipeTowerData::default(),
            statistics: PrintStatistics::default(),
            skirt: ExtrusionEntityCollection::new(),
            brim: BTreeMap::new(),
            first_layer_convex_hull: Polygon::default(),
            conflict_result: None,
            warnings: Vec::new(),
        }
    }

    /// Called synchronously before any mutation, so a background worker can
    /// stop at a step boundary first.
    pub fn set_cancel_callback(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.cancel_callback = Some(Box::new(callback));
    }

    /// Flag checked between steps.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn call_cancel_callback(&self) {
        if let Some(cb) = &self.cancel_callback {
            cb();
        }
    }

    /// Index of the plate this print belongs to.
    pub fn plate_index(&self) -> usize {
        self.plate_index
    }

    /// Select the per-plate entries of plate-indexed options.
    pub fn set_plate_index(&mut self, index: usize) {
        if self.plate_index != index {
            self.plate_index = index;
            self.invalidate_print_step(PrintStep::WipeTower);
        }
    }

    /// Full print config.
    pub fn config(&self) -> &DynamicConfig {
        &self.config
    }

    /// Model the print was last applied from.
    pub fn model(&self) -> &Model {
        &self.model
    }

    fn invalidate_print_step(&mut self, step: PrintStep) -> bool {
        let changed = self.state.invalidate(step);
        if changed {
            debug!(?step, "invalidated print step");
        }
        changed
    }

    /// Bring the print in line with `model` and `config`.
    ///
    /// `instance_filter` restricts the print to the given `(object index,
    /// instance index)` pairs, which is how a plate selects its instances.
    /// Only steps whose inputs changed are cleared. Objects whose layering
    /// cannot be resolved are dropped with a warning.
    pub fn apply(
        &mut self,
        model: &Model,
        instance_filter: Option<&BTreeSet<(usize, usize)>>,
        config: &DynamicConfig,
    ) -> Result<ApplyStatus> {
        self.call_cancel_callback();
        self.cancel.reset();
        self.warnings.clear();

        let mut invalidated = false;
        let mut changed = false;

        let print_keys: Vec<String> = self
            .config
            .diff(config)
            .into_iter()
            .filter(|k| is_print_key(k))
            .collect();
        for step in print_steps_for_options(print_keys.iter().map(String::as_str)) {
            invalidated |= self.invalidate_print_step(step);
        }
        changed |= !print_keys.is_empty();

        let old_ids: Vec<ObjectId> = self.objects.iter().map(PrintObject::id).collect();
        let mut old: Vec<Option<PrintObject>> = self.objects.drain(..).map(Some).collect();
        let mut objects: Vec<PrintObject> = Vec::new();
        let mut region_cache: Vec<(ObjectId, Transform, Arc<PrintObjectRegions>)> = Vec::new();
        let mut print_steps: BTreeSet<PrintStep> = BTreeSet::new();

        for (obj_idx, model_object) in model.objects.iter().enumerate() {
            for (trafo, trafo_bboxes, instances) in group_instances(model_object, obj_idx, instance_filter, &self.plate_origin) {
                let reused = old.iter_mut().find_map(|slot| {
                    let hit = slot
                        .as_ref()
                        .is_some_and(|po| po.id() == model_object.id && same_placement(po.trafo(), &trafo));
                    if hit {
                        slot.take()
                    } else {
                        None
                    }
                });
                let mut po = match reused {
                    Some(mut po) => {
                        if po.set_instances(instances) {
                            changed = true;
                            print_steps.insert(PrintStep::SkirtBrim);
                        }
                        if po.update_model_hashes(model_object) {
                            invalidated = true;
                            print_steps.insert(PrintStep::WipeTower);
                        }
                        let new_config = object_config(config, model_object);
                        let keys = po.config().diff(&new_config);
                        if !keys.is_empty() {
                            changed = true;
                            for step in object_steps_for_options(keys.iter().map(String::as_str)) {
                                print_steps.extend(print_closure_of_object(step));
                            }
                            invalidated |= po.invalidate_state_by_config_options(&new_config, None);
                        }
                        po
                    }
                    None => {
                        debug!(object = %model_object.id, name = %model_object.name, "created print object");
                        changed = true;
                        print_steps.insert(PrintStep::WipeTower);
                        PrintObject::new(model_object, trafo, instances, config)
                    }
                };

                invalidated |= assign_regions(&mut po, model_object, &trafo_bboxes, &mut region_cache, &mut print_steps);

                let sliced = po.is_step_done(PrintObjectStep::Slice);
                match po.update_slicing_parameters(model_object) {
                    Ok(true) => {
                        invalidated |= sliced;
                        print_steps.extend(print_closure_of_object(PrintObjectStep::Slice));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(object = %model_object.id, error = %e, "dropping object with invalid layering");
                        self.warnings.push(PrintWarning {
                            object_id: model_object.id,
                            message: e.to_string(),
                        });
                        print_steps.insert(PrintStep::WipeTower);
                        continue;
                    }
                }
                objects.push(po);
            }
        }

        if old.iter().any(Option::is_some) {
            for po in old.into_iter().flatten() {
                debug!(object = %po.id(), "removed print object");
            }
            print_steps.insert(PrintStep::WipeTower);
            changed = true;
        }
        let new_ids: Vec<ObjectId> = objects.iter().map(PrintObject::id).collect();
        if new_ids != old_ids {
            print_steps.insert(PrintStep::WipeTower);
            changed = true;
        }

        // Identical copies reuse the layers of the first one.
        for i in 0..objects.len() {
            let fingerprint = objects[i].fingerprint();
            let source = (0..i).find(|&j| objects[j].shared_object().is_none() && objects[j].fingerprint() == fingerprint);
            let before = objects[i].is_step_done(PrintObjectStep::Slice);
            objects[i].set_shared_object(source);
            invalidated |= before && !objects[i].is_step_done(PrintObjectStep::Slice);
        }

        self.objects = objects;
        for step in print_steps {
            invalidated |= self.invalidate_print_step(step);
        }
        self.model = model.clone();
        self.config = config.clone();

        let status = if invalidated {
            ApplyStatus::Invalidated
        } else if changed {
            ApplyStatus::Changed
        } else {
            ApplyStatus::Unchanged
        };
        info!(objects = self.objects.len(), ?status, "applied model to print");
        Ok(status)
    }

    /// Run every pending step: object steps in parallel, then the
    /// whole-plate steps up to skirt and brim.
    ///
    /// Stops at the first failing object with its error. Finished steps stay
    /// finished when canceled.
    pub fn process(&mut self) -> Result<()> {
        if self.objects.iter().all(|o| o.instances().is_empty()) {
            return Err(PrintError::Plate(EMPTY_PRINT.to_string()));
        }
        let pipeline = PipelineConfig::from_config(&self.config)?;
        info!(plate = self.plate_index, objects = self.objects.len(), "processing print");

        {
            let model = &self.model;
            let slicer = self.slicer.as_ref();
            let cancel = &self.cancel;
            let results: Vec<Result<()>> = self
                .objects
                .par_iter_mut()
                .filter(|po| po.shared_object().is_none())
                .map(|po| {
                    let (_, model_object) = model
                        .find_object(po.id())
                        .ok_or_else(|| PrintError::object(po.id(), "model object is gone"))?;
                    let ctx = StepContext {
                        model_object,
                        pipeline: &pipeline,
                        slicer,
                        cancel,
                    };
                    po.process(&ctx)
                })
                .collect();
            results.into_iter().collect::<Result<Vec<()>>>()?;
        }

        for i in 0..self.objects.len() {
            let Some(j) = self.objects[i].shared_object().filter(|&j| j < i) else {
                continue;
            };
            let (left, right) = self.objects.split_at_mut(i);
            if !right[0].is_step_done(PrintObjectStep::SimplifySupportPath) {
                right[0].copy_layers_from_shared_object(&left[j]);
            }
        }

        self.cancel.check()?;
        if self.state.set_started(PrintStep::WipeTower) {
            debug!("print step started: wipe tower");
            self.tool_ordering = ToolOrdering::new(&self.objects, pipeline.sequential());
            self.wipe_tower_data = if has_wipe_tower(&pipeline, self.tool_ordering.all_extruders().len()) {
                WipeTowerData::plan(&self.tool_ordering, &self.config, self.plate_index)?
            } else {
                WipeTowerData::default()
            };
            self.state.set_done(PrintStep::WipeTower);
        }

        self.cancel.check()?;
        if self.state.set_started(PrintStep::SkirtBrim) {
            debug!("print step started: skirt and brim");
            let first_layer_height = self
                .objects
                .iter()
                .filter(|o| o.slicing_parameters().valid)
                .map(|o| o.slicing_parameters().first_print_layer_height)
                .fold(f64::INFINITY, f64::min);
            let first_layer_height = if first_layer_height.is_finite() {
                first_layer_height
            } else {
                self.config.opt_float("initial_layer_print_height")?
            };
            self.brim = make_brims(&self.objects, first_layer_height)?;
            let tower = (!self.wipe_tower_data.is_empty()).then_some(&self.wipe_tower_data);
            self.first_layer_convex_hull = first_layer_convex_hull(&self.objects, &self.brim, tower);
            self.skirt = make_skirt(&self.first_layer_convex_hull, &self.config, first_layer_height)?;
            self.statistics = PrintStatistics::compute(
                &self.objects,
                &self.skirt,
                &self.brim,
                tower,
                &self.tool_ordering,
                &self.config,
            )?;
            self.state.set_done(PrintStep::SkirtBrim);
        }
        info!(plate = self.plate_index, "print processed");
        Ok(())
    }

    /// Check the print before processing.
    ///
    /// Fatal problems come back as errors scoped to an object or the plate.
    /// Non-fatal ones are added to [`Print::warnings`].
    pub fn validate(&mut self) -> Result<()> {
        let instances = self.num_object_instances();
        if instances == 0 {
            return Err(PrintError::Plate(EMPTY_PRINT.to_string()));
        }

        let printable_height = self.config.opt_float("printable_height")?;
        for po in &self.objects {
            if po.max_z() > printable_height + EPSILON {
                return Err(PrintError::InvalidConfig {
                    object_id: Some(po.id()),
                    message: format!("The object is taller than the printable height of {printable_height} mm"),
                });
            }
        }

        let pipeline = PipelineConfig::from_config(&self.config)?;
        if pipeline.spiral_mode && instances > 1 {
            return Err(PrintError::Plate(
                "Spiral vase mode does not work with more than one object or instance".to_string(),
            ));
        }
        if pipeline.print_sequence == PrintSequence::ByObject {
            self.validate_sequential()?;
        }

        let used: BTreeSet<u32> = self.extruders();
        let types: Vec<String> = used.iter().map(|&f| filament_type(&self.config, f)).collect();
        if get_compatible_filament_type(types.iter().map(|t| get_filament_temp_type(t))).is_none() {
            warn!(?types, "filament temperature classes do not mix");
            return Err(PrintError::Incompatible(
                "Cannot print multiple filaments which have large difference of temperature together. \
                 Otherwise, the extruder and nozzle may be blocked or damaged during printing"
                    .to_string(),
            ));
        }

        for po in &self.objects {
            let types: Vec<String> = po
                .object_extruders()
                .iter()
                .map(|&f| filament_type(&self.config, f))
                .collect();
            if !check_mixture_of_pla_and_petg(&types) {
                self.warnings.push(PrintWarning {
                    object_id: po.id(),
                    message: "PLA and PETG in one object may not bond well".to_string(),
                });
            }
        }
        Ok(())
    }

    fn validate_sequential(&self) -> Result<()> {
        let radius = self.config.opt_float("extruder_clearance_radius")?;
        let height_to_rod = self.config.opt_float("extruder_clearance_height_to_rod")?;

        let mut hulls: Vec<(ObjectId, ExPolygon)> = Vec::new();
        for po in &self.objects {
            let Some((_, model_object)) = self.model.find_object(po.id()) else {
                continue;
            };
            for instance in po.instances() {
                let hull = model_object
                    .instance_convex_hull(instance.id)
                    .map_err(|e| PrintError::object(po.id(), e.to_string()))?;
                if let Some(grown) = hull.offset(-radius / 2.0) {
                    hulls.push((po.id(), ExPolygon::new(grown)));
                }
            }
        }
        for (i, (_, a)) in hulls.iter().enumerate() {
            for (_, b) in &hulls[i + 1..] {
                if overlaps(std::slice::from_ref(a), std::slice::from_ref(b), EPSILON) {
                    return Err(PrintError::Plate(
                        "Some objects are too close; the extruder will collide with them.".to_string(),
                    ));
                }
            }
        }

        let last = self.objects.len().saturating_sub(1);
        if self.objects[..last].iter().any(|po| po.max_z() > height_to_rod + EPSILON) {
            return Err(PrintError::Plate(
                "Some objects are too tall and cannot be printed without extruder collisions.".to_string(),
            ));
        }
        Ok(())
    }

    /// Hand the processed print to `exporter`, then look for colliding paths.
    ///
    /// A collision is reported as [`PrintError::Conflict`] after the file was
    /// written.
    pub fn export_gcode(&mut self, path: &Path, exporter: &dyn GCodeExporter) -> Result<GCodeProcessorResult> {
        if !self.state.is_done(PrintStep::SLICING_FINISHED) {
            return Err(PrintError::Plate("The print has not been processed".to_string()));
        }
        self.state.set_started(PrintStep::GCodeExport);
        let result = exporter.export(self, path)?;
        self.state.set_done(PrintStep::GCodeExport);

        if self.state.set_started(PrintStep::ConflictCheck) {
            let tower = (!self.wipe_tower_data.is_empty()).then_some(&self.wipe_tower_data);
            self.conflict_result = find_conflict(&self.objects, tower);
            self.state.set_done(PrintStep::ConflictCheck);
        }
        if let Some(c) = &self.conflict_result {
            return Err(PrintError::Conflict {
                object1: c.object1.clone(),
                object2: c.object2.clone(),
                height: c.height,
            });
        }
        Ok(result)
    }

    /// Write the layers of every object to `dir`.
    pub fn export_cached_data(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| PrintError::Cache(format!("{}: {e}", dir.display())))?;
        for (i, po) in self.objects.iter().enumerate() {
            let path = dir.join(format!("object_{i}.json"));
            let entry = ObjectCacheRef {
                fingerprint: po.fingerprint(),
                layers: po.layers(),
                support_layers: po.support_layers(),
                slicing_params: po.slicing_parameters(),
                done_steps: po.state().done_steps(),
            };
            let file = fs::File::create(&path).map_err(|e| PrintError::Cache(format!("{}: {e}", path.display())))?;
            serde_json::to_writer(std::io::BufWriter::new(file), &entry)?;
        }
        info!(dir = %dir.display(), objects = self.objects.len(), "exported cached data");
        Ok(())
    }

    /// Restore object layers written by [`Print::export_cached_data`].
    ///
    /// All or nothing: a missing, unreadable or stale entry for any object
    /// leaves the print untouched and returns false.
    pub fn load_cached_data(&mut self, dir: &Path) -> bool {
        self.call_cancel_callback();
        let mut entries = Vec::with_capacity(self.objects.len());
        for (i, po) in self.objects.iter().enumerate() {
            let path = dir.join(format!("object_{i}.json"));
            let entry: ObjectCache = match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
            {
                Ok(entry) => entry,
                Err(reason) => {
                    debug!(path = %path.display(), %reason, "cache miss");
                    return false;
                }
            };
            if entry.fingerprint != po.fingerprint() {
                debug!(object = %po.id(), "cache miss: inputs changed");
                return false;
            }
            entries.push(entry);
        }
        if entries.is_empty() {
            return false;
        }
        for (po, entry) in self.objects.iter_mut().zip(entries) {
            po.restore_cached(entry.layers, entry.support_layers, entry.slicing_params, &entry.done_steps);
        }
        self.invalidate_print_step(PrintStep::WipeTower);
        info!(dir = %dir.display(), objects = self.objects.len(), "loaded cached data");
        true
    }

    /// Drop every object and result.
    pub fn clear(&mut self) {
        self.call_cancel_callback();
        self.objects.clear();
        self.model = Model::default();
        self.state.invalidate_all();
        self.tool_ordering = ToolOrdering::default();
        self.wipe_tower_data = WipeTowerData::default();
        self.statistics.clear();
        self.skirt.clear();
        self.brim.clear();
        self.first_layer_convex_hull = Polygon::default();
        self.conflict_result = None;
        self.warnings.clear();
        debug!(plate = self.plate_index, "cleared print");
    }

    /// True once whole-plate `step` finished.
    pub fn is_step_done(&self, step: PrintStep) -> bool {
        self.state.is_done(step)
    }

    /// True once `step` finished for every object.
    pub fn is_object_step_done(&self, step: PrintObjectStep) -> bool {
        !self.objects.is_empty() && self.objects.iter().all(|o| o.is_step_done(step))
    }

    /// True once all geometry is final.
    pub fn finished(&self) -> bool {
        PrintObjectStep::ALL.iter().all(|&s| self.is_object_step_done(s))
            && self.is_step_done(PrintStep::SLICING_FINISHED)
    }

    /// Print object built from model object `id`.
    pub fn get_object(&self, id: ObjectId) -> Option<&PrintObject> {
        self.objects.iter().find(|o| o.id() == id)
    }

    /// Print objects in model order.
    pub fn objects(&self) -> &[PrintObject] {
        &self.objects
    }

    /// Distinct region layouts in use.
    pub fn regions(&self) -> Vec<Arc<PrintObjectRegions>> {
        let mut out: Vec<Arc<PrintObjectRegions>> = Vec::new();
        for r in self.objects.iter().filter_map(PrintObject::regions) {
            if !out.iter().any(|o| Arc::ptr_eq(o, r)) {
                out.push(Arc::clone(r));
            }
        }
        out
    }

    /// Instances over all objects.
    pub fn num_object_instances(&self) -> usize {
        self.objects.iter().map(|o| o.instances().len()).sum()
    }

    /// 1-based filaments used by any object.
    pub fn extruders(&self) -> BTreeSet<u32> {
        self.objects.iter().flat_map(PrintObject::object_extruders).collect()
    }

    /// True when the print gets a purge tower.
    pub fn has_wipe_tower(&self) -> bool {
        PipelineConfig::from_config(&self.config)
            .map(|p| has_wipe_tower(&p, self.extruders().len()))
            .unwrap_or(false)
    }

    /// True when a skirt is configured.
    pub fn has_skirt(&self) -> bool {
        self.config.opt_int("skirt_loops").unwrap_or(0) > 0
    }

    /// True when any object gets a brim.
    pub fn has_brim(&self) -> bool {
        self.objects.iter().any(PrintObject::has_brim)
    }

    /// Move the plate origin; instance shifts are plate-relative.
    pub fn set_plate_origin(&mut self, origin: Vec3) {
        let delta = Vec2::new(origin.x - self.plate_origin.x, origin.y - self.plate_origin.y);
        self.plate_origin = origin;
        if delta.norm() < EPSILON {
            return;
        }
        for po in &mut self.objects {
            let moved: Vec<PrintInstance> = po
                .instances()
                .iter()
                .map(|i| PrintInstance {
                    shift: i.shift - delta,
                    ..i.clone()
                })
                .collect();
            po.set_instances(moved);
        }
        self.invalidate_print_step(PrintStep::SkirtBrim);
    }

    /// Hull of the first layer, skirt excluded.
    pub fn first_layer_convex_hull(&self) -> &Polygon {
        &self.first_layer_convex_hull
    }

    /// Filament order per layer.
    pub fn tool_ordering(&self) -> &ToolOrdering {
        &self.tool_ordering
    }

    /// Purge tower plan.
    pub fn wipe_tower_data(&self) -> &WipeTowerData {
        &self.wipe_tower_data
    }

    /// Filament usage totals.
    pub fn print_statistics(&self) -> &PrintStatistics {
        &self.statistics
    }

    /// Skirt loops.
    pub fn skirt(&self) -> &ExtrusionEntityCollection {
        &self.skirt
    }

    /// Brim loops per object.
    pub fn brim(&self) -> &BTreeMap<ObjectId, ExtrusionEntityCollection> {
        &self.brim
    }

    /// Collision found by the last conflict check.
    pub fn conflict_result(&self) -> Option<&ConflictResult> {
        self.conflict_result.as_ref()
    }

    /// Human readable form of [`Print::conflict_result`].
    pub fn get_conflict_string(&self) -> Option<String> {
        self.conflict_result
            .as_ref()
            .map(|c| format!("Found gcode path conflicts between object {} and {}", c.object1, c.object2))
    }

    /// Non-fatal object problems from the last apply or validate.
    pub fn warnings(&self) -> &[PrintWarning] {
        &self.warnings
    }
}

fn same_placement(a: &Transform, b: &Transform) -> bool {
    a.linear_eq(b, EPSILON) && (a.translation_part() - b.translation_part()).norm() <= EPSILON
}

/// Printable instances of `model_object` grouped by placement without the XY
/// offset: `(trafo, trafo_bboxes, instances)`.
fn group_instances(
    model_object: &ModelObject,
    obj_idx: usize,
    filter: Option<&BTreeSet<(usize, usize)>>,
    plate_origin: &Vec3,
) -> Vec<(Transform, Transform, Vec<PrintInstance>)> {
    let mut groups: Vec<(Transform, Transform, Vec<PrintInstance>)> = Vec::new();
    for (idx, instance) in model_object.instances.iter().enumerate() {
        if !instance.printable || filter.is_some_and(|f| !f.contains(&(obj_idx, idx))) {
            continue;
        }
        let mut trafo = instance.transformation();
        trafo.matrix[(0, 3)] = 0.0;
        trafo.matrix[(1, 3)] = 0.0;
        let print_instance = PrintInstance {
            model_instance_id: instance.id,
            shift: Vec2::new(instance.offset.x - plate_origin.x, instance.offset.y - plate_origin.y),
            id: idx,
        };
        match groups.iter_mut().find(|(t, _, _)| same_placement(t, &trafo)) {
            Some((_, _, list)) => list.push(print_instance),
            None => {
                // Regions ignore the Z rotation so rotated copies share them.
                let rotation = Vec3::new(instance.rotation.x, instance.rotation.y, 0.0);
                let trafo_bboxes =
                    Transform::from_parts(&Vec3::new(0.0, 0.0, instance.offset.z), &rotation, &instance.scale);
                groups.push((trafo, trafo_bboxes, vec![print_instance]));
            }
        }
    }
    groups
}

/// Give `po` its region layout, reusing a snapshot equal to the one it has
/// or one another print object of the same model object already built.
/// Returns true when finished steps were cleared.
fn assign_regions(
    po: &mut PrintObject,
    model_object: &ModelObject,
    trafo_bboxes: &Transform,
    cache: &mut Vec<(ObjectId, Transform, Arc<PrintObjectRegions>)>,
    print_steps: &mut BTreeSet<PrintStep>,
) -> bool {
    let cached = cache
        .iter()
        .find(|(id, t, _)| *id == model_object.id && same_placement(t, trafo_bboxes))
        .map(|(_, _, r)| Arc::clone(r));
    let fresh = cached.unwrap_or_else(|| Arc::new(RegionAssigner::new(po.config()).assign(model_object, trafo_bboxes)));

    let mut invalidated = false;
    let regions = match po.regions().cloned() {
        Some(current) if *current == *fresh => current,
        Some(current) => {
            if current.same_layout(&fresh) {
                let keys = current.changed_region_keys(&fresh);
                for step in object_steps_for_options(keys.iter().map(String::as_str)) {
                    print_steps.extend(print_closure_of_object(step));
                    invalidated |= po.invalidate_step(step);
                }
            } else {
                print_steps.extend(print_closure_of_object(PrintObjectStep::Slice));
                invalidated |= po.invalidate_step(PrintObjectStep::Slice);
            }
            debug!(object = %model_object.id, regions = fresh.num_regions(), "rebuilt regions");
            fresh
        }
        None => fresh,
    };
    if !cache.iter().any(|(_, _, r)| Arc::ptr_eq(r, &regions)) {
        cache.push((model_object.id, trafo_bboxes.clone(), Arc::clone(&regions)));
    }
    po.set_regions(regions);
    invalidated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::ToolpathDumpExporter;
    use slicekit_math::Point3;
    use slicekit_model::{ModelInstance, ModelVolume, TriangleMesh};

    fn cube(name: &str, size: f64, at: Vec3) -> ModelObject {
        let mut object = ModelObject::new(name);
        object.add_volume(ModelVolume::new("part", TriangleMesh::cuboid(Point3::origin(), [size, size, size])));
        object.add_instance(ModelInstance::new(at));
        object
    }

    fn model_with(objects: Vec<ModelObject>) -> Model {
        let mut model = Model::new();
        for o in objects {
            model.add_object(o);
        }
        model
    }

    #[test]
    fn test_apply_then_unchanged() {
        let model = model_with(vec![cube("a", 10.0, Vec3::new(50.0, 50.0, 0.0))]);
        let config = DynamicConfig::defaults();
        let mut print = Print::new();
        assert_eq!(print.apply(&model, None, &config).unwrap(), ApplyStatus::Changed);
        assert_eq!(print.objects().len(), 1);
        assert_eq!(print.apply(&model, None, &config).unwrap(), ApplyStatus::Unchanged);
    }

    #[test]
    fn test_instances_differing_by_xy_share_an_object() {
        let mut object = cube("a", 10.0, Vec3::new(50.0, 50.0, 0.0));
        object.add_instance(ModelInstance::new(Vec3::new(80.0, 50.0, 0.0)));
        let mut rotated = ModelInstance::new(Vec3::new(110.0, 50.0, 0.0));
        rotated.rotation.z = std::f64::consts::FRAC_PI_2;
        object.add_instance(rotated);
        let model = model_with(vec![object]);
        let mut print = Print::new();
        print.apply(&model, None, &DynamicConfig::defaults()).unwrap();

        assert_eq!(print.objects().len(), 2);
        assert_eq!(print.num_object_instances(), 3);
        // The Z rotation changes the layers but not the regions.
        assert_eq!(print.regions().len(), 1);
    }

    #[test]
    fn test_instance_filter() {
        let mut object = cube("a", 10.0, Vec3::new(50.0, 50.0, 0.0));
        object.add_instance(ModelInstance::new(Vec3::new(80.0, 50.0, 0.0)));
        let model = model_with(vec![object]);
        let filter: BTreeSet<(usize, usize)> = [(0, 1)].into_iter().collect();
        let mut print = Print::new();
        print.apply(&model, Some(&filter), &DynamicConfig::defaults()).unwrap();
        assert_eq!(print.num_object_instances(), 1);
        assert_eq!(print.objects()[0].instances()[0].id, 1);
    }

    #[test]
    fn test_single_filament_validates_without_warnings() {
        let model = model_with(vec![cube("a", 10.0, Vec3::new(50.0, 50.0, 0.0))]);
        let mut print = Print::new();
        print.apply(&model, None, &DynamicConfig::defaults()).unwrap();
        print.validate().unwrap();
        assert!(print.warnings().is_empty(), "{:?}", print.warnings());
    }

    #[test]
    fn test_pla_and_petg_in_one_object_warns() {
        let mut object = cube("mixed", 10.0, Vec3::new(50.0, 50.0, 0.0));
        let mut petg = ModelVolume::new("petg", TriangleMesh::cuboid(Point3::new(10.0, 0.0, 0.0), [10.0, 10.0, 10.0]));
        petg.config.set(slicekit_config::VOLUME_EXTRUDER_KEY, 2i64);
        object.add_volume(petg);
        let model = model_with(vec![object, cube("plain", 10.0, Vec3::new(120.0, 50.0, 0.0))]);
        let mut config = DynamicConfig::defaults();
        config.set("filament_type", vec!["PLA", "PETG"]);

        let mut print = Print::new();
        print.apply(&model, None, &config).unwrap();
        print.validate().unwrap();

        let warnings = print.warnings();
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        assert_eq!(warnings[0].object_id, model.objects[0].id);
        assert!(warnings[0].message.contains("PLA and PETG"));
    }

    #[test]
    fn test_process_reaches_skirt_brim() {
        let model = model_with(vec![cube("a", 10.0, Vec3::new(50.0, 50.0, 0.0))]);
        let mut print = Print::new();
        print.apply(&model, None, &DynamicConfig::defaults()).unwrap();
        print.validate().unwrap();
        print.process().unwrap();

        assert!(print.finished());
        assert!(print.is_step_done(PrintStep::SkirtBrim));
        assert!(!print.is_step_done(PrintStep::GCodeExport));
        assert!(!print.has_wipe_tower());
        assert!(print.print_statistics().total_used_filament > 0.0);
        assert!(print.first_layer_convex_hull().len() >= 4);
    }

    #[test]
    fn test_config_edit_keeps_slices() {
        let model = model_with(vec![cube("a", 10.0, Vec3::new(50.0, 50.0, 0.0))]);
        let mut config = DynamicConfig::defaults();
        let mut print = Print::new();
        print.apply(&model, None, &config).unwrap();
        print.process().unwrap();

        config.set("wall_loops", 3i64);
        assert_eq!(print.apply(&model, None, &config).unwrap(), ApplyStatus::Invalidated);
        assert!(print.is_object_step_done(PrintObjectStep::Slice));
        assert!(!print.is_object_step_done(PrintObjectStep::Perimeters));
        assert!(!print.is_step_done(PrintStep::SkirtBrim));
    }

    #[test]
    fn test_moving_instance_only_touches_skirt_brim() {
        let mut model = model_with(vec![cube("a", 10.0, Vec3::new(50.0, 50.0, 0.0))]);
        let config = DynamicConfig::defaults();
        let mut print = Print::new();
        print.apply(&model, None, &config).unwrap();
        print.process().unwrap();

        model.objects[0].instances[0].set_offset(Vec3::new(70.0, 50.0, 0.0));
        print.apply(&model, None, &config).unwrap();
        assert!(print.is_object_step_done(PrintObjectStep::SimplifySupportPath));
        assert!(print.is_step_done(PrintStep::WipeTower));
        assert!(!print.is_step_done(PrintStep::SkirtBrim));
    }

    #[test]
    fn test_identical_objects_share_layers() {
        let model = model_with(vec![
            cube("a", 5.0, Vec3::new(30.0, 30.0, 0.0)),
            cube("b", 5.0, Vec3::new(60.0, 30.0, 0.0)),
        ]);
        let mut print = Print::new();
        print.apply(&model, None, &DynamicConfig::defaults()).unwrap();
        assert_eq!(print.objects()[1].shared_object(), Some(0));
        print.process().unwrap();
        assert_eq!(print.objects()[1].layers().len(), print.objects()[0].layers().len());
    }

    #[test]
    fn test_empty_print_is_plate_fatal() {
        let mut print = Print::new();
        print.apply(&Model::new(), None, &DynamicConfig::defaults()).unwrap();
        let err = print.process().unwrap_err();
        assert!(err.is_plate_fatal());
    }

    #[test]
    fn test_too_tall_object_is_object_scoped() {
        let model = model_with(vec![cube("tall", 20.0, Vec3::new(50.0, 50.0, 0.0))]);
        let mut config = DynamicConfig::defaults();
        config.set("printable_height", 10.0);
        let mut print = Print::new();
        print.apply(&model, None, &config).unwrap();
        let err = print.validate().unwrap_err();
        assert_eq!(err.object_id(), Some(model.objects[0].id));
    }

    #[test]
    fn test_sequential_clearance() {
        let model = model_with(vec![
            cube("a", 10.0, Vec3::new(30.0, 30.0, 0.0)),
            cube("b", 10.0, Vec3::new(50.0, 30.0, 0.0)),
        ]);
        let mut config = DynamicConfig::defaults();
        config.set("print_sequence", "by_object");
        let mut print = Print::new();
        print.apply(&model, None, &config).unwrap();
        assert!(matches!(print.validate(), Err(PrintError::Plate(_))));
    }

    #[test]
    fn test_export_requires_processing() {
        let model = model_with(vec![cube("a", 5.0, Vec3::new(30.0, 30.0, 0.0))]);
        let mut print = Print::new();
        print.apply(&model, None, &DynamicConfig::defaults()).unwrap();
        let dir = std::env::temp_dir();
        assert!(print.export_gcode(&dir.join("never.json"), &ToolpathDumpExporter).is_err());
    }

    #[test]
    fn test_cancel_callback_runs_on_clear() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut print = Print::new();
        print.set_cancel_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        print.clear();
        print.apply(&Model::new(), None, &DynamicConfig::defaults()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
