//! One sliced object of a print and its per-object steps.
//!
//! A [`PrintObject`] covers every instance of a model object that shares the
//! same rotation, scale and Z placement; instances differing only by an XY
//! shift are [`PrintInstance`]s of one print object. Layer geometry lives in
//! the print object's frame and is moved by the instance shift on export.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slicekit_config::{BrimType, DynamicConfig, InfillPattern, IroningType};
use slicekit_math::{
    diff_ex, intersection_ex, offset_ex, union_ex, BoundingBox3, ExPolygon, ExPolygons, Transform,
    Vec2, Vec3,
};
use slicekit_model::{MeshSlicer, ModelObject, ModelVolumeType, ObjectId};
use tracing::{debug, trace};

use crate::error::{PrintError, Result};
use crate::infill::{fill_expolygons, FillParams};
use crate::invalidation::object_steps_for_options;
use crate::layer::{ExtrusionPath, ExtrusionRole, Layer, LayerRegion, Surface, SurfaceType, SupportLayer};
use crate::perimeter::{generate_perimeters, PerimeterSettings};
use crate::pipeline::PipelineConfig;
use crate::region::{LayerRangeRegions, PrintObjectRegions};
use crate::slicing::{generate_object_layers, update_layer_height_profile, SlicingParameters};
use crate::step::{CancelToken, PipelineStep, PrintObjectStep, StepState};
use crate::support::{generate_support_layers, SupportModifiers, SupportSettings};

/// Overhangs narrower than this do not trigger a lift (mm).
const LIFT_OVERHANG_MARGIN: f64 = 0.2;

/// One copy of a print object on the plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintInstance {
    /// Model instance this copy comes from.
    pub model_instance_id: ObjectId,
    /// XY shift from the object frame to the plate.
    pub shift: Vec2,
    /// Index of the model instance in its object.
    pub id: usize,
}

/// Inputs a per-object step reads besides the object itself.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    /// Source model object.
    pub model_object: &'a ModelObject,
    /// Plate-wide switches of this run.
    pub pipeline: &'a PipelineConfig,
    /// Mesh slicing service.
    pub slicer: &'a dyn MeshSlicer,
    /// Checked between steps.
    pub cancel: &'a CancelToken,
}

/// A model object placed under one linear transform.
#[derive(Debug, Clone)]
pub struct PrintObject {
    id: ObjectId,
    name: String,
    trafo: Transform,
    instances: Vec<PrintInstance>,
    config: DynamicConfig,
    size: Vec3,
    height: f64,
    center_offset: Vec3,
    layers: Vec<Layer>,
    support_layers: Vec<SupportLayer>,
    slicing_params: SlicingParameters,
    layer_height_profile: Vec<f64>,
    regions: Option<Arc<PrintObjectRegions>>,
    state: StepState<PrintObjectStep>,
    shared_object: Option<usize>,
    mesh_hash: u64,
    overrides_hash: u64,
}

impl PrintObject {
    /// Print object for `model_object` under `trafo` (no XY translation).
    ///
    /// `config` is the full print config; the object's own overrides are
    /// applied on top.
    pub fn new(
        model_object: &ModelObject,
        trafo: Transform,
        instances: Vec<PrintInstance>,
        config: &DynamicConfig,
    ) -> Self {
        let config = object_config(config, model_object);
        let bbox = parts_bounding_box(model_object, &trafo);
        let (size, height, center_offset) = if bbox.is_valid() {
            let c = bbox.center();
            // Sinking objects are sliced from the plate up.
            (bbox.size(), bbox.max.z.max(0.0), Vec3::new(c.x, c.y, 0.0))
        } else {
            (Vec3::zeros(), 0.0, Vec3::zeros())
        };
        Self {
            id: model_object.id,
            name: model_object.name.clone(),
            trafo,
            instances,
            config,
            size,
            height,
            center_offset,
            layers: Vec::new(),
            support_layers: Vec::new(),
            slicing_params: SlicingParameters::default(),
            layer_height_profile: Vec::new(),
            regions: None,
            state: StepState::new(),
            shared_object: None,
            mesh_hash: mesh_hash(model_object),
            overrides_hash: overrides_hash(model_object),
        }
    }

    /// Id of the source model object.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Name of the source model object.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object-to-plate transform without the instance XY shift.
    pub fn trafo(&self) -> &Transform {
        &self.trafo
    }

    /// Copies on the plate.
    pub fn instances(&self) -> &[PrintInstance] {
        &self.instances
    }

    pub(crate) fn set_instances(&mut self, instances: Vec<PrintInstance>) -> bool {
        if self.instances == instances {
            return false;
        }
        self.instances = instances;
        true
    }

    /// Print config with the object's overrides.
    pub fn config(&self) -> &DynamicConfig {
        &self.config
    }

    /// Size of the transformed parts.
    pub fn size(&self) -> Vec3 {
        self.size
    }

    /// Top of the object above the plate, raft included.
    pub fn max_z(&self) -> f64 {
        if self.slicing_params.valid {
            self.slicing_params.object_print_z_max
        } else {
            self.height
        }
    }

    /// XY centre of the parts in the object frame.
    pub fn center_offset(&self) -> Vec3 {
        self.center_offset
    }

    /// Hash of every input that shapes the object's layers.
    ///
    /// Model ids are left out, so two identical copies of a model object
    /// hash alike.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.mesh_hash.hash(&mut hasher);
        self.overrides_hash.hash(&mut hasher);
        self.config.content_hash().hash(&mut hasher);
        hash_transform(&self.trafo, &mut hasher);
        hasher.finish()
    }

    /// Pick up geometry and override edits of the model object.
    ///
    /// Changed geometry clears every step; changed overrides clear slicing.
    /// Returns true when anything was invalidated.
    pub(crate) fn update_model_hashes(&mut self, model_object: &ModelObject) -> bool {
        let mesh = mesh_hash(model_object);
        let overrides = overrides_hash(model_object);
        let mut changed = false;
        if mesh != self.mesh_hash {
            self.mesh_hash = mesh;
            let bbox = parts_bounding_box(model_object, &self.trafo);
            if bbox.is_valid() {
                let c = bbox.center();
                self.size = bbox.size();
                self.height = bbox.max.z.max(0.0);
                self.center_offset = Vec3::new(c.x, c.y, 0.0);
            }
            changed |= self.invalidate_all_steps();
        }
        if overrides != self.overrides_hash {
            self.overrides_hash = overrides;
            changed |= self.invalidate_step(PrintObjectStep::Slice);
        }
        changed
    }

    /// Object layers, bottom first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Support and raft layers, bottom first.
    pub fn support_layers(&self) -> &[SupportLayer] {
        &self.support_layers
    }

    /// Layer whose top is exactly `print_z`.
    pub fn get_layer_at_printz(&self, print_z: f64) -> Option<&Layer> {
        self.layers.iter().find(|l| l.print_z == print_z)
    }

    /// Layer whose top is within `eps` of `print_z`.
    pub fn get_layer_at_printz_eps(&self, print_z: f64, eps: f64) -> Option<&Layer> {
        let idx = self.layers.partition_point(|l| l.print_z < print_z - eps);
        self.layers
            .get(idx)
            .filter(|l| (l.print_z - print_z).abs() <= eps)
    }

    /// Highest layer whose top is not above `print_z + eps`.
    pub fn get_first_layer_below_printz(&self, print_z: f64, eps: f64) -> Option<&Layer> {
        let idx = self.layers.partition_point(|l| l.print_z <= print_z + eps);
        idx.checked_sub(1).map(|i| &self.layers[i])
    }

    /// Append a layer on top.
    pub fn add_layer(&mut self, slice_z: f64, print_z: f64, height: f64) -> &mut Layer {
        let id = self.layers.len();
        self.layers.push(Layer::new(id, slice_z, print_z, height));
        let last = self.layers.len() - 1;
        &mut self.layers[last]
    }

    /// Append a support layer on top.
    pub fn add_support_layer(&mut self, print_z: f64, height: f64, is_raft: bool) -> &mut SupportLayer {
        let id = self.support_layers.len();
        self.support_layers.push(SupportLayer::new(id, print_z, height, is_raft));
        let last = self.support_layers.len() - 1;
        &mut self.support_layers[last]
    }

    /// Drop every object layer.
    pub fn clear_layers(&mut self) {
        self.layers.clear();
    }

    /// Drop every support layer.
    pub fn clear_support_layers(&mut self) {
        self.support_layers.clear();
    }

    /// Support generation is switched on.
    pub fn has_support(&self) -> bool {
        self.config.opt_bool("enable_support").unwrap_or(false)
    }

    /// A raft is printed under the object.
    pub fn has_raft(&self) -> bool {
        self.config.opt_int("raft_layers").unwrap_or(0) > 0
    }

    /// Support or raft material is printed.
    pub fn has_support_material(&self) -> bool {
        self.has_support() || self.has_raft()
    }

    /// A brim is printed around the object.
    pub fn has_brim(&self) -> bool {
        let brim_type = self
            .config
            .opt_enum::<BrimType>("brim_type")
            .unwrap_or(BrimType::NoBrim);
        brim_type != BrimType::NoBrim
            && self.config.opt_float("brim_width").unwrap_or(0.0) > 0.0
    }

    /// Region layout, once assigned.
    pub fn regions(&self) -> Option<&Arc<PrintObjectRegions>> {
        self.regions.as_ref()
    }

    pub(crate) fn set_regions(&mut self, regions: Arc<PrintObjectRegions>) {
        self.regions = Some(regions);
    }

    /// 1-based filaments the object prints with.
    pub fn object_extruders(&self) -> BTreeSet<u32> {
        let mut out = self
            .regions
            .as_ref()
            .map(|r| r.extruders())
            .unwrap_or_default();
        if self.has_support_material() {
            for key in ["support_filament", "support_interface_filament"] {
                if let Ok(f) = self.config.opt_int(key) {
                    if f > 0 {
                        out.insert(f as u32);
                    }
                }
            }
        }
        if out.is_empty() {
            out.insert(1);
        }
        out
    }

    /// Resolved layering.
    pub fn slicing_parameters(&self) -> &SlicingParameters {
        &self.slicing_params
    }

    /// Layer height profile in effect.
    pub fn layer_height_profile(&self) -> &[f64] {
        &self.layer_height_profile
    }

    /// Re-resolve layering from the current config and height.
    ///
    /// Returns true when the layering changed, in which case slicing is
    /// invalidated.
    pub fn update_slicing_parameters(&mut self, model_object: &ModelObject) -> Result<bool> {
        let params = SlicingParameters::from_config(&self.config, self.height, &self.object_extruders())
            .map_err(|e| self.scope_error(e))?;
        let mut profile = model_object.layer_height_profile.clone();
        update_layer_height_profile(&params, &model_object.layer_config_ranges, &mut profile);
        let changed = params != self.slicing_params || profile != self.layer_height_profile;
        if changed {
            self.slicing_params = params;
            self.layer_height_profile = profile;
            self.invalidate_step(PrintObjectStep::Slice);
        }
        Ok(changed)
    }

    /// True once `step` finished.
    pub fn is_step_done(&self, step: PrintObjectStep) -> bool {
        self.state.is_done(step)
    }

    /// Step flags.
    pub fn state(&self) -> &StepState<PrintObjectStep> {
        &self.state
    }

    /// Clear `step` and every object step after it.
    pub fn invalidate_step(&mut self, step: PrintObjectStep) -> bool {
        let changed = self.state.invalidate(step);
        if changed {
            trace!(object = %self.id, ?step, "invalidated object step");
        }
        changed
    }

    /// Clear every step.
    pub fn invalidate_all_steps(&mut self) -> bool {
        self.state.invalidate_all()
    }

    /// Switch to `new_config` and clear the steps reading any key that
    /// differs from the current one. `changed_keys` narrows the check when
    /// the caller already knows what changed.
    pub fn invalidate_state_by_config_options(
        &mut self,
        new_config: &DynamicConfig,
        changed_keys: Option<&[String]>,
    ) -> bool {
        let diff = self.config.diff(new_config);
        let keys: Vec<&str> = match changed_keys {
            Some(filter) => diff
                .iter()
                .filter(|k| filter.contains(*k))
                .map(String::as_str)
                .collect(),
            None => diff.iter().map(String::as_str).collect(),
        };
        if keys.is_empty() {
            return false;
        }
        self.config.apply_only(new_config, keys.iter().copied());
        let mut changed = false;
        for step in object_steps_for_options(keys.iter().copied()) {
            changed |= self.invalidate_step(step);
        }
        debug!(object = %self.id, keys = keys.len(), changed, "applied object config changes");
        changed
    }

    /// Object whose layers this one reuses.
    pub fn shared_object(&self) -> Option<usize> {
        self.shared_object
    }

    /// Reuse the layers of the print object at `index`.
    pub fn set_shared_object(&mut self, index: Option<usize>) {
        if self.shared_object != index {
            self.shared_object = index;
            self.invalidate_all_steps();
        }
    }

    /// Copy layers and step flags from the object that computed them.
    pub fn copy_layers_from_shared_object(&mut self, source: &PrintObject) {
        self.layers = source.layers.clone();
        self.support_layers = source.support_layers.clone();
        self.slicing_params = source.slicing_params.clone();
        self.layer_height_profile = source.layer_height_profile.clone();
        self.state = source.state.clone();
        debug!(object = %self.id, source = %source.id, "copied layers from shared object");
    }

    pub(crate) fn restore_cached(
        &mut self,
        layers: Vec<Layer>,
        support_layers: Vec<SupportLayer>,
        slicing_params: SlicingParameters,
        done_steps: &[PrintObjectStep],
    ) {
        self.layers = layers;
        self.support_layers = support_layers;
        self.slicing_params = slicing_params;
        self.state = StepState::new();
        for &step in done_steps {
            self.state.set_done(step);
        }
    }

    /// Run every pending step in order.
    ///
    /// Cancellation is checked before each step. Errors come back scoped to
    /// this object.
    pub fn process(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        for &step in PrintObjectStep::ALL {
            ctx.cancel.check()?;
            if !self.state.set_started(step) {
                continue;
            }
            debug!(object = %self.id, ?step, "object step started");
            self.run_step(step, ctx).map_err(|e| self.scope_error(e))?;
            self.state.set_done(step);
        }
        Ok(())
    }

    fn scope_error(&self, err: PrintError) -> PrintError {
        match err {
            PrintError::Canceled | PrintError::Object { .. } => err,
            PrintError::InvalidConfig { object_id: Some(_), .. } => err,
            PrintError::InvalidConfig { object_id: None, message } => PrintError::InvalidConfig {
                object_id: Some(self.id),
                message,
            },
            PrintError::Config(e) => PrintError::InvalidConfig {
                object_id: Some(self.id),
                message: e.to_string(),
            },
            other => PrintError::object(self.id, other.to_string()),
        }
    }

    fn run_step(&mut self, step: PrintObjectStep, ctx: &StepContext<'_>) -> Result<()> {
        match step {
            PrintObjectStep::Slice => self.slice(ctx),
            PrintObjectStep::Perimeters => self.make_perimeters(ctx),
            PrintObjectStep::PrepareInfill => self.prepare_infill(),
            PrintObjectStep::Infill => self.make_infill(ctx),
            PrintObjectStep::Ironing => self.ironing(),
            PrintObjectStep::SupportMaterial => self.generate_support_material(ctx),
            PrintObjectStep::DetectOverhangsForLift => {
                self.detect_overhangs_for_lift(ctx);
                Ok(())
            }
            PrintObjectStep::SimplifyWall => {
                let tol = ctx.pipeline.resolution;
                self.layers.par_iter_mut().for_each(|layer| {
                    for region in &mut layer.regions {
                        region.perimeters.simplify(tol);
                    }
                });
                Ok(())
            }
            PrintObjectStep::SimplifyInfill => {
                let tol = ctx.pipeline.resolution;
                self.layers.par_iter_mut().for_each(|layer| {
                    for region in &mut layer.regions {
                        region.fills.simplify(tol);
                        region.ironings.simplify(tol);
                    }
                });
                Ok(())
            }
            PrintObjectStep::SimplifySupportPath => {
                let tol = ctx.pipeline.resolution;
                self.support_layers
                    .par_iter_mut()
                    .for_each(|layer| layer.support_fills.simplify(tol));
                Ok(())
            }
        }
    }

    fn regions_or_err(&self) -> Result<Arc<PrintObjectRegions>> {
        self.regions
            .clone()
            .ok_or_else(|| PrintError::object(self.id, "regions were not assigned"))
    }

    /// Slice every volume and split the slices into regions.
    fn slice(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        if self.update_slicing_parameters(ctx.model_object)? {
            // The update above cleared this step; it is running now.
            self.state.set_started(PrintObjectStep::Slice);
        }
        let regions = self.regions_or_err()?;
        let params = &self.slicing_params;
        let bounds = generate_object_layers(params, &self.layer_height_profile);

        self.layers.clear();
        self.support_layers.clear();
        let mut zs = Vec::with_capacity(bounds.len() / 2);
        for (id, pair) in bounds.chunks_exact(2).enumerate() {
            let (lo, hi) = (pair[0], pair[1]);
            let slice_z = 0.5 * (lo + hi);
            zs.push(slice_z);
            self.layers.push(Layer::new(id, slice_z, params.object_print_z_min + hi, hi - lo));
        }

        let volume_slices = self.slice_volumes(ctx, &regions, &zs);
        let clip_multipart = ctx.pipeline.clip_multipart_objects;
        let model_object = ctx.model_object;
        let closing_radius = self.config.opt_float("slice_closing_radius")?.max(0.0);
        let xy_contour = self.config.opt_float("xy_contour_compensation")?;
        let xy_hole = self.config.opt_float("xy_hole_compensation")?;
        let elephant_foot = if params.has_raft() {
            0.0
        } else {
            self.config.opt_float("elefant_foot_compensation")?.max(0.0)
        };

        self.layers.par_iter_mut().enumerate().for_each(|(i, layer)| {
            let Some(range) = regions.layer_range_at(layer.slice_z) else {
                return;
            };
            let mut by_region = compose_regions(range, model_object, &volume_slices, i, clip_multipart);
            for polys in by_region.values_mut() {
                if closing_radius > 0.0 {
                    *polys = offset_ex(&offset_ex(polys, closing_radius), -closing_radius);
                }
                if xy_hole != 0.0 {
                    *polys = compensate_holes(polys, xy_hole);
                }
                if xy_contour != 0.0 {
                    *polys = offset_ex(polys, xy_contour);
                }
                if i == 0 && elephant_foot > 0.0 {
                    *polys = offset_ex(polys, -elephant_foot);
                }
            }
            layer.regions = by_region
                .into_iter()
                .filter(|(_, polys)| !polys.is_empty())
                .map(|(region_id, slices)| LayerRegion {
                    slices,
                    ..LayerRegion::new(region_id)
                })
                .collect();
            let all: ExPolygons = layer.regions.iter().flat_map(|r| r.slices.iter().cloned()).collect();
            layer.lslices = union_ex(&all);
        });

        if self.layers.iter().all(Layer::is_empty) {
            self.layers.clear();
            return Err(PrintError::object(
                self.id,
                "No layers were detected. You might want to repair your STL file(s) or check their size or thickness and retry.",
            ));
        }
        debug!(object = %self.id, layers = self.layers.len(), "sliced");
        Ok(())
    }

    /// Slices of every volume and painted patch, keyed by model volume index.
    fn slice_volumes(
        &self,
        ctx: &StepContext<'_>,
        regions: &PrintObjectRegions,
        zs: &[f64],
    ) -> VolumeSlices {
        let mut used = BTreeSet::new();
        for range in &regions.layer_ranges {
            used.extend(range.volume_regions.iter().map(|v| v.model_volume_idx));
        }
        let mut out = VolumeSlices::default();
        for idx in used {
            let Some(volume) = ctx.model_object.volumes.get(idx) else {
                continue;
            };
            let trafo = self.trafo.then(&volume.transform);
            out.volumes.insert(idx, ctx.slicer.slice(&volume.mesh, &trafo, zs));
            for patch in &volume.mm_segmentation {
                let sliced = ctx.slicer.slice(&patch.mesh, &trafo, zs);
                out.painted.entry((idx, patch.extruder_id)).or_default().push(sliced);
            }
            if let Some(mesh) = &volume.fuzzy_skin_patch {
                out.fuzzy.insert(idx, ctx.slicer.slice(mesh, &trafo, zs));
            }
        }
        out
    }

    fn make_perimeters(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        let regions = self.regions_or_err()?;
        let mut settings = Vec::with_capacity(regions.num_regions());
        for region in &regions.all_regions {
            let mut s = PerimeterSettings::from_region(region.config())?;
            if ctx.pipeline.spiral_mode {
                s.wall_loops = 1;
            }
            settings.push(s);
        }
        self.layers.par_iter_mut().for_each(|layer| {
            for region in &mut layer.regions {
                let Some(s) = settings.get(region.region_id) else {
                    continue;
                };
                let walls = generate_perimeters(&region.slices, s, layer.height, layer.id);
                region.perimeters.clear();
                region.perimeters.extend(walls.loops);
                region.fill_surfaces = walls
                    .fill_area
                    .into_iter()
                    .map(|expolygon| Surface {
                        surface_type: SurfaceType::Internal,
                        expolygon,
                    })
                    .collect();
            }
        });
        Ok(())
    }

    /// Classify fill areas by what lies above and below.
    fn prepare_infill(&mut self) -> Result<()> {
        let regions = self.regions_or_err()?;
        let mut shells = Vec::with_capacity(regions.num_regions());
        for region in &regions.all_regions {
            let top = region.config().opt_int("top_shell_layers")?.max(0) as usize;
            let bottom = region.config().opt_int("bottom_shell_layers")?.max(0) as usize;
            shells.push((top, bottom));
        }
        let lslices: Vec<ExPolygons> = self.layers.iter().map(|l| l.lslices.clone()).collect();
        let n = lslices.len();

        self.layers.par_iter_mut().enumerate().for_each(|(i, layer)| {
            for region in &mut layer.regions {
                let (top_layers, bottom_layers) = shells.get(region.region_id).copied().unwrap_or((0, 0));
                let fill = region.fill_expolygons();
                if fill.is_empty() {
                    continue;
                }
                let top = if top_layers == 0 {
                    Vec::new()
                } else if i + 1 < n {
                    diff_ex(&fill, &lslices[i + 1])
                } else {
                    fill.clone()
                };
                let bottom = if bottom_layers == 0 {
                    Vec::new()
                } else if i > 0 {
                    diff_ex(&diff_ex(&fill, &lslices[i - 1]), &top)
                } else {
                    diff_ex(&fill, &top)
                };

                // Sparse only where every layer in the shell range has material.
                let lo = i.checked_sub(bottom_layers);
                let hi = i + top_layers;
                let mut internal = match lo {
                    Some(_) if hi < n => fill.clone(),
                    _ => Vec::new(),
                };
                if let Some(lo) = lo {
                    for j in (lo..=hi.min(n.saturating_sub(1))).filter(|&j| j != i) {
                        if internal.is_empty() {
                            break;
                        }
                        internal = intersection_ex(&internal, &lslices[j]);
                    }
                }
                internal = diff_ex(&diff_ex(&internal, &top), &bottom);

                let mut covered = top.clone();
                covered.extend(bottom.iter().cloned());
                covered.extend(internal.iter().cloned());
                let solid = diff_ex(&fill, &covered);

                let mut surfaces = Vec::new();
                for (surface_type, polys) in [
                    (SurfaceType::Top, top),
                    (SurfaceType::Bottom, bottom),
                    (SurfaceType::InternalSolid, solid),
                    (SurfaceType::Internal, internal),
                ] {
                    surfaces.extend(polys.into_iter().map(|expolygon| Surface {
                        surface_type,
                        expolygon,
                    }));
                }
                region.fill_surfaces = surfaces;
            }
        });
        Ok(())
    }

    fn make_infill(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        let regions = self.regions_or_err()?;
        let mut fills = Vec::with_capacity(regions.num_regions());
        for region in &regions.all_regions {
            let cfg = region.config();
            fills.push(InfillSettings {
                pattern: cfg.opt_enum("sparse_infill_pattern")?,
                density: (cfg.opt_float("sparse_infill_density")? / 100.0).clamp(0.0, 1.0),
                line_width: cfg.opt_float("line_width")?,
                angle: cfg.opt_float("infill_direction")?,
            });
        }
        let spiral = ctx.pipeline.spiral_mode;

        self.layers.par_iter_mut().for_each(|layer| {
            let (layer_id, height) = (layer.id, layer.height);
            for region in &mut layer.regions {
                let Some(s) = fills.get(region.region_id) else {
                    continue;
                };
                region.fills.clear();
                let mut by_type: BTreeMap<u8, (SurfaceType, ExPolygons)> = BTreeMap::new();
                for surface in &region.fill_surfaces {
                    by_type
                        .entry(surface.surface_type as u8)
                        .or_insert_with(|| (surface.surface_type, Vec::new()))
                        .1
                        .push(surface.expolygon.clone());
                }
                for (surface_type, area) in by_type.into_values() {
                    let (role, params) = match surface_type {
                        SurfaceType::Top => (ExtrusionRole::TopSolidInfill, s.solid(layer_id)),
                        SurfaceType::Bottom => (ExtrusionRole::BottomSurface, s.solid(layer_id)),
                        SurfaceType::InternalSolid => (ExtrusionRole::SolidInfill, s.solid(layer_id)),
                        SurfaceType::Internal if spiral => continue,
                        SurfaceType::Internal => (ExtrusionRole::InternalInfill, s.sparse(layer_id)),
                    };
                    region.fills.extend(
                        fill_expolygons(&area, &params)
                            .into_iter()
                            .map(|p| ExtrusionPath::new(role, p, s.line_width, height)),
                    );
                }
            }
        });
        Ok(())
    }

    fn ironing(&mut self) -> Result<()> {
        let regions = self.regions_or_err()?;
        let mut settings = Vec::with_capacity(regions.num_regions());
        for region in &regions.all_regions {
            let cfg = region.config();
            settings.push((
                cfg.opt_enum::<IroningType>("ironing_type")?,
                cfg.opt_float("ironing_spacing")?,
                cfg.opt_float("ironing_flow")? / 100.0,
                cfg.opt_float("line_width")?,
                cfg.opt_float("infill_direction")?,
            ));
        }
        let top_layer = self.layers.len().saturating_sub(1);

        self.layers.par_iter_mut().for_each(|layer| {
            let (layer_id, height) = (layer.id, layer.height);
            for region in &mut layer.regions {
                region.ironings.clear();
                let Some(&(ironing_type, spacing, flow, line_width, angle)) = settings.get(region.region_id) else {
                    continue;
                };
                if spacing <= 0.0 {
                    continue;
                }
                let wanted = |t: SurfaceType| match ironing_type {
                    IroningType::NoIroning => false,
                    IroningType::TopmostOnly => t == SurfaceType::Top && layer_id == top_layer,
                    IroningType::TopSurfaces => t == SurfaceType::Top,
                    IroningType::AllSolid => t.is_solid(),
                };
                let area: ExPolygons = region
                    .fill_surfaces
                    .iter()
                    .filter(|s| wanted(s.surface_type))
                    .map(|s| s.expolygon.clone())
                    .collect();
                if area.is_empty() {
                    continue;
                }
                let area = offset_ex(&area, -line_width / 2.0);
                let params = FillParams::solid(spacing, angle + 45.0, layer_id);
                region.ironings.extend(fill_expolygons(&area, &params).into_iter().map(|p| {
                    let mut path = ExtrusionPath::new(ExtrusionRole::Ironing, p, spacing, height);
                    path.flow = flow;
                    path
                }));
            }
        });
        Ok(())
    }

    fn generate_support_material(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        let settings = SupportSettings::from_config(&self.config)?;
        let modifiers = if settings.enabled && ctx.model_object.has_support_modifiers() {
            self.slice_support_modifiers(ctx)
        } else {
            SupportModifiers::default()
        };
        self.support_layers =
            generate_support_layers(&self.layers, &self.slicing_params, &settings, &modifiers);
        debug!(object = %self.id, layers = self.support_layers.len(), "generated support");
        Ok(())
    }

    fn slice_support_modifiers(&self, ctx: &StepContext<'_>) -> SupportModifiers {
        let zs: Vec<f64> = self.layers.iter().map(|l| l.slice_z).collect();
        let mut modifiers = SupportModifiers {
            enforcers: vec![ExPolygons::new(); zs.len()],
            blockers: vec![ExPolygons::new(); zs.len()],
        };
        for volume in ctx.model_object.volumes.iter().filter(|v| v.is_support_modifier()) {
            let trafo = self.trafo.then(&volume.transform);
            let sliced = ctx.slicer.slice(&volume.mesh, &trafo, &zs);
            let target = if volume.volume_type == ModelVolumeType::SupportEnforcer {
                &mut modifiers.enforcers
            } else {
                &mut modifiers.blockers
            };
            for (dst, src) in target.iter_mut().zip(sliced) {
                dst.extend(src);
            }
        }
        for layer in modifiers.enforcers.iter_mut().chain(modifiers.blockers.iter_mut()) {
            if !layer.is_empty() {
                *layer = union_ex(layer);
            }
        }
        modifiers
    }

    fn detect_overhangs_for_lift(&mut self, ctx: &StepContext<'_>) {
        if !ctx.pipeline.lift_enabled() {
            for layer in &mut self.layers {
                layer.lift_overhangs.clear();
            }
            return;
        }
        let lslices: Vec<ExPolygons> = self.layers.iter().map(|l| l.lslices.clone()).collect();
        self.layers.par_iter_mut().enumerate().for_each(|(i, layer)| {
            layer.lift_overhangs = if i == 0 {
                Vec::new()
            } else {
                diff_ex(&layer.lslices, &offset_ex(&lslices[i - 1], LIFT_OVERHANG_MARGIN))
            };
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct InfillSettings {
    pattern: InfillPattern,
    density: f64,
    line_width: f64,
    angle: f64,
}

impl InfillSettings {
    fn solid(&self, layer_id: usize) -> FillParams {
        FillParams::solid(self.line_width, self.angle, layer_id)
    }

    fn sparse(&self, layer_id: usize) -> FillParams {
        FillParams {
            pattern: self.pattern,
            density: self.density,
            line_width: self.line_width,
            angle: self.angle,
            layer_id,
        }
    }
}

/// Per-layer slices of the volumes of one object.
#[derive(Debug, Default)]
struct VolumeSlices {
    volumes: BTreeMap<usize, Vec<ExPolygons>>,
    painted: BTreeMap<(usize, u32), Vec<Vec<ExPolygons>>>,
    fuzzy: BTreeMap<usize, Vec<ExPolygons>>,
}

impl VolumeSlices {
    fn volume(&self, idx: usize, layer: usize) -> &[ExPolygon] {
        self.volumes
            .get(&idx)
            .and_then(|v| v.get(layer))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn painted(&self, idx: usize, extruder_id: u32, layer: usize) -> ExPolygons {
        self.painted
            .get(&(idx, extruder_id))
            .map(|patches| {
                patches
                    .iter()
                    .filter_map(|p| p.get(layer))
                    .flat_map(|p| p.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn fuzzy(&self, idx: usize, layer: usize) -> &[ExPolygon] {
        self.fuzzy
            .get(&idx)
            .and_then(|v| v.get(layer))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Apply the clipping recorded in `range` to the slices of layer `layer`.
fn compose_regions(
    range: &LayerRangeRegions,
    model_object: &ModelObject,
    slices: &VolumeSlices,
    layer: usize,
    clip_multipart: bool,
) -> BTreeMap<usize, ExPolygons> {
    let mut polys: Vec<ExPolygons> = vec![Vec::new(); range.volume_regions.len()];
    let mut material = ExPolygons::new();

    for (k, vr) in range.volume_regions.iter().enumerate() {
        let volume_slices = slices.volume(vr.model_volume_idx, layer);
        match (vr.region, vr.parent) {
            (Some(_), None) => {
                let mut area = union_ex(volume_slices);
                if clip_multipart && !material.is_empty() {
                    area = diff_ex(&area, &material);
                }
                material.extend(area.iter().cloned());
                polys[k] = area;
            }
            (None, _) => {
                if volume_slices.is_empty() {
                    continue;
                }
                for p in polys.iter_mut().take(k) {
                    if !p.is_empty() {
                        *p = diff_ex(p, volume_slices);
                    }
                }
                material = diff_ex(&material, volume_slices);
            }
            (Some(_), Some(parent)) => {
                if volume_slices.is_empty() || polys[parent].is_empty() {
                    continue;
                }
                polys[k] = intersection_ex(&polys[parent], volume_slices);
                polys[parent] = diff_ex(&polys[parent], volume_slices);
            }
        }
    }

    let is_part = |v: usize| {
        model_object
            .volumes
            .get(v)
            .is_some_and(|vol| vol.is_model_part())
    };
    let root_volume = |mut k: usize| {
        while let Some(parent) = range.volume_regions[k].parent {
            k = parent;
        }
        range.volume_regions[k].model_volume_idx
    };

    let mut extra: Vec<(usize, ExPolygons)> = Vec::new();
    for painted in &range.painted_regions {
        let volume = root_volume(painted.parent);
        if !is_part(volume) || polys[painted.parent].is_empty() {
            continue;
        }
        let patch = slices.painted(volume, painted.extruder_id, layer);
        if patch.is_empty() {
            continue;
        }
        let area = intersection_ex(&polys[painted.parent], &patch);
        polys[painted.parent] = diff_ex(&polys[painted.parent], &patch);
        extra.push((painted.region, area));
    }
    for fuzzy in &range.fuzzy_skin_painted_regions {
        let volume = root_volume(fuzzy.parent);
        let patch = slices.fuzzy(volume, layer);
        if patch.is_empty() || polys[fuzzy.parent].is_empty() {
            continue;
        }
        let area = intersection_ex(&polys[fuzzy.parent], patch);
        polys[fuzzy.parent] = diff_ex(&polys[fuzzy.parent], patch);
        extra.push((fuzzy.region, area));
    }

    let mut by_region: BTreeMap<usize, ExPolygons> = BTreeMap::new();
    let assigned = range
        .volume_regions
        .iter()
        .zip(polys)
        .filter_map(|(vr, p)| vr.region.map(|r| (r, p)));
    for (region, area) in assigned.chain(extra) {
        if !area.is_empty() {
            by_region.entry(region).or_default().extend(area);
        }
    }
    for area in by_region.values_mut() {
        *area = union_ex(area);
    }
    by_region
}

/// Grow (`delta > 0`) or shrink every hole by `delta`.
fn compensate_holes(expolys: &[ExPolygon], delta: f64) -> ExPolygons {
    let reshaped: ExPolygons = expolys
        .iter()
        .map(|e| {
            let holes = e.holes.iter().filter_map(|h| h.offset(-delta)).collect();
            ExPolygon::with_holes(e.contour.clone(), holes)
        })
        .collect();
    union_ex(&reshaped)
}

/// Print config with the object's non-plate overrides applied.
pub fn object_config(print_config: &DynamicConfig, model_object: &ModelObject) -> DynamicConfig {
    let mut config = print_config.clone();
    config.apply(&model_object.config.filtered(|k| !slicekit_config::is_print_key(k)));
    config
}

fn parts_bounding_box(model_object: &ModelObject, trafo: &Transform) -> BoundingBox3 {
    let mut bb = BoundingBox3::empty();
    for v in model_object.volumes.iter().filter(|v| v.is_model_part()) {
        bb.merge(&v.mesh.transformed_bounding_box(&trafo.then(&v.transform)));
    }
    bb
}

fn hash_transform(trafo: &Transform, hasher: &mut impl Hasher) {
    for v in trafo.matrix.iter() {
        v.to_bits().hash(hasher);
    }
}

fn mesh_hash(model_object: &ModelObject) -> u64 {
    let mut hasher = DefaultHasher::new();
    for volume in &model_object.volumes {
        volume.volume_type.hash(&mut hasher);
        volume.mesh.content_hash().hash(&mut hasher);
        hash_transform(&volume.transform, &mut hasher);
        for patch in &volume.mm_segmentation {
            patch.extruder_id.hash(&mut hasher);
            patch.mesh.content_hash().hash(&mut hasher);
        }
        if let Some(mesh) = &volume.fuzzy_skin_patch {
            mesh.content_hash().hash(&mut hasher);
        }
    }
    hasher.finish()
}

fn overrides_hash(model_object: &ModelObject) -> u64 {
    let mut hasher = DefaultHasher::new();
    for volume in &model_object.volumes {
        volume.config.content_hash().hash(&mut hasher);
    }
    for range in &model_object.layer_config_ranges {
        range.lo.to_bits().hash(&mut hasher);
        range.hi.to_bits().hash(&mut hasher);
        range.config.content_hash().hash(&mut hasher);
    }
    for v in &model_object.layer_height_profile {
        v.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionAssigner;
    use approx::assert_relative_eq;
    use slicekit_math::{area_ex, Point3};
    use slicekit_model::{ModelInstance, ModelVolume, PlanarSlicer, TriangleMesh};

    fn cube_object(size: f64) -> ModelObject {
        let mut object = ModelObject::new("cube");
        object.add_volume(ModelVolume::new(
            "part",
            TriangleMesh::cuboid(Point3::origin(), [size, size, size]),
        ));
        object.add_instance(ModelInstance::new(Vec3::new(50.0, 50.0, 0.0)));
        object
    }

    fn print_object(object: &ModelObject, config: &DynamicConfig) -> PrintObject {
        let trafo = Transform::identity();
        let instances = vec![PrintInstance {
            model_instance_id: object.instances[0].id,
            shift: Vec2::new(50.0, 50.0),
            id: 0,
        }];
        let mut po = PrintObject::new(object, trafo.clone(), instances, config);
        let regions = RegionAssigner::new(po.config()).assign(object, &trafo);
        po.set_regions(Arc::new(regions));
        po
    }

    fn run(po: &mut PrintObject, object: &ModelObject, pipeline: &PipelineConfig) -> Result<()> {
        let cancel = CancelToken::new();
        let ctx = StepContext {
            model_object: object,
            pipeline,
            slicer: &PlanarSlicer,
            cancel: &cancel,
        };
        po.process(&ctx)
    }

    #[test]
    fn test_cube_runs_every_step() {
        let config = DynamicConfig::defaults();
        let object = cube_object(10.0);
        let mut po = print_object(&object, &config);
        run(&mut po, &object, &PipelineConfig::default()).unwrap();

        for &step in PrintObjectStep::ALL {
            assert!(po.is_step_done(step), "{step:?}");
        }
        assert_eq!(po.layers().len(), 50);
        assert_relative_eq!(po.layers()[0].print_z, 0.2, epsilon = 1e-9);
        assert_relative_eq!(po.layers()[49].print_z, 10.0, epsilon = 1e-6);
        let mid = &po.layers()[25];
        assert_relative_eq!(area_ex(&mid.lslices), 100.0, epsilon = 1e-2);
        assert!(!mid.regions[0].perimeters.is_empty());
        assert!(po.support_layers().is_empty());
    }

    #[test]
    fn test_surface_classification() {
        let config = DynamicConfig::defaults();
        let object = cube_object(10.0);
        let mut po = print_object(&object, &config);
        run(&mut po, &object, &PipelineConfig::default()).unwrap();

        let types = |i: usize| -> BTreeSet<u8> {
            po.layers()[i].regions[0]
                .fill_surfaces
                .iter()
                .map(|s| s.surface_type as u8)
                .collect()
        };
        assert!(types(0).contains(&(SurfaceType::Bottom as u8)));
        assert!(types(49).contains(&(SurfaceType::Top as u8)));
        let mid = types(25);
        assert!(mid.contains(&(SurfaceType::Internal as u8)));
        assert!(!mid.contains(&(SurfaceType::Top as u8)));
        assert!(!mid.contains(&(SurfaceType::Bottom as u8)));
        assert!(types(47).contains(&(SurfaceType::InternalSolid as u8)));
    }

    #[test]
    fn test_elephant_foot_shrinks_first_layer() {
        let config = DynamicConfig::defaults();
        let object = cube_object(10.0);
        let mut po = print_object(&object, &config);
        run(&mut po, &object, &PipelineConfig::default()).unwrap();
        assert!(area_ex(&po.layers()[0].lslices) < area_ex(&po.layers()[1].lslices));
    }

    #[test]
    fn test_negative_volume_cuts_slices() {
        let config = DynamicConfig::defaults();
        let mut object = cube_object(10.0);
        object.add_volume(ModelVolume::with_type(
            "hole",
            TriangleMesh::cuboid(Point3::new(3.0, 3.0, -1.0), [4.0, 4.0, 12.0]),
            ModelVolumeType::NegativeVolume,
        ));
        let mut po = print_object(&object, &config);
        run(&mut po, &object, &PipelineConfig::default()).unwrap();
        assert_relative_eq!(area_ex(&po.layers()[25].lslices), 84.0, epsilon = 1e-2);
    }

    #[test]
    fn test_modifier_moves_area_to_own_region() {
        let config = DynamicConfig::defaults();
        let mut object = cube_object(10.0);
        let mut modifier = ModelVolume::with_type(
            "mod",
            TriangleMesh::cuboid(Point3::new(0.0, 0.0, 0.0), [5.0, 10.0, 10.0]),
            ModelVolumeType::ParameterModifier,
        );
        modifier.config.set("wall_loops", 4i64);
        object.add_volume(modifier);
        let mut po = print_object(&object, &config);
        run(&mut po, &object, &PipelineConfig::default()).unwrap();

        let layer = &po.layers()[25];
        assert_eq!(layer.regions.len(), 2);
        for region in &layer.regions {
            assert_relative_eq!(area_ex(&region.slices), 50.0, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_multipart_clipping_follows_pipeline_switch() {
        let config = DynamicConfig::defaults();
        let mut object = cube_object(10.0);
        let mut second = ModelVolume::new(
            "second",
            TriangleMesh::cuboid(Point3::new(5.0, 0.0, 0.0), [10.0, 10.0, 10.0]),
        );
        second.config.set("wall_loops", 3i64);
        object.add_volume(second);

        let mut clipped = print_object(&object, &config);
        run(&mut clipped, &object, &PipelineConfig::default()).unwrap();
        let total: f64 = clipped.layers()[25].regions.iter().map(|r| area_ex(&r.slices)).sum();
        assert_relative_eq!(total, 150.0, epsilon = 1e-2);

        let pipeline = PipelineConfig {
            clip_multipart_objects: false,
            ..PipelineConfig::default()
        };
        let mut overlapping = print_object(&object, &config);
        run(&mut overlapping, &object, &pipeline).unwrap();
        let total: f64 = overlapping.layers()[25].regions.iter().map(|r| area_ex(&r.slices)).sum();
        assert_relative_eq!(total, 200.0, epsilon = 1e-2);
    }

    #[test]
    fn test_config_change_invalidates_from_mapped_step() {
        let config = DynamicConfig::defaults();
        let object = cube_object(10.0);
        let mut po = print_object(&object, &config);
        run(&mut po, &object, &PipelineConfig::default()).unwrap();

        let mut new_config = po.config().clone();
        new_config.set("sparse_infill_density", 40.0);
        assert!(po.invalidate_state_by_config_options(&new_config, None));
        assert!(po.is_step_done(PrintObjectStep::PrepareInfill));
        assert!(!po.is_step_done(PrintObjectStep::Infill));
        assert!(!po.is_step_done(PrintObjectStep::SimplifySupportPath));

        // Same config again changes nothing.
        assert!(!po.invalidate_state_by_config_options(&new_config, None));
    }

    #[test]
    fn test_cancel_stops_between_steps() {
        let config = DynamicConfig::defaults();
        let object = cube_object(10.0);
        let mut po = print_object(&object, &config);
        let cancel = CancelToken::new();
        cancel.cancel();
        let pipeline = PipelineConfig::default();
        let ctx = StepContext {
            model_object: &object,
            pipeline: &pipeline,
            slicer: &PlanarSlicer,
            cancel: &cancel,
        };
        assert!(matches!(po.process(&ctx), Err(PrintError::Canceled)));
        assert!(!po.is_step_done(PrintObjectStep::Slice));
    }

    #[test]
    fn test_empty_object_fails_with_object_scope() {
        let config = DynamicConfig::defaults();
        let mut object = ModelObject::new("flat");
        object.add_volume(ModelVolume::new("part", TriangleMesh::new()));
        object.add_instance(ModelInstance::new(Vec3::zeros()));
        let mut po = print_object(&object, &config);
        let err = run(&mut po, &object, &PipelineConfig::default()).unwrap_err();
        assert_eq!(err.object_id(), Some(object.id));
    }

    #[test]
    fn test_layer_lookup() {
        let config = DynamicConfig::defaults();
        let object = cube_object(2.0);
        let mut po = print_object(&object, &config);
        run(&mut po, &object, &PipelineConfig::default()).unwrap();

        let z = po.layers()[3].print_z;
        assert_eq!(po.get_layer_at_printz(z).map(|l| l.id), Some(3));
        assert_eq!(po.get_layer_at_printz_eps(z + 1e-6, 1e-4).map(|l| l.id), Some(3));
        assert!(po.get_layer_at_printz_eps(z + 0.1, 1e-4).is_none());
        assert_eq!(po.get_first_layer_below_printz(z + 0.1, 1e-4).map(|l| l.id), Some(3));
        assert!(po.get_first_layer_below_printz(0.1, 1e-4).is_none());
    }

    #[test]
    fn test_shared_object_copies_layers() {
        let config = DynamicConfig::defaults();
        let object = cube_object(5.0);
        let mut source = print_object(&object, &config);
        run(&mut source, &object, &PipelineConfig::default()).unwrap();

        let copy = cube_object(5.0);
        let mut sharer = print_object(&copy, &config);
        assert_eq!(sharer.fingerprint(), source.fingerprint());
        let mut edited = cube_object(5.0);
        edited.volumes[0].config.set("wall_loops", 5i64);
        assert_ne!(print_object(&edited, &config).fingerprint(), source.fingerprint());

        sharer.set_shared_object(Some(0));
        sharer.copy_layers_from_shared_object(&source);
        assert_eq!(sharer.layers().len(), source.layers().len());
        assert!(sharer.is_step_done(PrintObjectStep::SimplifySupportPath));
    }
}
