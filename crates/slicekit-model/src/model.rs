//! Model objects, volumes and instances.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use slicekit_config::{DynamicConfig, VOLUME_EXTRUDER_KEY};
use slicekit_math::{convex_hull, BoundingBox3, Point2, Polygon, Transform, Vec3};

use crate::error::{ModelError, Result};
use crate::mesh::TriangleMesh;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a model entity.
///
/// Ids survive edits of the entity they name, so print objects and cached
/// data can be matched back to the model after it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The id that names nothing.
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// True unless this is [`ObjectId::invalid`].
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Make sure ids handed out later never collide with `self`.
    fn reserve(self) {
        NEXT_OBJECT_ID.fetch_max(self.0 + 1, Ordering::Relaxed);
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::next()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a volume inside its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVolumeType {
    /// Printed solid.
    #[default]
    ModelPart,
    /// Removes material from the parts it overlaps.
    NegativeVolume,
    /// Overrides region settings where it overlaps parts.
    ParameterModifier,
    /// Forces support under the region it covers.
    SupportEnforcer,
    /// Suppresses support in the region it covers.
    SupportBlocker,
}

/// Faces of a volume painted with one filament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaintedPatch {
    /// 1-based filament the patch is painted with.
    pub extruder_id: u32,
    /// Closed mesh covering the painted material, in volume coordinates.
    pub mesh: TriangleMesh,
}

/// One mesh of a model object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVolume {
    /// Identity.
    #[serde(default)]
    pub id: ObjectId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Role inside the object.
    #[serde(default)]
    pub volume_type: ModelVolumeType,
    /// Geometry in volume coordinates.
    pub mesh: TriangleMesh,
    /// Placement of the volume inside its object.
    #[serde(default)]
    pub transform: Transform,
    /// Per-volume overrides of region options.
    #[serde(default)]
    pub config: DynamicConfig,
    /// Multi-material painting.
    #[serde(default)]
    pub mm_segmentation: Vec<PaintedPatch>,
    /// Fuzzy-skin painting.
    #[serde(default)]
    pub fuzzy_skin_patch: Option<TriangleMesh>,
}

impl ModelVolume {
    /// Printable part with the given mesh.
    pub fn new(name: impl Into<String>, mesh: TriangleMesh) -> Self {
        Self::with_type(name, mesh, ModelVolumeType::ModelPart)
    }

    /// Volume of an explicit type.
    pub fn with_type(name: impl Into<String>, mesh: TriangleMesh, volume_type: ModelVolumeType) -> Self {
        Self {
            id: ObjectId::next(),
            name: name.into(),
            volume_type,
            mesh,
            transform: Transform::identity(),
            config: DynamicConfig::new(),
            mm_segmentation: Vec::new(),
            fuzzy_skin_patch: None,
        }
    }

    /// Printed solid.
    pub fn is_model_part(&self) -> bool {
        self.volume_type == ModelVolumeType::ModelPart
    }

    /// Material remover.
    pub fn is_negative_volume(&self) -> bool {
        self.volume_type == ModelVolumeType::NegativeVolume
    }

    /// Settings modifier.
    pub fn is_modifier(&self) -> bool {
        self.volume_type == ModelVolumeType::ParameterModifier
    }

    /// Support enforcer or blocker.
    pub fn is_support_modifier(&self) -> bool {
        matches!(
            self.volume_type,
            ModelVolumeType::SupportEnforcer | ModelVolumeType::SupportBlocker
        )
    }

    /// Filament forced by the volume's `extruder` override, if any.
    pub fn extruder_id(&self) -> Option<u32> {
        self.config
            .opt_int(VOLUME_EXTRUDER_KEY)
            .ok()
            .filter(|&e| e > 0)
            .map(|e| e as u32)
    }

    /// True when the volume carries multi-material painting.
    pub fn is_mm_painted(&self) -> bool {
        !self.mm_segmentation.is_empty()
    }

    /// True when the volume carries fuzzy-skin painting.
    pub fn is_fuzzy_skin_painted(&self) -> bool {
        self.fuzzy_skin_patch.is_some()
    }

    /// Filaments used by the painting, ascending.
    pub fn painted_extruders(&self) -> BTreeSet<u32> {
        self.mm_segmentation.iter().map(|p| p.extruder_id).collect()
    }
}

/// One placement of an object on the bed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstance {
    /// Identity.
    #[serde(default)]
    pub id: ObjectId,
    /// Translation in mm.
    pub offset: Vec3,
    /// Euler XYZ rotation in radians.
    #[serde(default = "zero_vec")]
    pub rotation: Vec3,
    /// Scale factors.
    #[serde(default = "unit_vec")]
    pub scale: Vec3,
    /// Excluded from slicing when false.
    #[serde(default = "default_true")]
    pub printable: bool,
}

fn zero_vec() -> Vec3 {
    Vec3::zeros()
}

fn unit_vec() -> Vec3 {
    Vec3::new(1.0, 1.0, 1.0)
}

fn default_true() -> bool {
    true
}

impl ModelInstance {
    /// Unrotated, unscaled instance at `offset`.
    pub fn new(offset: Vec3) -> Self {
        Self {
            id: ObjectId::next(),
            offset,
            rotation: zero_vec(),
            scale: unit_vec(),
            printable: true,
        }
    }

    /// Object-to-world transform.
    pub fn transformation(&self) -> Transform {
        Transform::from_parts(&self.offset, &self.rotation, &self.scale)
    }

    /// Move the instance.
    pub fn set_offset(&mut self, offset: Vec3) {
        self.offset = offset;
    }
}

/// Config override applied to a Z range of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfigRange {
    /// Bottom of the range (mm, object coordinates).
    pub lo: f64,
    /// Top of the range.
    pub hi: f64,
    /// Overrides for layers whose slice Z falls in `[lo, hi)`.
    pub config: DynamicConfig,
}

/// A printable object: volumes sharing one set of instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelObject {
    /// Identity.
    #[serde(default)]
    pub id: ObjectId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Volumes in model order.
    pub volumes: Vec<ModelVolume>,
    /// Placements on the bed.
    #[serde(default)]
    pub instances: Vec<ModelInstance>,
    /// Object-level overrides.
    #[serde(default)]
    pub config: DynamicConfig,
    /// Per-Z-range overrides, sorted by `lo`.
    #[serde(default)]
    pub layer_config_ranges: Vec<LayerConfigRange>,
    /// User-edited variable layer height profile: `[z0, h0, z1, h1, ...]`.
    #[serde(default)]
    pub layer_height_profile: Vec<f64>,
}

impl ModelObject {
    /// Empty object.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ObjectId::next(),
            name: name.into(),
            volumes: Vec::new(),
            instances: Vec::new(),
            config: DynamicConfig::new(),
            layer_config_ranges: Vec::new(),
            layer_height_profile: Vec::new(),
        }
    }

    /// Append a volume, returning its index.
    pub fn add_volume(&mut self, volume: ModelVolume) -> usize {
        self.volumes.push(volume);
        self.volumes.len() - 1
    }

    /// Append an instance, returning its index.
    pub fn add_instance(&mut self, instance: ModelInstance) -> usize {
        self.instances.push(instance);
        self.instances.len() - 1
    }

    /// Instance by index.
    pub fn instance(&self, idx: usize) -> Option<&ModelInstance> {
        self.instances.get(idx)
    }

    fn parts(&self) -> impl Iterator<Item = &ModelVolume> {
        self.volumes.iter().filter(|v| v.is_model_part())
    }

    fn checked_instance(&self, idx: usize) -> Result<&ModelInstance> {
        self.instances.get(idx).ok_or(ModelError::InvalidInstance {
            object: 0,
            instance: idx,
        })
    }

    /// Bounding box of the printable parts in object coordinates.
    pub fn raw_bounding_box(&self) -> BoundingBox3 {
        let mut bb = BoundingBox3::empty();
        for v in self.parts() {
            bb.merge(&v.mesh.transformed_bounding_box(&v.transform));
        }
        bb
    }

    /// Bounding box of the printable parts placed by instance `idx`.
    pub fn instance_bounding_box(&self, idx: usize) -> Result<BoundingBox3> {
        let trafo = self.checked_instance(idx)?.transformation();
        let mut bb = BoundingBox3::empty();
        for v in self.parts() {
            bb.merge(&v.mesh.transformed_bounding_box(&trafo.then(&v.transform)));
        }
        Ok(bb)
    }

    /// 2D convex hull of the printable parts placed by instance `idx`.
    pub fn instance_convex_hull(&self, idx: usize) -> Result<Polygon> {
        let trafo = self.checked_instance(idx)?.transformation();
        let points: Vec<Point2> = self
            .parts()
            .flat_map(|v| {
                let t = trafo.then(&v.transform);
                v.mesh
                    .points()
                    .map(move |p| {
                        let q = t.apply_point(&p);
                        Point2::new(q.x, q.y)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(convex_hull(&points))
    }

    /// Bounding box of the instance hull, with the Z extent of the instance.
    pub fn instance_convex_hull_bounding_box(&self, idx: usize) -> Result<BoundingBox3> {
        let mut bb = self.instance_bounding_box(idx)?;
        let hull_bb = self.instance_convex_hull(idx)?.bounding_box();
        if hull_bb.is_valid() {
            bb.min.x = hull_bb.min.x;
            bb.min.y = hull_bb.min.y;
            bb.max.x = hull_bb.max.x;
            bb.max.y = hull_bb.max.y;
        }
        Ok(bb)
    }

    /// Height of the first instance above the bed.
    pub fn max_z(&self) -> f64 {
        self.instance_bounding_box(0)
            .map(|bb| if bb.is_valid() { bb.max.z } else { 0.0 })
            .unwrap_or(0.0)
    }

    /// Lowest Z of the first instance; negative when the object sinks.
    pub fn min_z(&self) -> f64 {
        self.instance_bounding_box(0)
            .map(|bb| if bb.is_valid() { bb.min.z } else { 0.0 })
            .unwrap_or(0.0)
    }

    /// Drop every instance so its lowest point rests on Z = 0.
    pub fn ensure_on_bed(&mut self) {
        for idx in 0..self.instances.len() {
            if let Ok(bb) = self.instance_bounding_box(idx) {
                if bb.is_valid() {
                    self.instances[idx].offset.z -= bb.min.z;
                }
            }
        }
    }

    /// True when any part carries multi-material painting.
    pub fn is_mm_painted(&self) -> bool {
        self.volumes.iter().any(ModelVolume::is_mm_painted)
    }

    /// True when any part carries fuzzy-skin painting.
    pub fn is_fuzzy_skin_painted(&self) -> bool {
        self.volumes.iter().any(ModelVolume::is_fuzzy_skin_painted)
    }

    /// True when the object has support enforcers or blockers.
    pub fn has_support_modifiers(&self) -> bool {
        self.volumes.iter().any(ModelVolume::is_support_modifier)
    }

    /// Layer range override covering slice height `z`, if any.
    pub fn layer_range_at(&self, z: f64) -> Option<&LayerConfigRange> {
        self.layer_config_ranges
            .iter()
            .find(|r| z >= r.lo && z < r.hi)
    }

    fn reserve_ids(&self) {
        self.id.reserve();
        for v in &self.volumes {
            v.id.reserve();
        }
        for i in &self.instances {
            i.id.reserve();
        }
    }
}

/// A project: every object the user loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Objects in model order.
    pub objects: Vec<ModelObject>,
}

impl Model {
    /// Empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an object, returning its index.
    pub fn add_object(&mut self, object: ModelObject) -> usize {
        self.objects.push(object);
        self.objects.len() - 1
    }

    /// Remove the object at `idx`. Later objects shift down by one.
    pub fn delete_object(&mut self, idx: usize) -> Result<ModelObject> {
        if idx >= self.objects.len() {
            return Err(ModelError::InvalidObject(idx));
        }
        Ok(self.objects.remove(idx))
    }

    /// Object by index.
    pub fn object(&self, idx: usize) -> Result<&ModelObject> {
        self.objects.get(idx).ok_or(ModelError::InvalidObject(idx))
    }

    /// Mutable object by index.
    pub fn object_mut(&mut self, idx: usize) -> Result<&mut ModelObject> {
        self.objects.get_mut(idx).ok_or(ModelError::InvalidObject(idx))
    }

    /// Object by id.
    pub fn find_object(&self, id: ObjectId) -> Option<(usize, &ModelObject)> {
        self.objects.iter().enumerate().find(|(_, o)| o.id == id)
    }

    /// Instance `instance_idx` of object `object_idx`.
    pub fn instance(&self, object_idx: usize, instance_idx: usize) -> Result<&ModelInstance> {
        self.object(object_idx)?
            .instances
            .get(instance_idx)
            .ok_or(ModelError::InvalidInstance {
                object: object_idx,
                instance: instance_idx,
            })
    }

    /// Bounding box of one instance.
    pub fn instance_bounding_box(&self, object_idx: usize, instance_idx: usize) -> Result<BoundingBox3> {
        self.instance(object_idx, instance_idx)?;
        self.objects[object_idx].instance_bounding_box(instance_idx)
    }

    /// Parse a project from JSON.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let model: Model = serde_json::from_str(s)?;
        for object in &model.objects {
            object.reserve_ids();
        }
        Ok(model)
    }

    /// Serialize to JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a JSON project file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Write a JSON project file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use slicekit_math::Point3;

    fn cube_object(size: f64) -> ModelObject {
        let mut object = ModelObject::new("cube");
        object.add_volume(ModelVolume::new(
            "part",
            TriangleMesh::cuboid(Point3::origin(), [size, size, size]),
        ));
        object.add_instance(ModelInstance::new(Vec3::new(10.0, 20.0, 0.0)));
        object
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ObjectId::next();
        let b = ObjectId::next();
        assert_ne!(a, b);
        assert!(a.is_valid());
        assert!(!ObjectId::invalid().is_valid());
    }

    #[test]
    fn test_instance_bounding_box_is_translated() {
        let object = cube_object(10.0);
        let bb = object.instance_bounding_box(0).unwrap();
        assert_relative_eq!(bb.min.x, 10.0, epsilon = 1e-6);
        assert_relative_eq!(bb.max.y, 30.0, epsilon = 1e-6);
        assert_relative_eq!(object.max_z(), 10.0, epsilon = 1e-6);
        assert!(object.instance_bounding_box(3).is_err());
    }

    #[test]
    fn test_convex_hull_of_rotated_instance() {
        let mut object = cube_object(10.0);
        object.instances[0].rotation.z = std::f64::consts::FRAC_PI_4;
        let hull = object.instance_convex_hull(0).unwrap();
        assert_eq!(hull.len(), 4);
        assert_relative_eq!(hull.area(), 100.0, epsilon = 1e-3);
        let bb = object.instance_convex_hull_bounding_box(0).unwrap();
        assert_relative_eq!(bb.size().x, 10.0 * 2f64.sqrt(), epsilon = 1e-3);
    }

    #[test]
    fn test_modifiers_do_not_grow_bounds() {
        let mut object = cube_object(10.0);
        object.add_volume(ModelVolume::with_type(
            "big modifier",
            TriangleMesh::cuboid(Point3::origin(), [50.0, 50.0, 50.0]),
            ModelVolumeType::ParameterModifier,
        ));
        assert_relative_eq!(object.raw_bounding_box().max.z, 10.0, epsilon = 1e-6);
    }

    #[test]
    fn test_ensure_on_bed_lifts_sunk_instance() {
        let mut object = cube_object(10.0);
        object.instances[0].offset.z = -3.0;
        assert_relative_eq!(object.min_z(), -3.0, epsilon = 1e-6);
        object.ensure_on_bed();
        assert_relative_eq!(object.min_z(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_volume_extruder_override() {
        let mut volume = ModelVolume::new("part", TriangleMesh::new());
        assert_eq!(volume.extruder_id(), None);
        volume.config.set(VOLUME_EXTRUDER_KEY, 2i64);
        assert_eq!(volume.extruder_id(), Some(2));
    }

    #[test]
    fn test_delete_object_shifts_indices() {
        let mut model = Model::new();
        for _ in 0..3 {
            model.add_object(cube_object(5.0));
        }
        let last = model.objects[2].id;
        model.delete_object(1).unwrap();
        assert_eq!(model.objects[1].id, last);
        assert!(matches!(model.delete_object(7), Err(ModelError::InvalidObject(7))));
    }

    #[test]
    fn test_json_round_trip_reserves_ids() {
        let mut model = Model::new();
        model.add_object(cube_object(5.0));
        let text = model.to_json_string().unwrap();
        let loaded = Model::from_json_str(&text).unwrap();
        assert_eq!(loaded, model);
        assert!(ObjectId::next().0 > loaded.objects[0].id.0);
    }
}
