//! Region decomposition of print objects.
//!
//! A [`PrintRegion`] is a distinct set of per-region settings. The
//! [`RegionAssigner`] walks an object's volumes per layer range and records,
//! for every volume, which region it contributes to and which earlier volume
//! region it clips. Only intent is recorded here; the polygon booleans run
//! during slicing.

use std::collections::BTreeSet;

use slicekit_config::{is_region_key, DynamicConfig, FuzzySkinType, VOLUME_EXTRUDER_KEY};
use slicekit_math::{BoundingBox3, Transform};
use slicekit_model::{ModelObject, ModelVolume, ObjectId};
use tracing::debug;

/// Config keys carrying a feature filament.
const FILAMENT_KEYS: [&str; 3] = ["wall_filament", "sparse_infill_filament", "solid_infill_filament"];

/// A group of geometry sharing identical per-region settings.
///
/// Identity is the config hash plus equality, never the position.
#[derive(Debug, Clone)]
pub struct PrintRegion {
    config: DynamicConfig,
    config_hash: u64,
}

impl PrintRegion {
    /// Region for `config` (region keys only).
    pub fn new(config: DynamicConfig) -> Self {
        let config_hash = config.content_hash();
        Self { config, config_hash }
    }

    /// Region settings.
    pub fn config(&self) -> &DynamicConfig {
        &self.config
    }

    /// Stable hash of [`PrintRegion::config`].
    pub fn config_hash(&self) -> u64 {
        self.config_hash
    }

    /// 1-based filament printing the walls.
    pub fn wall_filament(&self) -> u32 {
        self.filament("wall_filament")
    }

    /// 1-based filament printing sparse infill.
    pub fn sparse_infill_filament(&self) -> u32 {
        self.filament("sparse_infill_filament")
    }

    /// 1-based filament printing solid infill.
    pub fn solid_infill_filament(&self) -> u32 {
        self.filament("solid_infill_filament")
    }

    /// Every filament this region extrudes with.
    pub fn extruders(&self) -> BTreeSet<u32> {
        FILAMENT_KEYS.iter().map(|k| self.filament(k)).collect()
    }

    fn filament(&self, key: &str) -> u32 {
        self.config.opt_int(key).map(|v| v.max(1) as u32).unwrap_or(1)
    }
}

impl PartialEq for PrintRegion {
    fn eq(&self, other: &Self) -> bool {
        self.config_hash == other.config_hash && self.config == other.config
    }
}

/// Bounding box of one volume inside a layer range.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeExtents {
    /// Model volume id.
    pub volume_id: ObjectId,
    /// Bounds in the object's unrotated frame.
    pub bbox: BoundingBox3,
}

/// One volume's contribution to a layer range.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRegion {
    /// Index of the volume in its model object.
    pub model_volume_idx: usize,
    /// Model volume id.
    pub volume_id: ObjectId,
    /// Region the material goes to; `None` for negative volumes.
    pub region: Option<usize>,
    /// Volume region this one is carved out of (modifiers only).
    pub parent: Option<usize>,
    /// Bounds in the object's unrotated frame.
    pub bbox: BoundingBox3,
}

/// Material of a parent volume region painted with one filament.
#[derive(Debug, Clone, PartialEq)]
pub struct PaintedRegion {
    /// 1-based painted filament.
    pub extruder_id: u32,
    /// Volume region the paint applies to.
    pub parent: usize,
    /// Region the painted material goes to.
    pub region: usize,
}

/// Material of a parent volume region painted with fuzzy skin.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzySkinPaintedRegion {
    /// Volume region the paint applies to.
    pub parent: usize,
    /// Region the painted material goes to.
    pub region: usize,
}

/// Region layout of one Z range with its own overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerRangeRegions {
    /// Bottom of the range (object Z).
    pub lo: f64,
    /// Top of the range.
    pub hi: f64,
    /// Volumes intersecting the range, sorted by id.
    pub volumes: Vec<VolumeExtents>,
    /// Volume contributions in model order.
    pub volume_regions: Vec<VolumeRegion>,
    /// Multi-material overlays.
    pub painted_regions: Vec<PaintedRegion>,
    /// Fuzzy-skin overlays.
    pub fuzzy_skin_painted_regions: Vec<FuzzySkinPaintedRegion>,
}

impl LayerRangeRegions {
    /// True when slice height `z` falls in the range.
    pub fn contains_z(&self, z: f64) -> bool {
        z >= self.lo && z < self.hi
    }
}

/// Region layout of one model object, shared by every print object derived
/// from it under the same unrotated transform.
#[derive(Debug, Clone, PartialEq)]
pub struct PrintObjectRegions {
    /// Distinct regions, in creation order.
    pub all_regions: Vec<PrintRegion>,
    /// Ranges sorted by `lo`, covering `[0, ∞)` without gaps.
    pub layer_ranges: Vec<LayerRangeRegions>,
    /// Frame the volume bounds were computed in.
    pub trafo_bboxes: Transform,
    /// Ids of the volumes considered, sorted.
    pub cached_volume_ids: Vec<ObjectId>,
}

impl PrintObjectRegions {
    /// Range covering slice height `z`.
    pub fn layer_range_at(&self, z: f64) -> Option<&LayerRangeRegions> {
        let idx = self.layer_ranges.partition_point(|r| r.lo <= z);
        idx.checked_sub(1)
            .map(|i| &self.layer_ranges[i])
            .filter(|r| r.contains_z(z))
    }

    /// Region by index.
    pub fn region(&self, idx: usize) -> Option<&PrintRegion> {
        self.all_regions.get(idx)
    }

    /// Number of regions.
    pub fn num_regions(&self) -> usize {
        self.all_regions.len()
    }

    /// Every filament used by some region.
    pub fn extruders(&self) -> BTreeSet<u32> {
        self.all_regions.iter().flat_map(|r| r.extruders()).collect()
    }

    /// True when both describe the same ranges, volumes and parent links,
    /// regardless of region settings.
    pub fn same_layout(&self, other: &PrintObjectRegions) -> bool {
        self.all_regions.len() == other.all_regions.len()
            && self.cached_volume_ids == other.cached_volume_ids
            && self.layer_ranges.len() == other.layer_ranges.len()
            && self.layer_ranges.iter().zip(&other.layer_ranges).all(|(a, b)| {
                a.lo == b.lo
                    && a.hi == b.hi
                    && a.volumes == b.volumes
                    && a.painted_regions == b.painted_regions
                    && a.fuzzy_skin_painted_regions == b.fuzzy_skin_painted_regions
                    && a.volume_regions.len() == b.volume_regions.len()
                    && a.volume_regions.iter().zip(&b.volume_regions).all(|(x, y)| {
                        x.model_volume_idx == y.model_volume_idx
                            && x.region == y.region
                            && x.parent == y.parent
                    })
            })
    }

    /// Region keys whose values differ between matching regions.
    pub fn changed_region_keys(&self, other: &PrintObjectRegions) -> Vec<String> {
        let mut keys: Vec<String> = self
            .all_regions
            .iter()
            .zip(&other.all_regions)
            .flat_map(|(a, b)| a.config().diff(b.config()))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Builds [`PrintObjectRegions`] from a model object.
#[derive(Debug, Clone)]
pub struct RegionAssigner<'a> {
    config: &'a DynamicConfig,
    num_filaments: usize,
}

impl<'a> RegionAssigner<'a> {
    /// Assigner resolving region settings from `config`, the print config
    /// with the object's overrides applied.
    pub fn new(config: &'a DynamicConfig) -> Self {
        Self {
            config,
            num_filaments: config.filament_count(),
        }
    }

    /// Decompose `object` into regions. Volume bounds are computed under
    /// `trafo_bboxes`, which must not contain the Z rotation.
    pub fn assign(&self, object: &ModelObject, trafo_bboxes: &Transform) -> PrintObjectRegions {
        let mut all_regions: Vec<PrintRegion> = Vec::new();
        let base = self.config.region_part();

        let bboxes: Vec<BoundingBox3> = object
            .volumes
            .iter()
            .map(|v| v.mesh.transformed_bounding_box(&trafo_bboxes.then(&v.transform)))
            .collect();

        let mut layer_ranges = Vec::new();
        for (lo, hi, range_config) in split_ranges(object) {
            let mut range_base = base.clone();
            if let Some(cfg) = range_config {
                self.apply_overrides(&mut range_base, cfg);
            }

            let mut range = LayerRangeRegions {
                lo,
                hi,
                volumes: Vec::new(),
                volume_regions: Vec::new(),
                painted_regions: Vec::new(),
                fuzzy_skin_painted_regions: Vec::new(),
            };

            for (idx, volume) in object.volumes.iter().enumerate() {
                if volume.is_support_modifier() {
                    continue;
                }
                let bbox = &bboxes[idx];
                if !bbox.is_valid() || bbox.max.z < lo || bbox.min.z >= hi {
                    continue;
                }
                range.volumes.push(VolumeExtents {
                    volume_id: volume.id,
                    bbox: *bbox,
                });

                if volume.is_model_part() {
                    let cfg = self.volume_config(&range_base, volume);
                    let region = get_create_region(&mut all_regions, cfg);
                    range.volume_regions.push(VolumeRegion {
                        model_volume_idx: idx,
                        volume_id: volume.id,
                        region: Some(region),
                        parent: None,
                        bbox: *bbox,
                    });
                } else if volume.is_negative_volume() {
                    range.volume_regions.push(VolumeRegion {
                        model_volume_idx: idx,
                        volume_id: volume.id,
                        region: None,
                        parent: None,
                        bbox: *bbox,
                    });
                } else if volume.is_modifier() {
                    // A modifier splits every earlier region it overlaps.
                    for parent_idx in 0..range.volume_regions.len() {
                        let parent = &range.volume_regions[parent_idx];
                        let Some(parent_region) = parent.region else {
                            continue;
                        };
                        if !parent.bbox.overlaps(bbox) {
                            continue;
                        }
                        let cfg = self.volume_config(all_regions[parent_region].config(), volume);
                        let region = get_create_region(&mut all_regions, cfg);
                        range.volume_regions.push(VolumeRegion {
                            model_volume_idx: idx,
                            volume_id: volume.id,
                            region: Some(region),
                            parent: Some(parent_idx),
                            bbox: *bbox,
                        });
                    }
                }
            }
            range.volumes.sort_by_key(|v| v.volume_id);
            layer_ranges.push(range);
        }

        if object.is_mm_painted() {
            let painted: BTreeSet<u32> = object
                .volumes
                .iter()
                .flat_map(ModelVolume::painted_extruders)
                .filter(|&e| e >= 1 && e as usize <= self.num_filaments)
                .collect();
            for range in &mut layer_ranges {
                for &extruder_id in &painted {
                    for parent in 0..range.volume_regions.len() {
                        let Some(parent_region) = range.volume_regions[parent].region else {
                            continue;
                        };
                        let mut cfg = all_regions[parent_region].config().clone();
                        set_filament(&mut cfg, extruder_id);
                        let region = get_create_region(&mut all_regions, cfg);
                        range.painted_regions.push(PaintedRegion {
                            extruder_id,
                            parent,
                            region,
                        });
                    }
                }
            }
        }

        if object.is_fuzzy_skin_painted() {
            for range in &mut layer_ranges {
                for parent in 0..range.volume_regions.len() {
                    let Some(parent_region) = range.volume_regions[parent].region else {
                        continue;
                    };
                    let mut cfg = all_regions[parent_region].config().clone();
                    cfg.set("fuzzy_skin", FuzzySkinType::External.as_str());
                    let region = get_create_region(&mut all_regions, cfg);
                    range
                        .fuzzy_skin_painted_regions
                        .push(FuzzySkinPaintedRegion { parent, region });
                }
            }
        }

        let mut cached_volume_ids: Vec<ObjectId> = object
            .volumes
            .iter()
            .filter(|v| !v.is_support_modifier())
            .map(|v| v.id)
            .collect();
        cached_volume_ids.sort();

        debug!(
            object = %object.id,
            regions = all_regions.len(),
            ranges = layer_ranges.len(),
            "generated print object regions"
        );

        PrintObjectRegions {
            all_regions,
            layer_ranges,
            trafo_bboxes: trafo_bboxes.clone(),
            cached_volume_ids,
        }
    }

    fn volume_config(&self, parent: &DynamicConfig, volume: &ModelVolume) -> DynamicConfig {
        let mut cfg = parent.clone();
        self.apply_overrides(&mut cfg, &volume.config);
        cfg
    }

    fn apply_overrides(&self, cfg: &mut DynamicConfig, overrides: &DynamicConfig) {
        cfg.apply(&overrides.filtered(is_region_key));
        if let Ok(extruder) = overrides.opt_int(VOLUME_EXTRUDER_KEY) {
            if extruder >= 1 && extruder as usize <= self.num_filaments {
                set_filament(cfg, extruder as u32);
            }
        }
    }
}

fn set_filament(cfg: &mut DynamicConfig, extruder_id: u32) {
    for key in FILAMENT_KEYS {
        cfg.set(key, extruder_id as i64);
    }
}

/// Index of the region with `config`, creating it if new.
fn get_create_region(regions: &mut Vec<PrintRegion>, config: DynamicConfig) -> usize {
    let candidate = PrintRegion::new(config);
    if let Some(idx) = regions.iter().position(|r| *r == candidate) {
        return idx;
    }
    regions.push(candidate);
    regions.len() - 1
}

/// Non-overlapping `(lo, hi, overrides)` ranges covering `[0, ∞)`.
fn split_ranges(object: &ModelObject) -> Vec<(f64, f64, Option<&DynamicConfig>)> {
    let mut ranges: Vec<_> = object
        .layer_config_ranges
        .iter()
        .filter(|r| r.hi > r.lo && r.hi > 0.0)
        .collect();
    ranges.sort_by(|a, b| a.lo.total_cmp(&b.lo));

    let mut out = Vec::new();
    let mut z = 0.0;
    for r in ranges {
        let lo = r.lo.max(z);
        if lo >= r.hi {
            continue;
        }
        if lo > z {
            out.push((z, lo, None));
        }
        out.push((lo, r.hi, Some(&r.config)));
        z = r.hi;
    }
    out.push((z, f64::MAX, None));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use slicekit_math::Point3;
    use slicekit_model::{
        LayerConfigRange, ModelInstance, ModelVolumeType, PaintedPatch, TriangleMesh,
    };
    use slicekit_math::Vec3;

    fn config() -> DynamicConfig {
        let mut cfg = DynamicConfig::defaults();
        cfg.set("filament_type", vec!["PLA", "PLA", "PETG"]);
        cfg
    }

    fn object() -> ModelObject {
        let mut object = ModelObject::new("obj");
        object.add_volume(ModelVolume::new(
            "part",
            TriangleMesh::cuboid(Point3::origin(), [20.0, 20.0, 20.0]),
        ));
        object.add_instance(ModelInstance::new(Vec3::zeros()));
        object
    }

    #[test]
    fn test_single_part_single_region() {
        let cfg = config();
        let regions = RegionAssigner::new(&cfg).assign(&object(), &Transform::identity());
        assert_eq!(regions.num_regions(), 1);
        assert_eq!(regions.layer_ranges.len(), 1);
        assert_eq!(regions.layer_ranges[0].volume_regions.len(), 1);
    }

    #[test]
    fn test_identical_parts_share_region() {
        let cfg = config();
        let mut obj = object();
        obj.add_volume(ModelVolume::new(
            "second",
            TriangleMesh::cuboid(Point3::new(30.0, 0.0, 0.0), [5.0, 5.0, 5.0]),
        ));
        let regions = RegionAssigner::new(&cfg).assign(&obj, &Transform::identity());
        assert_eq!(regions.num_regions(), 1);
        assert_eq!(regions.layer_ranges[0].volume_regions.len(), 2);
    }

    #[test]
    fn test_modifier_splits_overlapping_parent_only() {
        let cfg = config();
        let mut obj = object();
        obj.add_volume(ModelVolume::new(
            "far",
            TriangleMesh::cuboid(Point3::new(100.0, 0.0, 0.0), [5.0, 5.0, 5.0]),
        ));
        let mut modifier = ModelVolume::with_type(
            "mod",
            TriangleMesh::cuboid(Point3::new(5.0, 5.0, 5.0), [5.0, 5.0, 5.0]),
            ModelVolumeType::ParameterModifier,
        );
        modifier.config.set("wall_loops", 5i64);
        obj.add_volume(modifier);

        let regions = RegionAssigner::new(&cfg).assign(&obj, &Transform::identity());
        let range = &regions.layer_ranges[0];
        assert_eq!(range.volume_regions.len(), 3);
        assert_eq!(range.volume_regions[2].parent, Some(0));
        assert_eq!(regions.num_regions(), 2);
    }

    #[test]
    fn test_negative_volume_has_no_region() {
        let cfg = config();
        let mut obj = object();
        obj.add_volume(ModelVolume::with_type(
            "hole",
            TriangleMesh::cuboid(Point3::new(5.0, 5.0, 0.0), [2.0, 2.0, 20.0]),
            ModelVolumeType::NegativeVolume,
        ));
        let regions = RegionAssigner::new(&cfg).assign(&obj, &Transform::identity());
        let range = &regions.layer_ranges[0];
        assert_eq!(range.volume_regions[1].region, None);
        assert!(range.volumes.iter().any(|v| v.volume_id == obj.volumes[1].id));
    }

    #[test]
    fn test_layer_range_override_and_lookup() {
        let cfg = config();
        let mut obj = object();
        let mut over = DynamicConfig::new();
        over.set("wall_loops", 4i64);
        obj.layer_config_ranges.push(LayerConfigRange {
            lo: 5.0,
            hi: 10.0,
            config: over,
        });
        let regions = RegionAssigner::new(&cfg).assign(&obj, &Transform::identity());
        assert_eq!(regions.layer_ranges.len(), 3);
        assert_eq!(regions.num_regions(), 2);
        let mid = regions.layer_range_at(7.0).unwrap();
        assert_eq!(mid.lo, 5.0);
        assert!(regions.layer_range_at(25.0).is_some());
    }

    #[test]
    fn test_painting_creates_regions_per_filament() {
        let cfg = config();
        let mut obj = object();
        obj.volumes[0].mm_segmentation.push(PaintedPatch {
            extruder_id: 3,
            mesh: TriangleMesh::cuboid(Point3::origin(), [5.0, 5.0, 5.0]),
        });
        let regions = RegionAssigner::new(&cfg).assign(&obj, &Transform::identity());
        let range = &regions.layer_ranges[0];
        assert_eq!(range.painted_regions.len(), 1);
        let painted = regions.region(range.painted_regions[0].region).unwrap();
        assert_eq!(painted.wall_filament(), 3);
        assert_eq!(regions.extruders(), BTreeSet::from([1, 3]));
    }

    #[test]
    fn test_volume_extruder_override() {
        let cfg = config();
        let mut obj = object();
        obj.volumes[0].config.set(VOLUME_EXTRUDER_KEY, 2i64);
        let regions = RegionAssigner::new(&cfg).assign(&obj, &Transform::identity());
        assert_eq!(regions.all_regions[0].sparse_infill_filament(), 2);
    }

    #[test]
    fn test_reassignment_is_idempotent() {
        let cfg = config();
        let obj = object();
        let a = RegionAssigner::new(&cfg).assign(&obj, &Transform::identity());
        let b = RegionAssigner::new(&cfg).assign(&obj, &Transform::identity());
        assert_eq!(a, b);
        assert!(a.same_layout(&b));
        assert!(a.changed_region_keys(&b).is_empty());
    }
}
