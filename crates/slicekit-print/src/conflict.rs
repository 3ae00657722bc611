//! Detection of objects whose layers collide on the plate.

use serde::{Deserialize, Serialize};
use slicekit_math::{overlaps, BoundingBox, ExPolygon, ExPolygons, Polygon, EPSILON};
use tracing::debug;

use crate::print_object::PrintObject;
use crate::wipe_tower::WipeTowerData;

/// Name reported for the purge tower.
pub const WIPE_TOWER_NAME: &str = "Prime Tower";

/// Overlaps smaller than this are ignored (mm²).
const MIN_CONFLICT_AREA: f64 = 0.01;

/// First collision found between two printed things.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResult {
    /// Name of the first object.
    pub object1: String,
    /// Name of the second object.
    pub object2: String,
    /// Print Z of the colliding layer.
    pub height: f64,
}

struct Footprint {
    name: String,
    layers: Vec<(f64, ExPolygons)>,
    bbox: BoundingBox,
}

impl Footprint {
    fn layer_at(&self, print_z: f64) -> Option<&ExPolygons> {
        let idx = self.layers.partition_point(|(z, _)| *z < print_z - EPSILON);
        self.layers
            .get(idx)
            .filter(|(z, _)| (z - print_z).abs() < EPSILON)
            .map(|(_, polys)| polys)
    }
}

fn instance_footprints(objects: &[PrintObject]) -> Vec<Footprint> {
    let mut out = Vec::new();
    for object in objects {
        for instance in object.instances() {
            let mut bbox = BoundingBox::empty();
            let layers = object
                .layers()
                .iter()
                .filter(|l| !l.lslices.is_empty())
                .map(|l| {
                    let polys: ExPolygons = l
                        .lslices
                        .iter()
                        .map(|e| {
                            let mut e = e.clone();
                            e.translate(&instance.shift);
                            bbox.merge(&e.bounding_box());
                            e
                        })
                        .collect();
                    (l.print_z, polys)
                })
                .collect();
            out.push(Footprint {
                name: object.name().to_string(),
                layers,
                bbox,
            });
        }
    }
    out
}

fn tower_footprint(tower: &WipeTowerData, layer_zs: &[f64]) -> Option<Footprint> {
    let bbox = tower.bbx_with_brim();
    if !bbox.is_valid() {
        return None;
    }
    let square = vec![ExPolygon::new(Polygon::rectangle(bbox.min, bbox.max))];
    let layers = layer_zs
        .iter()
        .filter(|&&z| z <= tower.height + EPSILON)
        .map(|&z| (z, square.clone()))
        .collect();
    Some(Footprint {
        name: WIPE_TOWER_NAME.to_string(),
        layers,
        bbox,
    })
}

/// Lowest layer on which two instances, or an instance and the purge tower,
/// occupy the same area.
pub fn find_conflict(objects: &[PrintObject], wipe_tower: Option<&WipeTowerData>) -> Option<ConflictResult> {
    let mut footprints = instance_footprints(objects);
    if let Some(tower) = wipe_tower.filter(|t| !t.is_empty()) {
        let mut zs: Vec<f64> = footprints
            .iter()
            .flat_map(|f| f.layers.iter().map(|(z, _)| *z))
            .collect();
        zs.sort_by(f64::total_cmp);
        zs.dedup_by(|a, b| (*a - *b).abs() < EPSILON);
        footprints.extend(tower_footprint(tower, &zs));
    }

    let mut best: Option<ConflictResult> = None;
    for (i, a) in footprints.iter().enumerate() {
        for b in &footprints[i + 1..] {
            if !a.bbox.overlaps(&b.bbox) {
                continue;
            }
            for (z, polys) in &a.layers {
                if best.as_ref().is_some_and(|c| c.height <= *z) {
                    break;
                }
                let Some(other) = b.layer_at(*z) else {
                    continue;
                };
                if overlaps(polys, other, MIN_CONFLICT_AREA) {
                    best = Some(ConflictResult {
                        object1: a.name.clone(),
                        object2: b.name.clone(),
                        height: *z,
                    });
                    break;
                }
            }
        }
    }
    if let Some(c) = &best {
        debug!(object1 = %c.object1, object2 = %c.object2, height = c.height, "found toolpath conflict");
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::print_object::PrintInstance;
    use slicekit_config::DynamicConfig;
    use slicekit_math::{Point2, Transform, Vec2, Vec3};
    use slicekit_model::{ModelInstance, ModelObject};

    fn tower_of_squares(name: &str, shift: Vec2, from_layer: usize) -> PrintObject {
        let mut model = ModelObject::new(name);
        model.add_instance(ModelInstance::new(Vec3::zeros()));
        let instances = vec![PrintInstance {
            model_instance_id: model.instances[0].id,
            shift,
            id: 0,
        }];
        let mut object = PrintObject::new(&model, Transform::identity(), instances, &DynamicConfig::defaults());
        for i in 0..10 {
            let z = 0.2 * (i + 1) as f64;
            let layer = object.add_layer(z - 0.1, z, 0.2);
            if i >= from_layer {
                layer.lslices = vec![ExPolygon::new(Polygon::rectangle(
                    Point2::new(-5.0, -5.0),
                    Point2::new(5.0, 5.0),
                ))];
            }
        }
        object
    }

    #[test]
    fn test_separate_objects_do_not_conflict() {
        let objects = vec![
            tower_of_squares("a", Vec2::new(20.0, 20.0), 0),
            tower_of_squares("b", Vec2::new(40.0, 20.0), 0),
        ];
        assert!(find_conflict(&objects, None).is_none());
    }

    #[test]
    fn test_reports_lowest_colliding_layer() {
        let objects = vec![
            tower_of_squares("a", Vec2::new(20.0, 20.0), 0),
            tower_of_squares("b", Vec2::new(25.0, 20.0), 3),
        ];
        let conflict = find_conflict(&objects, None).unwrap();
        assert_eq!(conflict.object1, "a");
        assert_eq!(conflict.object2, "b");
        approx::assert_relative_eq!(conflict.height, 0.8, epsilon = 1e-9);
    }

    #[test]
    fn test_conflict_with_tower() {
        let objects = vec![tower_of_squares("a", Vec2::new(20.0, 20.0), 0)];
        let tower = WipeTowerData {
            tool_changes: vec![crate::wipe_tower::ToolChange {
                print_z: 0.2,
                old_tool: 1,
                new_tool: 2,
                purge_volume: 45.0,
            }],
            bbx: BoundingBox::new(Point2::new(22.0, 10.0), Point2::new(30.0, 30.0)),
            height: 1.0,
            ..Default::default()
        };
        let conflict = find_conflict(&objects, Some(&tower)).unwrap();
        assert_eq!(conflict.object2, WIPE_TOWER_NAME);
        approx::assert_relative_eq!(conflict.height, 0.2, epsilon = 1e-9);
    }
}
