//! Skirt and brim around the first layer.

use std::collections::BTreeMap;

use slicekit_config::{BrimType, DynamicConfig};
use slicekit_math::{convex_hull, overlaps, ExPolygon, ExPolygons, Point2, Polygon};
use slicekit_model::ObjectId;
use tracing::debug;

use crate::error::Result;
use crate::layer::{ExtrusionEntityCollection, ExtrusionPath, ExtrusionRole};
use crate::print_object::PrintObject;
use crate::wipe_tower::WipeTowerData;

/// First-layer islands of every instance of `object`, on the plate.
pub fn object_first_layer_islands(object: &PrintObject) -> ExPolygons {
    let Some(first) = object.layers().first() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(first.lslices.len() * object.instances().len());
    for instance in object.instances() {
        for island in &first.lslices {
            let mut island = island.clone();
            island.translate(&instance.shift);
            out.push(island);
        }
    }
    out
}

fn support_first_layer_islands(object: &PrintObject) -> ExPolygons {
    let Some(first) = object.support_layers().first() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for instance in object.instances() {
        for island in &first.support_islands {
            let mut island = island.clone();
            island.translate(&instance.shift);
            out.push(island);
        }
    }
    out
}

/// Convex hull of everything printed on the first layer: object islands,
/// support, brims and the purge tower footprint.
pub fn first_layer_convex_hull(
    objects: &[PrintObject],
    brims: &BTreeMap<ObjectId, ExtrusionEntityCollection>,
    wipe_tower: Option<&WipeTowerData>,
) -> Polygon {
    let mut points: Vec<Point2> = Vec::new();
    for object in objects {
        for island in object_first_layer_islands(object)
            .iter()
            .chain(support_first_layer_islands(object).iter())
        {
            points.extend(island.contour.points.iter().copied());
        }
    }
    for brim in brims.values() {
        for path in &brim.entities {
            points.extend(path.polyline.points.iter().copied());
        }
    }
    if let Some(tower) = wipe_tower {
        let bb = tower.bbx_with_brim();
        if bb.is_valid() {
            points.extend([
                bb.min,
                Point2::new(bb.max.x, bb.min.y),
                bb.max,
                Point2::new(bb.min.x, bb.max.y),
            ]);
        }
    }
    if points.len() < 3 {
        return Polygon::new(Vec::new());
    }
    convex_hull(&points)
}

/// Skirt loops around `hull`, innermost first.
pub fn make_skirt(hull: &Polygon, config: &DynamicConfig, first_layer_height: f64) -> Result<ExtrusionEntityCollection> {
    let loops = config.opt_int("skirt_loops")?.max(0) as usize;
    let distance = config.opt_float("skirt_distance")?.max(0.0);
    let width = config.opt_float("line_width")?;
    let mut skirt = ExtrusionEntityCollection::new();
    if loops == 0 || hull.len() < 3 {
        return Ok(skirt);
    }
    for i in 0..loops {
        let d = distance + (i as f64 + 0.5) * width;
        if let Some(ring) = hull.offset(-d) {
            skirt.push(ExtrusionPath::new(
                ExtrusionRole::Skirt,
                ring.to_polyline(),
                width,
                first_layer_height,
            ));
        }
    }
    debug!(loops = skirt.len(), "generated skirt");
    Ok(skirt)
}

/// True when the object gets a brim under `brim_type`.
fn wants_brim(object: &PrintObject, brim_type: BrimType) -> bool {
    match brim_type {
        BrimType::NoBrim => false,
        BrimType::OuterOnly => true,
        // Tall objects on a narrow footprint tip over.
        BrimType::AutoBrim => {
            let size = object.size();
            object.max_z() > size.x.min(size.y)
        }
    }
}

/// Brim loops of every object, keyed by model object id.
///
/// A loop that would run into another object's first layer is dropped along
/// with every loop outside it.
pub fn make_brims(objects: &[PrintObject], first_layer_height: f64) -> Result<BTreeMap<ObjectId, ExtrusionEntityCollection>> {
    let islands: Vec<ExPolygons> = objects.iter().map(object_first_layer_islands).collect();
    let mut brims = BTreeMap::new();

    for (idx, object) in objects.iter().enumerate() {
        let config = object.config();
        let brim_type: BrimType = config.opt_enum("brim_type")?;
        let brim_width = config.opt_float("brim_width")?;
        if brim_width <= 0.0 || object.has_raft() || !wants_brim(object, brim_type) {
            continue;
        }
        let width = config.opt_float("line_width")?;
        let gap = config.opt_float("brim_object_gap")?.max(0.0);
        let loops = (brim_width / width).floor() as usize;

        let others: ExPolygons = islands
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != idx)
            .flat_map(|(_, isl)| isl.iter().cloned())
            .collect();

        let mut brim = ExtrusionEntityCollection::new();
        for island in &islands[idx] {
            for i in 0..loops {
                let d = gap + (i as f64 + 0.5) * width;
                let Some(ring) = island.contour.offset(-d) else {
                    break;
                };
                if !others.is_empty() && overlaps(&[ExPolygon::new(ring.clone())], &others, 1e-6) {
                    break;
                }
                brim.push(ExtrusionPath::new(
                    ExtrusionRole::Brim,
                    ring.to_polyline(),
                    width,
                    first_layer_height,
                ));
            }
        }
        if !brim.is_empty() {
            debug!(object = %object.id(), loops = brim.len(), "generated brim");
            brims.insert(object.id(), brim);
        }
    }
    Ok(brims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::print_object::PrintInstance;
    use slicekit_math::{Transform, Vec2};
    use slicekit_model::{ModelInstance, ModelObject};

    fn object_with_square(shift: Vec2, config: &DynamicConfig) -> PrintObject {
        let mut model = ModelObject::new("square");
        model.add_instance(ModelInstance::new(slicekit_math::Vec3::zeros()));
        let instances = vec![PrintInstance {
            model_instance_id: model.instances[0].id,
            shift,
            id: 0,
        }];
        let mut object = PrintObject::new(&model, Transform::identity(), instances, config);
        let layer = object.add_layer(0.1, 0.2, 0.2);
        layer.lslices = vec![ExPolygon::new(Polygon::rectangle(
            Point2::new(-5.0, -5.0),
            Point2::new(5.0, 5.0),
        ))];
        object
    }

    fn brim_config(width: f64) -> DynamicConfig {
        let mut config = DynamicConfig::defaults();
        config.set("brim_type", "outer_only");
        config.set("brim_width", width);
        config
    }

    #[test]
    fn test_brim_loop_count() {
        let config = brim_config(2.0);
        let objects = vec![object_with_square(Vec2::new(50.0, 50.0), &config)];
        let brims = make_brims(&objects, 0.2).unwrap();
        // floor(2.0 / 0.42)
        assert_eq!(brims[&objects[0].id()].len(), 4);
    }

    #[test]
    fn test_no_brim_type() {
        let mut config = brim_config(5.0);
        config.set("brim_type", "no_brim");
        let objects = vec![object_with_square(Vec2::new(50.0, 50.0), &config)];
        assert!(make_brims(&objects, 0.2).unwrap().is_empty());
    }

    #[test]
    fn test_brim_stops_at_neighbour() {
        let config = brim_config(5.0);
        let objects = vec![
            object_with_square(Vec2::new(50.0, 50.0), &config),
            object_with_square(Vec2::new(62.0, 50.0), &config),
        ];
        let brims = make_brims(&objects, 0.2).unwrap();
        // Objects are 2 mm apart; only loops within 2 mm survive.
        let loops = brims[&objects[0].id()].len();
        assert!(loops > 0 && loops < 11, "{loops}");
    }

    #[test]
    fn test_skirt_surrounds_hull() {
        let mut config = DynamicConfig::defaults();
        config.set("skirt_loops", 2i64);
        let objects = vec![object_with_square(Vec2::new(50.0, 50.0), &config)];
        let hull = first_layer_convex_hull(&objects, &BTreeMap::new(), None);
        let skirt = make_skirt(&hull, &config, 0.2).unwrap();
        assert_eq!(skirt.len(), 2);
        let bb = skirt.bounding_box();
        assert!(bb.min.x < 45.0 - 2.0 && bb.max.x > 55.0 + 2.0);
    }

    #[test]
    fn test_hull_includes_tower() {
        let config = DynamicConfig::defaults();
        let objects = vec![object_with_square(Vec2::new(50.0, 50.0), &config)];
        let tower = WipeTowerData {
            bbx: slicekit_math::BoundingBox::new(Point2::new(100.0, 100.0), Point2::new(110.0, 110.0)),
            ..Default::default()
        };
        let hull = first_layer_convex_hull(&objects, &BTreeMap::new(), Some(&tower));
        assert!(hull.bounding_box().max.x >= 110.0);
    }
}
