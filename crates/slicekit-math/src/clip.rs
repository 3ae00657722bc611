//! Polygon boolean operations and offsets.
//!
//! Booleans go through the `geo` crate; these helpers only convert between
//! its types and [`ExPolygon`], closing rings on the way in and normalizing
//! windings on the way out.

use geo::{Area, BooleanOps, ConvexHull, Coord, LineString, MultiPoint, MultiPolygon};

use crate::polygon::{ExPolygon, Polygon};
use crate::Point2;

fn ring_to_geo(poly: &Polygon) -> LineString<f64> {
    let mut ring: Vec<Coord<f64>> = poly.points.iter().map(|p| Coord { x: p.x, y: p.y }).collect();
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last()) {
        if first != *last {
            ring.push(first);
        }
    }
    LineString::new(ring)
}

fn ring_from_geo(ring: &LineString<f64>) -> Polygon {
    let mut points: Vec<Point2> = ring.coords().map(|c| Point2::new(c.x, c.y)).collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    Polygon::new(points)
}

fn expolygon_to_geo(expoly: &ExPolygon) -> geo::Polygon<f64> {
    geo::Polygon::new(
        ring_to_geo(&expoly.contour),
        expoly.holes.iter().map(ring_to_geo).collect(),
    )
}

fn to_geo(expolys: &[ExPolygon]) -> MultiPolygon<f64> {
    // Fold through union so overlapping inputs become valid geometry.
    expolys
        .iter()
        .filter(|e| e.contour.len() >= 3)
        .fold(MultiPolygon::new(Vec::new()), |acc, e| {
            acc.union(&MultiPolygon::new(vec![expolygon_to_geo(e)]))
        })
}

fn from_geo(mp: &MultiPolygon<f64>) -> Vec<ExPolygon> {
    mp.iter()
        .map(|p| {
            ExPolygon::with_holes(
                ring_from_geo(p.exterior()),
                p.interiors().iter().map(ring_from_geo).collect(),
            )
        })
        .filter(|e| e.contour.len() >= 3 && e.area() > 1e-9)
        .collect()
}

/// Union of all input polygons.
pub fn union_ex(expolys: &[ExPolygon]) -> Vec<ExPolygon> {
    from_geo(&to_geo(expolys))
}

/// `subject` minus `clip`.
pub fn diff_ex(subject: &[ExPolygon], clip: &[ExPolygon]) -> Vec<ExPolygon> {
    if subject.is_empty() {
        return Vec::new();
    }
    if clip.is_empty() {
        return union_ex(subject);
    }
    from_geo(&to_geo(subject).difference(&to_geo(clip)))
}

/// Area covered by both `subject` and `clip`.
pub fn intersection_ex(subject: &[ExPolygon], clip: &[ExPolygon]) -> Vec<ExPolygon> {
    if subject.is_empty() || clip.is_empty() {
        return Vec::new();
    }
    from_geo(&to_geo(subject).intersection(&to_geo(clip)))
}

/// True when the two sets share more than `min_area` mm² of area.
pub fn overlaps(a: &[ExPolygon], b: &[ExPolygon], min_area: f64) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let bb_a = a.iter().fold(crate::BoundingBox::empty(), |mut acc, e| {
        acc.merge(&e.bounding_box());
        acc
    });
    let bb_b = b.iter().fold(crate::BoundingBox::empty(), |mut acc, e| {
        acc.merge(&e.bounding_box());
        acc
    });
    if !bb_a.overlaps(&bb_b) {
        return false;
    }
    to_geo(a).intersection(&to_geo(b)).unsigned_area() > min_area
}

/// Total area of a polygon set.
pub fn area_ex(expolys: &[ExPolygon]) -> f64 {
    expolys.iter().map(ExPolygon::area).sum()
}

/// Grow (`delta > 0`) or shrink (`delta < 0`) every polygon by `delta`.
///
/// Contours and holes are offset vertex-wise, then re-unioned so parts that
/// grew into each other merge. Parts that collapse are dropped.
pub fn offset_ex(expolys: &[ExPolygon], delta: f64) -> Vec<ExPolygon> {
    if delta == 0.0 {
        return expolys.to_vec();
    }
    let mut out = Vec::with_capacity(expolys.len());
    for expoly in expolys {
        // Polygon::offset treats positive as inward for either winding.
        let Some(contour) = expoly.contour.offset(-delta) else {
            continue;
        };
        let holes = expoly
            .holes
            .iter()
            .filter_map(|h| h.offset(delta))
            .collect();
        out.push(ExPolygon::with_holes(contour, holes));
    }
    union_ex(&out)
}

/// Convex hull of a point cloud, counter-clockwise.
pub fn convex_hull(points: &[Point2]) -> Polygon {
    if points.len() < 3 {
        return Polygon::new(points.to_vec());
    }
    let mp: MultiPoint<f64> = points
        .iter()
        .map(|p| geo::Point::new(p.x, p.y))
        .collect::<Vec<_>>()
        .into();
    let mut hull = ring_from_geo(mp.convex_hull().exterior());
    hull.ensure_ccw();
    hull
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> ExPolygon {
        ExPolygon::new(Polygon::rectangle(Point2::new(x0, y0), Point2::new(x1, y1)))
    }

    #[test]
    fn test_union_merges_overlapping() {
        let merged = union_ex(&[rect(0.0, 0.0, 10.0, 10.0), rect(5.0, 0.0, 15.0, 10.0)]);
        assert_eq!(merged.len(), 1);
        assert_relative_eq!(area_ex(&merged), 150.0, epsilon = 1e-3);
    }

    #[test]
    fn test_diff_cuts_hole() {
        let cut = diff_ex(&[rect(0.0, 0.0, 10.0, 10.0)], &[rect(4.0, 4.0, 6.0, 6.0)]);
        assert_eq!(cut.len(), 1);
        assert_eq!(cut[0].holes.len(), 1);
        assert_relative_eq!(area_ex(&cut), 96.0, epsilon = 1e-3);
    }

    #[test]
    fn test_intersection_and_overlaps() {
        let a = [rect(0.0, 0.0, 10.0, 10.0)];
        let b = [rect(8.0, 8.0, 20.0, 20.0)];
        let c = [rect(30.0, 30.0, 40.0, 40.0)];
        assert_relative_eq!(area_ex(&intersection_ex(&a, &b)), 4.0, epsilon = 1e-3);
        assert!(overlaps(&a, &b, 1e-6));
        assert!(!overlaps(&a, &c, 1e-6));
    }

    #[test]
    fn test_offset_shrinks_and_grows() {
        let shrunk = offset_ex(&[rect(0.0, 0.0, 10.0, 10.0)], -1.0);
        assert_relative_eq!(area_ex(&shrunk), 64.0, epsilon = 1e-3);
        let grown = offset_ex(&[rect(0.0, 0.0, 10.0, 10.0)], 1.0);
        assert!(area_ex(&grown) > 100.0);
    }

    #[test]
    fn test_convex_hull_of_square_with_inner_point() {
        let hull = convex_hull(&[
            Point2::new(0.0, 0.0),
            Point2::new(4.0, 0.0),
            Point2::new(2.0, 1.0),
            Point2::new(4.0, 4.0),
            Point2::new(0.0, 4.0),
        ]);
        assert_eq!(hull.len(), 4);
        assert!(hull.is_ccw());
        assert_relative_eq!(hull.area(), 16.0);
    }
}
