//! Planar paths: closed polygons, open polylines and polygons with holes.

use serde::{Deserialize, Serialize};

use crate::bbox::BoundingBox;
use crate::{Point2, Vec2};

/// A 2D polygon (closed path).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Polygon {
    /// Vertices of the polygon in order.
    pub points: Vec<Point2>,
}

impl Polygon {
    /// Create a new polygon from points.
    pub fn new(points: Vec<Point2>) -> Self {
        Self { points }
    }

    /// Axis-aligned rectangle, counter-clockwise.
    pub fn rectangle(min: Point2, max: Point2) -> Self {
        Self::new(vec![
            min,
            Point2::new(max.x, min.y),
            max,
            Point2::new(min.x, max.y),
        ])
    }

    /// Check if the polygon is empty.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of vertices.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Signed area of the polygon.
    /// Positive for counter-clockwise, negative for clockwise.
    pub fn signed_area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let mut area = 0.0;
        for i in 0..n {
            let j = (i + 1) % n;
            area += self.points[i].x * self.points[j].y;
            area -= self.points[j].x * self.points[i].y;
        }
        area / 2.0
    }

    /// Unsigned area.
    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    /// Is the polygon counter-clockwise?
    pub fn is_ccw(&self) -> bool {
        self.signed_area() > 0.0
    }

    /// Reverse the winding order.
    pub fn reverse(&mut self) {
        self.points.reverse();
    }

    /// Ensure counter-clockwise winding.
    pub fn ensure_ccw(&mut self) {
        if !self.is_ccw() {
            self.reverse();
        }
    }

    /// Ensure clockwise winding.
    pub fn ensure_cw(&mut self) {
        if self.is_ccw() {
            self.reverse();
        }
    }

    /// Perimeter length.
    pub fn perimeter(&self) -> f64 {
        let n = self.points.len();
        if n < 2 {
            return 0.0;
        }
        (0..n)
            .map(|i| (self.points[(i + 1) % n] - self.points[i]).norm())
            .sum()
    }

    /// Bounding box of the vertices.
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(&self.points)
    }

    /// Point-in-polygon test, ignoring winding.
    pub fn contains_point(&self, p: &Point2) -> bool {
        point_in_polygon(p, self)
    }

    /// Shift every vertex by `v`.
    pub fn translate(&mut self, v: &Vec2) {
        for p in &mut self.points {
            *p += *v;
        }
    }

    /// Rotate about the origin by `angle` radians.
    pub fn rotate(&mut self, angle: f64) {
        let (s, c) = angle.sin_cos();
        for p in &mut self.points {
            *p = Point2::new(c * p.x - s * p.y, s * p.x + c * p.y);
        }
    }

    /// Open the loop at its first vertex, repeating it at the end.
    pub fn to_polyline(&self) -> Polyline {
        let mut points = self.points.clone();
        if let Some(first) = self.points.first() {
            points.push(*first);
        }
        Polyline::new(points)
    }

    /// Drop vertices closer than `tolerance` to the simplified outline.
    ///
    /// Returns `None` when fewer than three vertices survive.
    pub fn simplify(&self, tolerance: f64) -> Option<Self> {
        let simplified = self.to_polyline().simplify(tolerance);
        let mut points = simplified.points;
        points.pop();
        (points.len() >= 3).then(|| Polygon::new(points))
    }

    /// Offset the polygon inward (shrink) or outward (expand) by distance.
    /// Positive distance = inward (for outer contours).
    pub fn offset(&self, distance: f64) -> Option<Self> {
        let mut points = self.points.clone();
        points.dedup_by(|a, b| (*a - *b).norm() < 1e-9);
        if points.len() > 1 && (points[0] - points[points.len() - 1]).norm() < 1e-9 {
            points.pop();
        }
        if points.len() < 3 {
            return None;
        }

        let n = points.len();
        let sign = if self.is_ccw() { 1.0 } else { -1.0 };
        let mut offset_points = Vec::with_capacity(n);

        for i in 0..n {
            let p0 = points[(i + n - 1) % n];
            let p1 = points[i];
            let p2 = points[(i + 1) % n];

            let e1 = (p1 - p0).normalize();
            let e2 = (p2 - p1).normalize();

            // Inward normals
            let n1 = Vec2::new(-e1.y * sign, e1.x * sign);
            let n2 = Vec2::new(-e2.y * sign, e2.x * sign);

            let bisector = n1 + n2;
            if bisector.norm() < 1e-12 {
                // Spike: the two edges fold back onto each other.
                continue;
            }
            let bisector = bisector.normalize();

            // Offset distance along bisector (adjusted for corner angle)
            let dot = n1.dot(&bisector);
            let offset_dist = if dot.abs() > 0.001 {
                distance / dot
            } else {
                distance
            };

            // Limit offset to avoid self-intersection at sharp corners
            let max_offset = distance.abs() * 2.0;
            let clamped_offset = offset_dist.clamp(-max_offset, max_offset);

            offset_points.push(p1 + bisector * clamped_offset);
        }

        let result = Polygon::new(offset_points);
        // Collapsed or flipped inside out.
        if result.signed_area().abs() < 1e-10 || result.is_ccw() != self.is_ccw() {
            return None;
        }
        if distance > 0.0 && result.area() >= self.area() {
            return None;
        }

        Some(result)
    }
}

/// An open polyline (non-closed path).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Polyline {
    /// Points along the path.
    pub points: Vec<Point2>,
}

impl Polyline {
    /// Create a new polyline.
    pub fn new(points: Vec<Point2>) -> Self {
        Self { points }
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Total length of the polyline.
    pub fn length(&self) -> f64 {
        if self.points.len() < 2 {
            return 0.0;
        }
        self.points
            .windows(2)
            .map(|w| (w[1] - w[0]).norm())
            .sum()
    }

    /// Starting point.
    pub fn start(&self) -> Option<&Point2> {
        self.points.first()
    }

    /// Ending point.
    pub fn end(&self) -> Option<&Point2> {
        self.points.last()
    }

    /// Shift every point by `v`.
    pub fn translate(&mut self, v: &Vec2) {
        for p in &mut self.points {
            *p += *v;
        }
    }

    /// Ramer-Douglas-Peucker simplification; endpoints are always kept.
    pub fn simplify(&self, tolerance: f64) -> Self {
        if self.points.len() < 3 || tolerance <= 0.0 {
            return self.clone();
        }
        let mut keep = vec![false; self.points.len()];
        keep[0] = true;
        keep[self.points.len() - 1] = true;

        let mut stack = vec![(0usize, self.points.len() - 1)];
        while let Some((first, last)) = stack.pop() {
            if last <= first + 1 {
                continue;
            }
            let (mut max_dist, mut max_idx) = (0.0, first);
            for i in first + 1..last {
                let d = segment_distance(&self.points[i], &self.points[first], &self.points[last]);
                if d > max_dist {
                    max_dist = d;
                    max_idx = i;
                }
            }
            if max_dist > tolerance {
                keep[max_idx] = true;
                stack.push((first, max_idx));
                stack.push((max_idx, last));
            }
        }

        Self::new(
            self.points
                .iter()
                .zip(keep)
                .filter_map(|(p, k)| k.then_some(*p))
                .collect(),
        )
    }
}

fn segment_distance(p: &Point2, a: &Point2, b: &Point2) -> f64 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 < 1e-18 {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

/// A polygon with holes: a counter-clockwise contour and clockwise holes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExPolygon {
    /// Outer boundary (CCW).
    pub contour: Polygon,
    /// Holes (CW).
    pub holes: Vec<Polygon>,
}

/// A set of disjoint polygons with holes.
pub type ExPolygons = Vec<ExPolygon>;

impl ExPolygon {
    /// Polygon without holes; the contour is normalized to CCW.
    pub fn new(mut contour: Polygon) -> Self {
        contour.ensure_ccw();
        Self {
            contour,
            holes: Vec::new(),
        }
    }

    /// Polygon with holes; windings are normalized.
    pub fn with_holes(mut contour: Polygon, holes: Vec<Polygon>) -> Self {
        contour.ensure_ccw();
        let holes = holes
            .into_iter()
            .map(|mut h| {
                h.ensure_cw();
                h
            })
            .collect();
        Self { contour, holes }
    }

    /// Contour area minus hole areas.
    pub fn area(&self) -> f64 {
        self.contour.area() - self.holes.iter().map(Polygon::area).sum::<f64>()
    }

    /// Inside the contour and outside every hole.
    pub fn contains_point(&self, p: &Point2) -> bool {
        self.contour.contains_point(p) && !self.holes.iter().any(|h| h.contains_point(p))
    }

    /// Bounding box of the contour.
    pub fn bounding_box(&self) -> BoundingBox {
        self.contour.bounding_box()
    }

    /// Shift contour and holes by `v`.
    pub fn translate(&mut self, v: &Vec2) {
        self.contour.translate(v);
        for h in &mut self.holes {
            h.translate(v);
        }
    }

    /// Rotate about the origin by `angle` radians.
    pub fn rotate(&mut self, angle: f64) {
        self.contour.rotate(angle);
        for h in &mut self.holes {
            h.rotate(angle);
        }
    }

    /// Contour followed by holes, as plain polygons.
    pub fn to_polygons(&self) -> Vec<Polygon> {
        std::iter::once(self.contour.clone())
            .chain(self.holes.iter().cloned())
            .collect()
    }

    /// Number of vertices over contour and holes.
    pub fn num_points(&self) -> usize {
        self.contour.len() + self.holes.iter().map(Polygon::len).sum::<usize>()
    }
}

/// Check if a point is inside a polygon (2D, even-odd rule).
pub fn point_in_polygon(point: &Point2, polygon: &Polygon) -> bool {
    let n = polygon.points.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;

    for i in 0..n {
        let pi = &polygon.points[i];
        let pj = &polygon.points[j];

        if ((pi.y > point.y) != (pj.y > point.y))
            && (point.x < (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x)
        {
            inside = !inside;
        }
        j = i;
    }

    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square(size: f64) -> Polygon {
        Polygon::rectangle(Point2::origin(), Point2::new(size, size))
    }

    #[test]
    fn test_polygon_area() {
        let sq = square(1.0);
        assert_relative_eq!(sq.signed_area(), 1.0);
        assert!(sq.is_ccw());
    }

    #[test]
    fn test_polygon_offset() {
        let offset = square(10.0).offset(1.0).unwrap();
        // 8x8 after 1mm inward offset
        assert!((offset.area() - 64.0).abs() < 1.0);
    }

    #[test]
    fn test_offset_collapses_small_polygon() {
        assert!(square(1.0).offset(2.0).is_none());
    }

    #[test]
    fn test_expolygon_contains_point_respects_holes() {
        let hole = Polygon::rectangle(Point2::new(4.0, 4.0), Point2::new(6.0, 6.0));
        let ex = ExPolygon::with_holes(square(10.0), vec![hole]);
        assert!(ex.contains_point(&Point2::new(1.0, 1.0)));
        assert!(!ex.contains_point(&Point2::new(5.0, 5.0)));
        assert_relative_eq!(ex.area(), 96.0);
        assert!(!ex.holes[0].is_ccw());
    }

    #[test]
    fn test_polyline_simplify_drops_collinear_points() {
        let line = Polyline::new(vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.001),
            Point2::new(2.0, 0.0),
            Point2::new(2.0, 5.0),
        ]);
        let simplified = line.simplify(0.01);
        assert_eq!(simplified.len(), 3);
        assert_relative_eq!(simplified.length(), 7.0);
    }

    #[test]
    fn test_rotate_quarter_turn() {
        let mut sq = square(2.0);
        sq.rotate(std::f64::consts::FRAC_PI_2);
        let bb = sq.bounding_box();
        assert_relative_eq!(bb.min.x, -2.0, epsilon = 1e-12);
        assert_relative_eq!(bb.max.y, 2.0, epsilon = 1e-12);
    }
}
