//! Infill pattern generation.

use slicekit_config::InfillPattern;
use slicekit_math::{BoundingBox, ExPolygon, Point2, Polyline};

/// How to fill one area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillParams {
    /// Line pattern.
    pub pattern: InfillPattern,
    /// Density in `(0, 1]`; 1 is solid.
    pub density: f64,
    /// Extrusion width (mm).
    pub line_width: f64,
    /// Base direction (degrees).
    pub angle: f64,
    /// Layer index, for patterns that alternate direction.
    pub layer_id: usize,
}

impl FillParams {
    /// Solid fill alternating 90° per layer.
    pub fn solid(line_width: f64, angle: f64, layer_id: usize) -> Self {
        Self {
            pattern: InfillPattern::Grid,
            density: 1.0,
            line_width,
            angle,
            layer_id,
        }
    }
}

/// Fill `area` with open polylines.
pub fn fill_expolygons(area: &[ExPolygon], params: &FillParams) -> Vec<Polyline> {
    if area.is_empty() || params.density <= 0.0 || params.line_width <= 0.0 {
        return Vec::new();
    }
    let density = params.density.min(1.0);
    let mut spacing = params.line_width / density;
    let layer = params.layer_id;

    let pattern_angle: f64 = match params.pattern {
        InfillPattern::Grid => {
            if layer % 2 == 0 {
                0.0
            } else {
                90.0
            }
        }
        InfillPattern::Line => {
            if layer % 2 == 0 {
                45.0
            } else {
                -45.0
            }
        }
        InfillPattern::Triangles => match layer % 3 {
            0 => 0.0,
            1 => 60.0,
            _ => -60.0,
        },
        InfillPattern::Honeycomb => {
            spacing *= 1.5;
            if layer % 2 == 0 {
                30.0
            } else {
                -30.0
            }
        }
        InfillPattern::Gyroid => {
            // Lines drifting in phase layer to layer.
            let phase = (layer as f64 * 0.5).sin() * std::f64::consts::PI;
            45.0 + phase.to_degrees() * 0.1
        }
    };

    let mut paths = parallel_lines(area, spacing, (params.angle + pattern_angle).to_radians());
    order_by_nearest(&mut paths);
    paths
}

/// Clip parallel scan lines `spacing` apart to `area`.
fn parallel_lines(area: &[ExPolygon], spacing: f64, angle: f64) -> Vec<Polyline> {
    let mut bb = BoundingBox::empty();
    for e in area {
        bb.merge(&e.bounding_box());
    }
    if !bb.is_valid() {
        return Vec::new();
    }

    let dir = Point2::new(angle.cos(), angle.sin());
    let perp = Point2::new(-angle.sin(), angle.cos());

    let corners = [
        Point2::new(bb.min.x, bb.min.y),
        Point2::new(bb.max.x, bb.min.y),
        Point2::new(bb.max.x, bb.max.y),
        Point2::new(bb.min.x, bb.max.y),
    ];
    let (perp_min, perp_max) = corners.iter().fold((f64::MAX, f64::MIN), |(lo, hi), c| {
        let proj = c.x * perp.x + c.y * perp.y;
        (lo.min(proj), hi.max(proj))
    });

    let rings: Vec<&[Point2]> = area
        .iter()
        .flat_map(|e| std::iter::once(&e.contour).chain(e.holes.iter()))
        .map(|p| p.points.as_slice())
        .collect();

    let mut paths = Vec::new();
    let mut offset = perp_min + spacing / 2.0;
    while offset < perp_max {
        let origin = Point2::new(offset * perp.x, offset * perp.y);
        let mut hits = line_intersections(&origin, &dir, &rings);
        hits.sort_by(|a, b| a.total_cmp(b));
        hits.dedup_by(|a, b| (*a - *b).abs() < 1e-9);

        for pair in hits.windows(2) {
            let p0 = Point2::new(origin.x + pair[0] * dir.x, origin.y + pair[0] * dir.y);
            let p1 = Point2::new(origin.x + pair[1] * dir.x, origin.y + pair[1] * dir.y);
            let mid = Point2::new((p0.x + p1.x) / 2.0, (p0.y + p1.y) / 2.0);
            if (p1 - p0).norm() > 1e-6 && area.iter().any(|e| e.contains_point(&mid)) {
                paths.push(Polyline::new(vec![p0, p1]));
            }
        }
        offset += spacing;
    }
    paths
}

/// Parameters `t` where `origin + t * dir` crosses a ring edge.
fn line_intersections(origin: &Point2, dir: &Point2, rings: &[&[Point2]]) -> Vec<f64> {
    let eps = 1e-10;
    let mut out = Vec::new();
    for ring in rings {
        let n = ring.len();
        for i in 0..n {
            let a = ring[i];
            let b = ring[(i + 1) % n];
            let seg = b - a;
            let cross = dir.x * seg.y - dir.y * seg.x;
            if cross.abs() < eps {
                continue;
            }
            let diff = a - origin;
            let t = (diff.x * seg.y - diff.y * seg.x) / cross;
            let s = (diff.x * dir.y - diff.y * dir.x) / cross;
            if (-eps..1.0 + eps).contains(&s) {
                out.push(t);
            }
        }
    }
    out
}

/// Greedy nearest-start ordering, reversing lines when their end is closer.
fn order_by_nearest(paths: &mut Vec<Polyline>) {
    if paths.len() < 2 {
        return;
    }
    let mut remaining = std::mem::take(paths);
    let mut pos = Point2::origin();
    while !remaining.is_empty() {
        let mut best = 0;
        let mut best_dist = f64::MAX;
        let mut best_reversed = false;
        for (i, p) in remaining.iter().enumerate() {
            if let (Some(s), Some(e)) = (p.start(), p.end()) {
                let ds = (s - pos).norm();
                let de = (e - pos).norm();
                if ds < best_dist {
                    best = i;
                    best_dist = ds;
                    best_reversed = false;
                }
                if de < best_dist {
                    best = i;
                    best_dist = de;
                    best_reversed = true;
                }
            }
        }
        let mut next = remaining.swap_remove(best);
        if best_reversed {
            next.points.reverse();
        }
        if let Some(end) = next.end() {
            pos = *end;
        }
        paths.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use slicekit_math::Polygon;

    fn square(x0: f64, x1: f64) -> Polygon {
        Polygon::rectangle(Point2::new(x0, x0), Point2::new(x1, x1))
    }

    #[test]
    fn test_solid_fill_covers_square() {
        let area = [ExPolygon::new(square(0.0, 10.0))];
        let paths = fill_expolygons(&area, &FillParams::solid(0.5, 0.0, 0));
        // 20 horizontal lines, each 10 mm.
        assert_eq!(paths.len(), 20);
        let total: f64 = paths.iter().map(Polyline::length).sum();
        assert_relative_eq!(total, 200.0, epsilon = 1e-6);
    }

    #[test]
    fn test_sparse_fill_skips_hole() {
        let area = [ExPolygon::with_holes(square(0.0, 20.0), vec![square(5.0, 15.0)])];
        let params = FillParams {
            pattern: InfillPattern::Grid,
            density: 0.2,
            line_width: 0.4,
            angle: 0.0,
            layer_id: 0,
        };
        let paths = fill_expolygons(&area, &params);
        assert!(!paths.is_empty());
        for p in &paths {
            let a = p.start().unwrap();
            let b = p.end().unwrap();
            let mid = Point2::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0);
            assert!(area[0].contains_point(&mid));
        }
    }

    #[test]
    fn test_zero_density_is_empty() {
        let area = [ExPolygon::new(square(0.0, 10.0))];
        let mut params = FillParams::solid(0.5, 0.0, 0);
        params.density = 0.0;
        assert!(fill_expolygons(&area, &params).is_empty());
    }

    #[test]
    fn test_odd_layers_rotate_grid() {
        let area = [ExPolygon::new(square(0.0, 10.0))];
        let paths = fill_expolygons(&area, &FillParams::solid(0.5, 0.0, 1));
        let p = &paths[0];
        let (a, b) = (p.start().unwrap(), p.end().unwrap());
        assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
    }
}
