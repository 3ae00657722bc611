//! Wall generation from region slices.

use slicekit_config::{DynamicConfig, FuzzySkinType};
use slicekit_math::{offset_ex, ExPolygons, Point2, Polygon, Vec2};

use crate::error::Result;
use crate::layer::{ExtrusionPath, ExtrusionRole};

/// Wall settings of one region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerimeterSettings {
    /// Number of walls.
    pub wall_loops: usize,
    /// Extrusion width (mm).
    pub line_width: f64,
    /// Which walls get fuzzy skin.
    pub fuzzy_skin: FuzzySkinType,
    /// Peak-to-peak fuzzy displacement (mm).
    pub fuzzy_thickness: f64,
    /// Spacing of fuzzy points along the wall (mm).
    pub fuzzy_point_distance: f64,
}

impl PerimeterSettings {
    /// Read the wall options of a region config.
    pub fn from_region(config: &DynamicConfig) -> Result<Self> {
        Ok(Self {
            wall_loops: config.opt_int("wall_loops")?.max(0) as usize,
            line_width: config.opt_float("line_width")?,
            fuzzy_skin: config.opt_enum("fuzzy_skin")?,
            fuzzy_thickness: config.opt_float("fuzzy_skin_thickness")?,
            fuzzy_point_distance: config.opt_float("fuzzy_skin_point_distance")?,
        })
    }
}

/// Walls of one region on one layer.
#[derive(Debug, Clone, Default)]
pub struct LayerPerimeters {
    /// Closed loops, outermost first.
    pub loops: Vec<ExtrusionPath>,
    /// Area left inside the innermost wall.
    pub fill_area: ExPolygons,
}

/// Generate walls for `slices`.
///
/// The first loop runs half a line width inside the slice outline, every
/// further loop one line width further in. The fill area starts half a line
/// width inside the innermost loop.
pub fn generate_perimeters(
    slices: &ExPolygons,
    settings: &PerimeterSettings,
    layer_height: f64,
    layer_id: usize,
) -> LayerPerimeters {
    let mut result = LayerPerimeters::default();
    let width = settings.line_width;

    if settings.wall_loops == 0 || width <= 0.0 {
        result.fill_area = slices.clone();
        return result;
    }

    let mut current = offset_ex(slices, -width / 2.0);
    for loop_idx in 0..settings.wall_loops {
        if loop_idx > 0 {
            current = offset_ex(&current, -width);
        }
        if current.is_empty() {
            break;
        }
        let role = if loop_idx == 0 {
            ExtrusionRole::ExternalPerimeter
        } else {
            ExtrusionRole::Perimeter
        };
        let fuzzy = match settings.fuzzy_skin {
            FuzzySkinType::External => loop_idx == 0,
            FuzzySkinType::All => true,
            FuzzySkinType::Disabled | FuzzySkinType::Painted => false,
        };
        for expoly in &current {
            for (ring_idx, ring) in expoly.to_polygons().iter().enumerate() {
                let ring = if fuzzy {
                    fuzzy_polygon(ring, settings, layer_id, ring_idx)
                } else {
                    ring.clone()
                };
                result
                    .loops
                    .push(ExtrusionPath::new(role, ring.to_polyline(), width, layer_height));
            }
        }
    }

    if !current.is_empty() {
        result.fill_area = offset_ex(&current, -width / 2.0);
    }
    result
}

/// Resample `ring` at the fuzzy point distance and push every point along
/// the outline normal by a deterministic amount within the thickness.
fn fuzzy_polygon(ring: &Polygon, settings: &PerimeterSettings, layer_id: usize, ring_idx: usize) -> Polygon {
    let step = settings.fuzzy_point_distance.max(0.1);
    let half = settings.fuzzy_thickness / 2.0;
    let sign = if ring.is_ccw() { 1.0 } else { -1.0 };
    let n = ring.points.len();
    let mut seed = ((layer_id as u64) << 32) ^ ring_idx as u64;

    let mut out = Vec::new();
    for i in 0..n {
        let a = ring.points[i];
        let b = ring.points[(i + 1) % n];
        let edge = b - a;
        let len = edge.norm();
        if len < 1e-9 {
            continue;
        }
        let dir = edge / len;
        // Outward normal.
        let normal = Vec2::new(dir.y, -dir.x) * sign;
        let segments = (len / step).ceil().max(1.0) as usize;
        for s in 0..segments {
            let t = s as f64 / segments as f64;
            let base: Point2 = a + edge * t;
            let offset = (unit_noise(&mut seed) * 2.0 - 1.0) * half;
            out.push(base + normal * offset);
        }
    }
    if out.len() < 3 {
        return ring.clone();
    }
    Polygon::new(out)
}

/// SplitMix64 mapped to `[0, 1)`.
fn unit_noise(state: &mut u64) -> f64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use slicekit_math::{area_ex, ExPolygon};

    fn square(size: f64) -> ExPolygons {
        vec![ExPolygon::new(Polygon::rectangle(
            Point2::new(0.0, 0.0),
            Point2::new(size, size),
        ))]
    }

    fn settings(wall_loops: usize) -> PerimeterSettings {
        PerimeterSettings {
            wall_loops,
            line_width: 0.5,
            fuzzy_skin: FuzzySkinType::Disabled,
            fuzzy_thickness: 0.3,
            fuzzy_point_distance: 0.8,
        }
    }

    #[test]
    fn test_two_walls_on_square() {
        let result = generate_perimeters(&square(10.0), &settings(2), 0.2, 0);
        assert_eq!(result.loops.len(), 2);
        assert_eq!(result.loops[0].role, ExtrusionRole::ExternalPerimeter);
        assert_eq!(result.loops[1].role, ExtrusionRole::Perimeter);
        // Outer loop at 0.25 inset: 9.5 mm square.
        assert_relative_eq!(result.loops[0].length(), 38.0, epsilon = 1e-3);
        // Fill starts one full wall band in: 10 - 2 * 1.0 = 8.
        assert_relative_eq!(area_ex(&result.fill_area), 64.0, epsilon = 1e-2);
    }

    #[test]
    fn test_no_walls_fills_everything() {
        let result = generate_perimeters(&square(10.0), &settings(0), 0.2, 0);
        assert!(result.loops.is_empty());
        assert_relative_eq!(area_ex(&result.fill_area), 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_tiny_island_gets_no_fill() {
        let result = generate_perimeters(&square(1.0), &settings(3), 0.2, 0);
        assert!(result.fill_area.is_empty());
    }

    #[test]
    fn test_fuzzy_skin_adds_points_to_outer_wall() {
        let mut s = settings(2);
        s.fuzzy_skin = FuzzySkinType::External;
        let result = generate_perimeters(&square(10.0), &s, 0.2, 3);
        assert!(result.loops[0].polyline.len() > 10);
        assert!(result.loops[1].polyline.len() < result.loops[0].polyline.len());
    }

    #[test]
    fn test_noise_is_deterministic_and_bounded() {
        let mut a = 7;
        let mut b = 7;
        for _ in 0..100 {
            let x = unit_noise(&mut a);
            assert_eq!(x, unit_noise(&mut b));
            assert!((0.0..1.0).contains(&x));
        }
    }
}
