//! Support and raft generation from layer slices.
//!
//! Overhangs are found by comparing each layer with the one below: whatever
//! reaches further out than the layer height allows at the threshold angle
//! needs support. Support columns are then dropped down to the plate or to
//! the object below.

use slicekit_config::{DynamicConfig, InfillPattern, SupportType};
use slicekit_math::{diff_ex, intersection_ex, offset_ex, union_ex, ExPolygons};

use crate::error::Result;
use crate::infill::{fill_expolygons, FillParams};
use crate::layer::{ExtrusionPath, ExtrusionRole, Layer, SupportLayer};
use crate::slicing::SlicingParameters;

/// Raft area reaches this far beyond the first layer (mm).
const RAFT_EXPANSION: f64 = 1.5;

/// Support settings of one object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupportSettings {
    /// Support generation switched on.
    pub enabled: bool,
    /// Placement style.
    pub support_type: SupportType,
    /// Overhangs flatter than this many degrees from horizontal get support.
    pub threshold_angle: f64,
    /// Only support areas with nothing but the plate below.
    pub on_build_plate_only: bool,
    /// Spacing of support lines (mm).
    pub spacing: f64,
    /// Extrusion width (mm).
    pub line_width: f64,
    /// Horizontal gap between support and object (mm).
    pub xy_distance: f64,
}

impl SupportSettings {
    /// Read the support options of an object config.
    pub fn from_config(config: &DynamicConfig) -> Result<Self> {
        let line_width = config.opt_float("line_width")?;
        Ok(Self {
            enabled: config.opt_bool("enable_support")?,
            support_type: config.opt_enum("support_type")?,
            threshold_angle: config.opt_float("support_threshold_angle")?,
            on_build_plate_only: config.opt_bool("support_on_build_plate_only")?,
            spacing: config.opt_float("support_base_pattern_spacing")?.max(line_width),
            line_width,
            xy_distance: line_width,
        })
    }

    /// Support placed automatically under overhangs.
    pub fn auto(&self) -> bool {
        self.enabled && self.support_type.is_auto()
    }
}

/// Per-layer support modifiers, indexed like the object layers.
#[derive(Debug, Clone, Default)]
pub struct SupportModifiers {
    /// Areas that must be supported.
    pub enforcers: Vec<ExPolygons>,
    /// Areas that must not be supported.
    pub blockers: Vec<ExPolygons>,
}

/// Overhanging area of every layer.
pub fn detect_overhangs(
    layers: &[Layer],
    settings: &SupportSettings,
    modifiers: &SupportModifiers,
) -> Vec<ExPolygons> {
    let mut out = vec![ExPolygons::new(); layers.len()];
    for i in 1..layers.len() {
        let below = &layers[i - 1].lslices;
        let layer = &layers[i];
        let mut overhang = ExPolygons::new();
        if settings.auto() {
            let angle = settings.threshold_angle.clamp(1.0, 89.0).to_radians();
            let allowance = layer.height / angle.tan();
            overhang = diff_ex(&layer.lslices, &offset_ex(below, allowance));
        }
        if settings.enabled {
            if let Some(enforcer) = modifiers.enforcers.get(i).filter(|e| !e.is_empty()) {
                let unsupported = diff_ex(&layer.lslices, below);
                let enforced = intersection_ex(&unsupported, enforcer);
                if !enforced.is_empty() {
                    overhang.extend(enforced);
                    overhang = union_ex(&overhang);
                }
            }
        }
        if let Some(blocker) = modifiers.blockers.get(i).filter(|b| !b.is_empty()) {
            overhang = diff_ex(&overhang, blocker);
        }
        out[i] = overhang;
    }
    out
}

/// Support layers for an object, raft first.
pub fn generate_support_layers(
    layers: &[Layer],
    params: &SlicingParameters,
    settings: &SupportSettings,
    modifiers: &SupportModifiers,
) -> Vec<SupportLayer> {
    let mut support = Vec::new();

    if settings.enabled && !layers.is_empty() {
        let overhangs = detect_overhangs(layers, settings, modifiers);
        let gap_layers = if params.soluble_interface || params.layer_height <= 0.0 {
            0
        } else {
            (params.gap_support_object / params.layer_height).round() as usize
        };

        let mut islands = vec![ExPolygons::new(); layers.len()];
        let mut interface = vec![false; layers.len()];
        let mut carry = ExPolygons::new();
        for j in (0..layers.len()).rev() {
            if let Some(new) = overhangs.get(j + 1 + gap_layers).filter(|o| !o.is_empty()) {
                carry.extend(new.iter().cloned());
                carry = union_ex(&carry);
                interface[j] = true;
            }
            if carry.is_empty() {
                continue;
            }
            let keep_out = offset_ex(&layers[j].lslices, settings.xy_distance);
            islands[j] = diff_ex(&carry, &keep_out);
            // Columns stop on the object; below it only what cleared it remains.
            carry = islands[j].clone();
        }

        if settings.on_build_plate_only {
            let mut shadow = ExPolygons::new();
            for j in 0..layers.len() {
                if !shadow.is_empty() {
                    islands[j] = diff_ex(&islands[j], &shadow);
                }
                shadow.extend(layers[j].lslices.iter().cloned());
                shadow = union_ex(&shadow);
            }
        }

        for (j, layer) in layers.iter().enumerate() {
            if islands[j].is_empty() {
                continue;
            }
            let role = if interface[j] {
                ExtrusionRole::SupportMaterialInterface
            } else {
                ExtrusionRole::SupportMaterial
            };
            let mut sl = SupportLayer::new(0, layer.print_z, layer.height, false);
            sl.support_fills.extend(
                fill_expolygons(&islands[j], &support_fill(settings, j, role))
                    .into_iter()
                    .map(|p| ExtrusionPath::new(role, p, settings.line_width, layer.height)),
            );
            sl.support_islands = std::mem::take(&mut islands[j]);
            support.push(sl);
        }
    }

    let mut out = generate_raft(layers, params, settings, support.first());
    out.extend(support);
    for (id, layer) in out.iter_mut().enumerate() {
        layer.id = id;
    }
    out
}

fn support_fill(settings: &SupportSettings, layer_id: usize, role: ExtrusionRole) -> FillParams {
    let density = if role == ExtrusionRole::SupportMaterialInterface {
        1.0
    } else {
        (settings.line_width / settings.spacing).min(1.0)
    };
    FillParams {
        pattern: InfillPattern::Grid,
        density,
        line_width: settings.line_width,
        angle: 0.0,
        layer_id,
    }
}

/// Raft layers below the first object layer.
fn generate_raft(
    layers: &[Layer],
    params: &SlicingParameters,
    settings: &SupportSettings,
    first_support: Option<&SupportLayer>,
) -> Vec<SupportLayer> {
    let count = params.raft_layers();
    if count == 0 {
        return Vec::new();
    }
    let mut footprint = layers.first().map(|l| l.lslices.clone()).unwrap_or_default();
    if let Some(s) = first_support {
        footprint.extend(s.support_islands.iter().cloned());
    }
    let area = offset_ex(&union_ex(&footprint), RAFT_EXPANSION);

    let mut out = Vec::with_capacity(count);
    let mut z = 0.0;
    for k in 0..count {
        let height = if k == 0 {
            params.first_print_layer_height
        } else if k < params.base_raft_layers {
            params.base_raft_layer_height
        } else if k + 1 < count {
            params.interface_raft_layer_height
        } else {
            params.contact_raft_layer_height
        };
        z += height;
        let role = if k < params.base_raft_layers {
            ExtrusionRole::SupportMaterial
        } else {
            ExtrusionRole::SupportMaterialInterface
        };
        let mut layer = SupportLayer::new(k, z, height, true);
        layer.support_fills.extend(
            fill_expolygons(&area, &support_fill(settings, k, role))
                .into_iter()
                .map(|p| ExtrusionPath::new(role, p, settings.line_width, height)),
        );
        layer.support_islands = area.clone();
        out.push(layer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use slicekit_math::{area_ex, ExPolygon, Point2, Polygon};
    use std::collections::BTreeSet;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> ExPolygons {
        vec![ExPolygon::new(Polygon::rectangle(Point2::new(x0, y0), Point2::new(x1, y1)))]
    }

    /// A 10 mm pillar for 10 layers with a 30 mm wide table on top.
    fn table() -> Vec<Layer> {
        (0..14)
            .map(|i| {
                let mut l = Layer::new(i, i as f64 * 0.2 + 0.1, (i + 1) as f64 * 0.2, 0.2);
                l.lslices = if i < 10 { rect(10.0, 10.0, 20.0, 20.0) } else { rect(0.0, 0.0, 30.0, 30.0) };
                l
            })
            .collect()
    }

    fn settings() -> SupportSettings {
        SupportSettings {
            enabled: true,
            support_type: SupportType::NormalAuto,
            threshold_angle: 30.0,
            on_build_plate_only: false,
            spacing: 2.5,
            line_width: 0.4,
            xy_distance: 0.4,
        }
    }

    fn params(raft: i64) -> SlicingParameters {
        let mut config = DynamicConfig::defaults();
        config.set("raft_layers", raft);
        SlicingParameters::from_config(&config, 2.8, &BTreeSet::from([1])).unwrap()
    }

    #[test]
    fn test_overhang_found_at_table_top() {
        let overhangs = detect_overhangs(&table(), &settings(), &SupportModifiers::default());
        assert!(overhangs[9].is_empty());
        assert!(area_ex(&overhangs[10]) > 700.0);
        assert!(overhangs[11].is_empty());
    }

    #[test]
    fn test_support_reaches_plate_around_pillar() {
        let support = generate_support_layers(&table(), &params(0), &settings(), &SupportModifiers::default());
        assert!(!support.is_empty());
        assert!(support.iter().all(|l| !l.is_raft));
        let bottom = &support[0];
        assert!((bottom.print_z - 0.2).abs() < 1e-9);
        // The pillar and its gap stay clear.
        let hole = diff_ex(&rect(11.0, 11.0, 19.0, 19.0), &bottom.support_islands);
        assert!((area_ex(&hole) - 64.0).abs() < 1e-3);
        assert!(!bottom.support_fills.is_empty());
    }

    #[test]
    fn test_blocker_removes_support() {
        let mut modifiers = SupportModifiers::default();
        modifiers.blockers = vec![rect(-5.0, -5.0, 35.0, 35.0); 14];
        let support = generate_support_layers(&table(), &params(0), &settings(), &modifiers);
        assert!(support.is_empty());
    }

    #[test]
    fn test_disabled_support_still_builds_raft() {
        let mut s = settings();
        s.enabled = false;
        let support = generate_support_layers(&table(), &params(3), &s, &SupportModifiers::default());
        assert_eq!(support.len(), 3);
        assert!(support.iter().all(|l| l.is_raft));
        assert!(support.windows(2).all(|w| w[1].print_z > w[0].print_z));
        assert_eq!(support[2].id, 2);
    }
}
