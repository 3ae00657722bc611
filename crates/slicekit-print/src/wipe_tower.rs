//! Purge tower planning.
//!
//! The tower itself is drawn by the G-code backend; this module plans where
//! it stands, how deep it must be to absorb every purge and how much
//! filament the purges cost.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use slicekit_config::DynamicConfig;
use slicekit_math::{BoundingBox, Point2};

use crate::error::Result;
use crate::pipeline::PipelineConfig;
use crate::tool_ordering::ToolOrdering;

/// Smallest tower footprint depth once anything is purged (mm).
const MIN_DEPTH: f64 = 5.0;

/// One filament change on the tower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChange {
    /// Layer the change happens on.
    pub print_z: f64,
    /// 1-based filament unloaded.
    pub old_tool: u32,
    /// 1-based filament loaded.
    pub new_tool: u32,
    /// Volume purged into the tower (mm³).
    pub purge_volume: f64,
}

/// Plan of the purge tower of a print.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WipeTowerData {
    /// Every filament change, bottom first.
    pub tool_changes: Vec<ToolChange>,
    /// Filament length purged per 1-based filament (mm).
    pub used_filament: BTreeMap<u32, f64>,
    /// Number of filament changes.
    pub number_of_toolchanges: usize,
    /// Footprint depth (mm).
    pub depth: f64,
    /// Brim around the footprint (mm).
    pub brim_width: f64,
    /// Footprint on the plate, brim excluded.
    pub bbx: BoundingBox,
    /// Top of the tower.
    pub height: f64,
}

/// True when the print needs a purge tower for `used_filaments` filaments.
pub fn has_wipe_tower(pipeline: &PipelineConfig, used_filaments: usize) -> bool {
    pipeline.enable_prime_tower && used_filaments > 1 && !pipeline.sequential() && !pipeline.spiral_mode
}

impl WipeTowerData {
    /// Plan the tower for `ordering` on plate `plate_index`.
    pub fn plan(ordering: &ToolOrdering, config: &DynamicConfig, plate_index: usize) -> Result<Self> {
        let width = config.opt_float("prime_tower_width")?;
        let prime_volume = config.opt_float("prime_volume")?;
        let x = config.opt_float_at("wipe_tower_x", plate_index)?;
        let y = config.opt_float_at("wipe_tower_y", plate_index)?;

        let mut data = WipeTowerData {
            brim_width: config.opt_float("prime_tower_brim_width")?.max(0.0),
            ..Default::default()
        };
        let mut prev_z = 0.0;
        let mut current: Option<u32> = None;
        for lt in ordering.layer_tools() {
            let layer_height = (lt.print_z - prev_z).max(1e-3);
            prev_z = lt.print_z;
            let mut changes_here = 0;
            for &tool in &lt.extruders {
                if let Some(old) = current.filter(|&c| c != tool) {
                    data.tool_changes.push(ToolChange {
                        print_z: lt.print_z,
                        old_tool: old,
                        new_tool: tool,
                        purge_volume: prime_volume,
                    });
                    let diameter = config.opt_float_at("filament_diameter", tool as usize - 1)?;
                    let area = PI * (diameter / 2.0).powi(2);
                    *data.used_filament.entry(tool).or_default() += prime_volume / area;
                    changes_here += 1;
                }
                current = Some(tool);
            }
            if changes_here > 0 && width > 0.0 {
                let depth = changes_here as f64 * prime_volume / (width * layer_height);
                data.depth = data.depth.max(depth);
                data.height = lt.print_z;
            }
        }
        data.number_of_toolchanges = data.tool_changes.len();
        if data.number_of_toolchanges > 0 {
            data.depth = data.depth.max(MIN_DEPTH);
            data.bbx = BoundingBox::new(Point2::new(x, y), Point2::new(x + width, y + data.depth));
        } else {
            data.bbx = BoundingBox::empty();
        }
        Ok(data)
    }

    /// True when nothing is purged.
    pub fn is_empty(&self) -> bool {
        self.tool_changes.is_empty()
    }

    /// Footprint including the brim.
    pub fn bbx_with_brim(&self) -> BoundingBox {
        let mut bb = self.bbx;
        if bb.is_valid() {
            bb.expand(self.brim_width);
        }
        bb
    }

    /// Total purged volume (mm³).
    pub fn purged_volume(&self) -> f64 {
        self.tool_changes.iter().map(|c| c.purge_volume).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_filament_config() -> DynamicConfig {
        let mut config = DynamicConfig::defaults();
        config.set("filament_type", vec!["PLA", "PLA"]);
        config.set("filament_diameter", vec![1.75, 1.75]);
        config
    }

    #[test]
    fn test_tower_switch() {
        let mut pipeline = PipelineConfig::default();
        assert!(!has_wipe_tower(&pipeline, 1));
        assert!(has_wipe_tower(&pipeline, 2));
        pipeline.print_sequence = slicekit_config::PrintSequence::ByObject;
        assert!(!has_wipe_tower(&pipeline, 2));
    }

    #[test]
    fn test_empty_ordering_plans_nothing() {
        let data = WipeTowerData::plan(&ToolOrdering::default(), &two_filament_config(), 0).unwrap();
        assert!(data.is_empty());
        assert!(!data.bbx.is_valid());
        assert_relative_eq!(data.depth, 0.0);
    }

    #[test]
    fn test_brim_box_grows() {
        let data = WipeTowerData {
            bbx: BoundingBox::new(Point2::new(10.0, 10.0), Point2::new(45.0, 20.0)),
            brim_width: 3.0,
            ..Default::default()
        };
        let bb = data.bbx_with_brim();
        assert_relative_eq!(bb.min.x, 7.0);
        assert_relative_eq!(bb.max.y, 23.0);
    }
}
