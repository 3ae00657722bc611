//! Switches shared by every step of one `Print::process` run.

use slicekit_config::{DynamicConfig, PrintSequence};

use crate::error::Result;

/// Plate-wide settings the steps read, resolved once per process run.
///
/// Steps take this explicitly instead of reaching for the print config, so
/// a run never observes a setting changing underneath it.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Later model parts are clipped by earlier ones where they overlap.
    pub clip_multipart_objects: bool,
    /// Paths are simplified to this tolerance (mm).
    pub resolution: f64,
    /// Objects are printed as a single spiral wall.
    pub spiral_mode: bool,
    /// Layer-by-layer or object-by-object.
    pub print_sequence: PrintSequence,
    /// Lift height per physical extruder (mm).
    pub z_hop: Vec<f64>,
    /// Configured filaments.
    pub filament_count: usize,
    /// Physical extruders.
    pub extruder_count: usize,
    /// Print a wipe tower when more than one filament is used.
    pub enable_prime_tower: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            clip_multipart_objects: true,
            resolution: 0.012,
            spiral_mode: false,
            print_sequence: PrintSequence::ByLayer,
            z_hop: vec![0.4],
            filament_count: 1,
            extruder_count: 1,
            enable_prime_tower: true,
        }
    }
}

impl PipelineConfig {
    /// Resolve from the full print config.
    pub fn from_config(config: &DynamicConfig) -> Result<Self> {
        let mut print_sequence: PrintSequence = config.opt_enum("print_sequence")?;
        if print_sequence == PrintSequence::ByDefault {
            print_sequence = PrintSequence::ByLayer;
        }
        Ok(Self {
            clip_multipart_objects: config.opt_bool("clip_multipart_objects")?,
            resolution: config.opt_float("resolution")?.max(0.0),
            spiral_mode: config.opt_bool("spiral_mode")?,
            print_sequence,
            z_hop: config.opt_floats("z_hop")?,
            filament_count: config.filament_count(),
            extruder_count: config.extruder_count(),
            enable_prime_tower: config.opt_bool("enable_prime_tower")?,
        })
    }

    /// True when any extruder lifts on travel.
    pub fn lift_enabled(&self) -> bool {
        self.z_hop.iter().any(|&h| h > 0.0)
    }

    /// True when objects are printed one after another.
    pub fn sequential(&self) -> bool {
        self.print_sequence == PrintSequence::ByObject
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_defaults() {
        let cfg = PipelineConfig::from_config(&DynamicConfig::defaults()).unwrap();
        assert!(cfg.clip_multipart_objects);
        assert!(cfg.lift_enabled());
        assert!(!cfg.sequential());
        assert_eq!(cfg.extruder_count, 1);
    }

    #[test]
    fn test_by_default_sequence_resolves_to_by_layer() {
        let mut config = DynamicConfig::defaults();
        config.set("print_sequence", "by_default");
        config.set("z_hop", vec![0.0]);
        let cfg = PipelineConfig::from_config(&config).unwrap();
        assert_eq!(cfg.print_sequence, PrintSequence::ByLayer);
        assert!(!cfg.lift_enabled());
    }
}
