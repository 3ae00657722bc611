//! Printer profile definitions.

use serde::{Deserialize, Serialize};

use crate::enums::{NozzleType, NozzleVolumeType};
use crate::value::DynamicConfig;

/// Printer profile with the machine settings the plate model needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterProfile {
    /// Profile name.
    pub name: String,
    /// Build volume X (mm).
    pub bed_x: f64,
    /// Build volume Y (mm).
    pub bed_y: f64,
    /// Build volume Z (mm).
    pub bed_z: f64,
    /// Unprintable areas on the bed, each a polygon in bed coordinates (mm).
    pub exclude_areas: Vec<Vec<[f64; 2]>>,
    /// Nozzle diameter per extruder (mm).
    pub nozzle_diameter: Vec<f64>,
    /// Nozzle flow class per extruder.
    pub nozzle_volume_type: Vec<NozzleVolumeType>,
    /// Nozzle material per extruder.
    pub nozzle_type: Vec<NozzleType>,
    /// 1-based extruder that may print flexible filament.
    pub master_extruder_id: u32,
}

impl Default for PrinterProfile {
    fn default() -> Self {
        Self::generic()
    }
}

impl PrinterProfile {
    /// Generic single-extruder printer.
    pub fn generic() -> Self {
        Self {
            name: "Generic".into(),
            bed_x: 220.0,
            bed_y: 220.0,
            bed_z: 250.0,
            exclude_areas: Vec::new(),
            nozzle_diameter: vec![0.4],
            nozzle_volume_type: vec![NozzleVolumeType::Standard],
            nozzle_type: vec![NozzleType::Brass],
            master_extruder_id: 1,
        }
    }

    /// Bambu Lab X1 Carbon profile.
    pub fn bambu_x1c() -> Self {
        Self {
            name: "Bambu Lab X1 Carbon".into(),
            bed_x: 256.0,
            bed_y: 256.0,
            bed_z: 250.0,
            exclude_areas: vec![vec![[0.0, 0.0], [18.0, 0.0], [18.0, 28.0], [0.0, 28.0]]],
            nozzle_diameter: vec![0.4],
            nozzle_volume_type: vec![NozzleVolumeType::Standard],
            nozzle_type: vec![NozzleType::HardenedSteel],
            master_extruder_id: 1,
        }
    }

    /// Bambu Lab H2D dual-nozzle profile.
    pub fn bambu_h2d() -> Self {
        Self {
            name: "Bambu Lab H2D".into(),
            bed_x: 350.0,
            bed_y: 320.0,
            bed_z: 325.0,
            exclude_areas: Vec::new(),
            nozzle_diameter: vec![0.4, 0.4],
            nozzle_volume_type: vec![NozzleVolumeType::Standard, NozzleVolumeType::Standard],
            nozzle_type: vec![NozzleType::HardenedSteel, NozzleType::HardenedSteel],
            master_extruder_id: 2,
        }
    }

    /// Look up a built-in profile by short name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "generic" => Some(Self::generic()),
            "x1c" | "bambu_x1c" => Some(Self::bambu_x1c()),
            "h2d" | "bambu_h2d" => Some(Self::bambu_h2d()),
            _ => None,
        }
    }

    /// Number of extruders.
    pub fn extruder_count(&self) -> usize {
        self.nozzle_diameter.len()
    }

    /// Write the machine options of this profile into `config`.
    ///
    /// Per-extruder vectors that the profile does not own (layer height
    /// limits, z-hop) are resized to the extruder count.
    pub fn apply_to(&self, config: &mut DynamicConfig) {
        let n = self.extruder_count();
        config.set("printable_height", self.bed_z);
        config.set("nozzle_diameter", self.nozzle_diameter.clone());
        config.set(
            "nozzle_volume_type",
            self.nozzle_volume_type
                .iter()
                .map(|t| t.as_str().to_string())
                .collect::<Vec<_>>(),
        );
        config.set(
            "nozzle_type",
            self.nozzle_type
                .iter()
                .map(|t| t.as_str().to_string())
                .collect::<Vec<_>>(),
        );
        config.set("master_extruder_id", i64::from(self.master_extruder_id));
        config.set("printer_settings_id", self.name.clone());
        for key in ["min_layer_height", "max_layer_height", "z_hop"] {
            if let Ok(mut values) = config.opt_floats(key) {
                let first = values.first().copied().unwrap_or_default();
                values.resize(n, first);
                config.set(key, values);
            }
        }
    }
}
