//! Built-in option defaults and key classification.
//!
//! Every option belongs to exactly one scope. Object and region keys are
//! listed explicitly; any other key is a print (plate-wide) key.

use crate::value::{ConfigValue, DynamicConfig};

/// Keys resolved per print object.
pub const OBJECT_KEYS: &[&str] = &[
    "brim_object_gap",
    "brim_type",
    "brim_width",
    "elefant_foot_compensation",
    "enable_support",
    "layer_height",
    "raft_layers",
    "slice_closing_radius",
    "support_base_pattern_spacing",
    "support_bottom_z_distance",
    "support_filament",
    "support_interface_filament",
    "support_on_build_plate_only",
    "support_threshold_angle",
    "support_top_z_distance",
    "support_type",
    "xy_contour_compensation",
    "xy_hole_compensation",
];

/// Keys resolved per print region.
pub const REGION_KEYS: &[&str] = &[
    "bottom_shell_layers",
    "fuzzy_skin",
    "fuzzy_skin_point_distance",
    "fuzzy_skin_thickness",
    "infill_direction",
    "inner_wall_speed",
    "ironing_flow",
    "ironing_spacing",
    "ironing_type",
    "line_width",
    "outer_wall_speed",
    "solid_infill_filament",
    "sparse_infill_density",
    "sparse_infill_filament",
    "sparse_infill_pattern",
    "sparse_infill_speed",
    "top_shell_layers",
    "wall_filament",
    "wall_loops",
];

/// Volume-only key overriding every feature filament of a region.
pub const VOLUME_EXTRUDER_KEY: &str = "extruder";

/// Scope an option key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// Plate-wide option.
    Print,
    /// Per-object option.
    Object,
    /// Per-region option.
    Region,
    /// Per-volume extruder override.
    Volume,
}

/// Classify an option key.
pub fn key_scope(key: &str) -> KeyScope {
    if key == VOLUME_EXTRUDER_KEY {
        KeyScope::Volume
    } else if OBJECT_KEYS.binary_search(&key).is_ok() {
        KeyScope::Object
    } else if REGION_KEYS.binary_search(&key).is_ok() {
        KeyScope::Region
    } else {
        KeyScope::Print
    }
}

/// True for per-object keys.
pub fn is_object_key(key: &str) -> bool {
    key_scope(key) == KeyScope::Object
}

/// True for per-region keys.
pub fn is_region_key(key: &str) -> bool {
    key_scope(key) == KeyScope::Region
}

/// True for plate-wide keys.
pub fn is_print_key(key: &str) -> bool {
    key_scope(key) == KeyScope::Print
}

impl DynamicConfig {
    /// Complete set of built-in defaults for a single-extruder printer.
    pub fn defaults() -> Self {
        let entries: Vec<(&str, ConfigValue)> = vec![
            // Machine
            ("printable_height", 250.0.into()),
            ("nozzle_diameter", vec![0.4].into()),
            ("nozzle_volume_type", vec!["standard"].into()),
            ("nozzle_type", vec!["hardened_steel"].into()),
            ("master_extruder_id", 1i64.into()),
            ("min_layer_height", vec![0.08].into()),
            ("max_layer_height", vec![0.28].into()),
            ("extruder_clearance_radius", 65.0.into()),
            ("extruder_clearance_height_to_rod", 36.0.into()),
            ("z_hop", vec![0.4].into()),
            ("printer_settings_id", "Generic 0.4 nozzle".into()),
            // Filaments
            ("filament_type", vec!["PLA"].into()),
            ("filament_settings_id", vec!["Generic PLA"].into()),
            ("filament_colour", vec!["#F2754E"].into()),
            ("filament_diameter", vec![1.75].into()),
            ("filament_density", vec![1.24].into()),
            ("filament_cost", vec![20.0].into()),
            ("filament_printable", vec![3i64].into()),
            ("required_nozzle_HRC", vec![3i64].into()),
            ("filament_map", vec![1i64].into()),
            ("filament_map_mode", "auto_for_flush".into()),
            ("nozzle_temperature", vec![220i64].into()),
            // Plate
            ("curr_bed_type", "textured_plate".into()),
            ("print_sequence", "by_layer".into()),
            ("spiral_mode", false.into()),
            ("initial_layer_print_height", 0.2.into()),
            ("clip_multipart_objects", true.into()),
            ("resolution", 0.012.into()),
            ("enable_prime_tower", true.into()),
            ("prime_tower_width", 35.0.into()),
            ("prime_tower_brim_width", 3.0.into()),
            ("prime_volume", 45.0.into()),
            ("wipe_tower_x", vec![165.0].into()),
            ("wipe_tower_y", vec![220.0].into()),
            ("skirt_loops", 0i64.into()),
            ("skirt_distance", 2.0.into()),
            ("skirt_height", 1i64.into()),
            ("travel_speed", 500.0.into()),
            ("print_settings_id", "0.20mm Standard".into()),
            // Object
            ("layer_height", 0.2.into()),
            ("raft_layers", 0i64.into()),
            ("enable_support", false.into()),
            ("support_type", "normal(auto)".into()),
            ("support_threshold_angle", 30.0.into()),
            ("support_on_build_plate_only", false.into()),
            ("support_filament", 0i64.into()),
            ("support_interface_filament", 0i64.into()),
            ("support_top_z_distance", 0.2.into()),
            ("support_bottom_z_distance", 0.2.into()),
            ("support_base_pattern_spacing", 2.5.into()),
            ("brim_type", "auto_brim".into()),
            ("brim_width", 5.0.into()),
            ("brim_object_gap", 0.1.into()),
            ("xy_contour_compensation", 0.0.into()),
            ("xy_hole_compensation", 0.0.into()),
            ("elefant_foot_compensation", 0.15.into()),
            ("slice_closing_radius", 0.049.into()),
            // Region
            ("wall_loops", 2i64.into()),
            ("wall_filament", 1i64.into()),
            ("sparse_infill_filament", 1i64.into()),
            ("solid_infill_filament", 1i64.into()),
            ("sparse_infill_density", 15.0.into()),
            ("sparse_infill_pattern", "grid".into()),
            ("infill_direction", 45.0.into()),
            ("top_shell_layers", 3i64.into()),
            ("bottom_shell_layers", 3i64.into()),
            ("line_width", 0.42.into()),
            ("ironing_type", "no ironing".into()),
            ("ironing_spacing", 0.1.into()),
            ("ironing_flow", 10.0.into()),
            ("fuzzy_skin", "none".into()),
            ("fuzzy_skin_thickness", 0.3.into()),
            ("fuzzy_skin_point_distance", 0.8.into()),
            ("outer_wall_speed", 200.0.into()),
            ("inner_wall_speed", 300.0.into()),
            ("sparse_infill_speed", 270.0.into()),
        ];
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    /// Plate-wide subset.
    pub fn print_part(&self) -> DynamicConfig {
        self.filtered(is_print_key)
    }

    /// Per-object subset.
    pub fn object_part(&self) -> DynamicConfig {
        self.filtered(is_object_key)
    }

    /// Per-region subset.
    pub fn region_part(&self) -> DynamicConfig {
        self.filtered(is_region_key)
    }

    /// Number of configured filaments.
    pub fn filament_count(&self) -> usize {
        self.vector_len("filament_type").max(1)
    }

    /// Number of physical extruders.
    pub fn extruder_count(&self) -> usize {
        self.vector_len("nozzle_diameter").max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_lists_are_sorted_for_binary_search() {
        assert!(OBJECT_KEYS.windows(2).all(|w| w[0] < w[1]));
        assert!(REGION_KEYS.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_scopes_partition_defaults() {
        let d = DynamicConfig::defaults();
        let total = d.print_part().len() + d.object_part().len() + d.region_part().len();
        assert_eq!(total, d.len());
        assert_eq!(key_scope("wall_loops"), KeyScope::Region);
        assert_eq!(key_scope("layer_height"), KeyScope::Object);
        assert_eq!(key_scope("skirt_loops"), KeyScope::Print);
        assert_eq!(key_scope("extruder"), KeyScope::Volume);
    }

    #[test]
    fn test_every_listed_key_has_a_default() {
        let d = DynamicConfig::defaults();
        for key in OBJECT_KEYS.iter().chain(REGION_KEYS) {
            assert!(d.has(key), "no default for {key}");
        }
    }
}
