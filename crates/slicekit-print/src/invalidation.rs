//! Which steps a changed option invalidates.
//!
//! Every option maps to the earliest steps that read it; the step graph
//! takes care of everything downstream. Unknown options invalidate from
//! slicing on.

use crate::step::{PrintObjectStep as O, PrintStep as P, StepNode};

use StepNode::{Object as Obj, Print as Prn};

const SLICE: &[StepNode] = &[Obj(O::Slice)];
const PERIMETERS: &[StepNode] = &[Obj(O::Perimeters)];
const PREPARE_INFILL: &[StepNode] = &[Obj(O::PrepareInfill)];
const INFILL: &[StepNode] = &[Obj(O::Infill)];
const IRONING: &[StepNode] = &[Obj(O::Ironing)];
const SUPPORT: &[StepNode] = &[Obj(O::SupportMaterial)];
const LIFT: &[StepNode] = &[Obj(O::DetectOverhangsForLift)];
const SIMPLIFY: &[StepNode] = &[Obj(O::SimplifyWall)];
const WIPE_TOWER: &[StepNode] = &[Prn(P::WipeTower)];
const SKIRT_BRIM: &[StepNode] = &[Prn(P::SkirtBrim)];
const GCODE: &[StepNode] = &[Prn(P::GCodeExport)];
const NOTHING: &[StepNode] = &[];
const EVERYTHING: &[StepNode] = &[Obj(O::Slice), Prn(P::WipeTower)];

/// Sorted by key for binary search.
static OPTION_STEPS: &[(&str, &[StepNode])] = &[
    ("bottom_shell_layers", PREPARE_INFILL),
    ("brim_object_gap", SKIRT_BRIM),
    ("brim_type", SKIRT_BRIM),
    ("brim_width", SKIRT_BRIM),
    ("clip_multipart_objects", SLICE),
    ("curr_bed_type", GCODE),
    ("elefant_foot_compensation", SLICE),
    ("enable_prime_tower", WIPE_TOWER),
    ("enable_support", SUPPORT),
    ("extruder", PERIMETERS),
    ("extruder_clearance_height_to_rod", GCODE),
    ("extruder_clearance_radius", GCODE),
    ("filament_colour", GCODE),
    ("filament_cost", GCODE),
    ("filament_density", GCODE),
    ("filament_diameter", GCODE),
    ("filament_map", WIPE_TOWER),
    ("filament_map_mode", WIPE_TOWER),
    ("filament_printable", NOTHING),
    ("filament_settings_id", GCODE),
    ("filament_type", WIPE_TOWER),
    ("fuzzy_skin", PERIMETERS),
    ("fuzzy_skin_point_distance", PERIMETERS),
    ("fuzzy_skin_thickness", PERIMETERS),
    ("infill_direction", INFILL),
    ("initial_layer_print_height", SLICE),
    ("inner_wall_speed", GCODE),
    ("ironing_flow", IRONING),
    ("ironing_spacing", IRONING),
    ("ironing_type", IRONING),
    ("layer_height", SLICE),
    ("line_width", PERIMETERS),
    ("master_extruder_id", NOTHING),
    ("max_layer_height", SLICE),
    ("min_layer_height", SLICE),
    ("nozzle_diameter", SLICE),
    ("nozzle_temperature", GCODE),
    ("nozzle_type", NOTHING),
    ("nozzle_volume_type", NOTHING),
    ("outer_wall_speed", GCODE),
    ("prime_tower_brim_width", WIPE_TOWER),
    ("prime_tower_width", WIPE_TOWER),
    ("prime_volume", WIPE_TOWER),
    ("print_sequence", WIPE_TOWER),
    ("print_settings_id", GCODE),
    ("printable_height", GCODE),
    ("printer_settings_id", GCODE),
    ("raft_layers", SLICE),
    ("required_nozzle_HRC", NOTHING),
    ("resolution", SIMPLIFY),
    ("skirt_distance", SKIRT_BRIM),
    ("skirt_height", SKIRT_BRIM),
    ("skirt_loops", SKIRT_BRIM),
    ("slice_closing_radius", SLICE),
    ("solid_infill_filament", INFILL),
    ("sparse_infill_density", INFILL),
    ("sparse_infill_filament", INFILL),
    ("sparse_infill_pattern", INFILL),
    ("sparse_infill_speed", GCODE),
    ("spiral_mode", SLICE),
    ("support_base_pattern_spacing", SUPPORT),
    ("support_bottom_z_distance", SUPPORT),
    ("support_filament", SUPPORT),
    ("support_interface_filament", SUPPORT),
    ("support_on_build_plate_only", SUPPORT),
    ("support_threshold_angle", SUPPORT),
    ("support_top_z_distance", SLICE),
    ("support_type", SUPPORT),
    ("top_shell_layers", PREPARE_INFILL),
    ("travel_speed", GCODE),
    ("wall_filament", PERIMETERS),
    ("wall_loops", PERIMETERS),
    ("wipe_tower_x", WIPE_TOWER),
    ("wipe_tower_y", WIPE_TOWER),
    ("xy_contour_compensation", SLICE),
    ("xy_hole_compensation", SLICE),
    ("z_hop", LIFT),
];

/// Earliest steps reading `key`.
pub fn steps_for_option(key: &str) -> &'static [StepNode] {
    match OPTION_STEPS.binary_search_by(|(k, _)| (*k).cmp(key)) {
        Ok(i) => OPTION_STEPS[i].1,
        Err(_) => EVERYTHING,
    }
}

/// Object steps to invalidate for a set of changed keys, one per key.
pub fn object_steps_for_options<'a>(keys: impl IntoIterator<Item = &'a str>) -> Vec<O> {
    let mut steps: Vec<O> = keys
        .into_iter()
        .flat_map(steps_for_option)
        .filter_map(|n| match n {
            Obj(s) => Some(*s),
            Prn(_) => None,
        })
        .collect();
    steps.sort();
    steps.dedup();
    steps
}

/// Print steps to invalidate for a set of changed keys.
pub fn print_steps_for_options<'a>(keys: impl IntoIterator<Item = &'a str>) -> Vec<P> {
    let mut steps: Vec<P> = keys
        .into_iter()
        .flat_map(steps_for_option)
        .filter_map(|n| match n {
            Prn(s) => Some(*s),
            Obj(_) => None,
        })
        .collect();
    steps.sort();
    steps.dedup();
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted() {
        assert!(OPTION_STEPS.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_wall_count_does_not_reslice() {
        assert_eq!(object_steps_for_options(["wall_loops"]), vec![O::Perimeters]);
        assert_eq!(object_steps_for_options(["layer_height"]), vec![O::Slice]);
    }

    #[test]
    fn test_unknown_key_invalidates_everything() {
        assert_eq!(object_steps_for_options(["no_such_option"]), vec![O::Slice]);
        assert_eq!(print_steps_for_options(["no_such_option"]), vec![P::WipeTower]);
    }

    #[test]
    fn test_brim_is_print_level() {
        assert!(object_steps_for_options(["brim_width"]).is_empty());
        assert_eq!(print_steps_for_options(["brim_width", "travel_speed"]), vec![P::SkirtBrim, P::GCodeExport]);
    }
}
