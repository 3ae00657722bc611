//! Layer height resolution for one object.
//!
//! [`SlicingParameters`] are derived from the object's settings and height.
//! Variable layer heights are described by a profile `[z0, h0, z1, h1, ...]`
//! of (object Z, layer height) pairs, interpolated linearly.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use slicekit_config::DynamicConfig;
use slicekit_math::EPSILON;
use slicekit_model::LayerConfigRange;

use crate::error::{PrintError, Result};

/// Layering of one object, raft included.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SlicingParameters {
    /// False until resolved.
    pub valid: bool,
    /// Raft layers below the interface.
    pub base_raft_layers: usize,
    /// Raft interface layers, the contact layer included.
    pub interface_raft_layers: usize,
    /// Height of base raft layers.
    pub base_raft_layer_height: f64,
    /// Height of interface raft layers.
    pub interface_raft_layer_height: f64,
    /// Height of the raft contact layer.
    pub contact_raft_layer_height: f64,
    /// Regular layer height.
    pub layer_height: f64,
    /// Thinnest layer any used nozzle can print.
    pub min_layer_height: f64,
    /// Thickest layer any used nozzle can print.
    pub max_layer_height: f64,
    /// First layer of the print (raft or object).
    pub first_print_layer_height: f64,
    /// First object layer.
    pub first_object_layer_height: f64,
    /// First object layer printed as a bridge over the raft.
    pub first_object_layer_bridging: bool,
    /// Support interfaces are soluble; no gaps are left.
    pub soluble_interface: bool,
    /// Gap between raft top and object.
    pub gap_raft_object: f64,
    /// Gap between object and support below it.
    pub gap_object_support: f64,
    /// Gap between support and object above it.
    pub gap_support_object: f64,
    /// Top of the base raft.
    pub raft_base_top_z: f64,
    /// Top of the raft interface.
    pub raft_interface_top_z: f64,
    /// Top of the raft contact layer.
    pub raft_contact_top_z: f64,
    /// Print Z of the object's bottom.
    pub object_print_z_min: f64,
    /// Print Z of the object's top.
    pub object_print_z_max: f64,
}

/// 0-based physical extruder printing 1-based `filament`.
pub fn physical_extruder(config: &DynamicConfig, filament: u32) -> usize {
    let idx = filament.max(1) as usize - 1;
    let extruders = config.extruder_count();
    let mapped = config
        .opt_int_at("filament_map", idx)
        .map(|e| e.max(1) as usize - 1)
        .unwrap_or(0);
    mapped.min(extruders - 1)
}

impl SlicingParameters {
    /// Resolve layering for an object `object_height` mm tall, printed with
    /// `object_extruders` (1-based filaments).
    pub fn from_config(
        config: &DynamicConfig,
        object_height: f64,
        object_extruders: &BTreeSet<u32>,
    ) -> Result<Self> {
        let layer_height = config.opt_float("layer_height")?;
        let first_layer_height = config.opt_float("initial_layer_print_height")?;
        if layer_height <= 0.0 {
            return Err(invalid("layer height must be positive"));
        }
        if first_layer_height <= 0.0 {
            return Err(invalid("initial layer height must be positive"));
        }

        let mut params = SlicingParameters {
            layer_height,
            first_print_layer_height: first_layer_height,
            first_object_layer_height: first_layer_height,
            object_print_z_min: 0.0,
            object_print_z_max: object_height,
            base_raft_layers: config.opt_int("raft_layers")?.max(0) as usize,
            soluble_interface: config.opt_float("support_top_z_distance")? == 0.0,
            ..Default::default()
        };

        let mut min_layer_height: f64 = 0.0;
        let mut max_layer_height = f64::MAX;
        for &filament in object_extruders {
            let e = physical_extruder(config, filament);
            let nozzle = config.opt_float_at("nozzle_diameter", e)?;
            min_layer_height = min_layer_height.max(config.opt_float_at("min_layer_height", e)?);
            let max = config.opt_float_at("max_layer_height", e)?;
            max_layer_height = max_layer_height.min(if max > 0.0 { max } else { 0.75 * nozzle });
        }
        if max_layer_height == f64::MAX {
            max_layer_height = 0.75 * config.opt_float_at("nozzle_diameter", 0)?;
        }
        params.min_layer_height = min_layer_height.min(layer_height);
        params.max_layer_height = max_layer_height.max(layer_height);

        if !params.soluble_interface {
            params.gap_raft_object = config.opt_float("support_top_z_distance")?;
            params.gap_object_support = config.opt_float("support_bottom_z_distance")?;
            params.gap_support_object = config.opt_float("support_top_z_distance")?;
        }

        if params.base_raft_layers > 0 {
            params.interface_raft_layers = (params.base_raft_layers + 1) / 2;
            params.base_raft_layers -= params.interface_raft_layers;
            let support_nozzle = support_nozzle_diameter(config, "support_filament")?;
            let interface_nozzle = support_nozzle_diameter(config, "support_interface_filament")?;
            params.base_raft_layer_height = layer_height.max(0.75 * support_nozzle);
            params.interface_raft_layer_height = layer_height.max(0.75 * interface_nozzle);
            params.contact_raft_layer_height = layer_height.max(0.75 * interface_nozzle);
            // The first object layer sits on the raft at regular height.
            params.first_object_layer_height = layer_height;
        }

        if params.has_raft() {
            if params.raft_layers() == 1 {
                params.contact_raft_layer_height = first_layer_height;
                params.raft_contact_top_z = first_layer_height;
            } else {
                params.raft_base_top_z = first_layer_height
                    + params.base_raft_layers.saturating_sub(1) as f64 * params.base_raft_layer_height;
                params.raft_interface_top_z = params.raft_base_top_z
                    + params.interface_raft_layers.saturating_sub(1) as f64
                        * params.interface_raft_layer_height;
                params.raft_contact_top_z =
                    params.raft_interface_top_z + params.contact_raft_layer_height;
            }
            let print_z = params.raft_contact_top_z + params.gap_raft_object;
            params.object_print_z_min = print_z;
            params.object_print_z_max += print_z;
        }

        params.valid = true;
        Ok(params)
    }

    /// Total raft layers.
    pub fn raft_layers(&self) -> usize {
        self.base_raft_layers + self.interface_raft_layers
    }

    /// True when a raft is printed under the object.
    pub fn has_raft(&self) -> bool {
        self.raft_layers() > 0
    }

    /// True when the first object layer keeps its configured height.
    pub fn first_object_layer_height_fixed(&self) -> bool {
        !self.has_raft() || self.first_object_layer_bridging
    }

    /// Height of the object itself, raft excluded.
    pub fn object_print_z_height(&self) -> f64 {
        self.object_print_z_max - self.object_print_z_min
    }
}

fn invalid(message: &str) -> PrintError {
    PrintError::InvalidConfig {
        object_id: None,
        message: message.to_string(),
    }
}

fn support_nozzle_diameter(config: &DynamicConfig, key: &str) -> Result<f64> {
    let filament = config.opt_int(key)?;
    // 0 means "whatever extruder is loaded"; use the first.
    let e = if filament > 0 {
        physical_extruder(config, filament as u32)
    } else {
        0
    };
    Ok(config.opt_float_at("nozzle_diameter", e)?)
}

fn append_step(profile: &mut Vec<f64>, z: f64, h: f64) {
    let n = profile.len();
    if n >= 2 {
        let last_z_matches = (profile[n - 2] - z).abs() < EPSILON;
        let last_h_matches = (profile[n - 1] - h).abs() < EPSILON;
        if last_h_matches {
            if last_z_matches {
                return;
            }
            if n >= 4 && (profile[n - 3] - h).abs() < EPSILON {
                // Third point at the same height: move the last one up.
                profile[n - 2] = z;
                return;
            }
        }
    }
    profile.push(z);
    profile.push(h);
}

/// Profile from the object's layer-range overrides, regular height elsewhere.
pub fn layer_height_profile_from_ranges(
    params: &SlicingParameters,
    ranges: &[LayerConfigRange],
) -> Vec<f64> {
    let top = params.object_print_z_height();

    let mut trimmed: Vec<(f64, f64, f64)> = ranges
        .iter()
        .filter_map(|r| {
            let height = r.config.opt_float("layer_height").ok()?;
            let lo = r.lo.max(0.0);
            let hi = r.hi.min(top);
            (hi > lo + EPSILON).then(|| {
                (lo, hi, height.clamp(params.min_layer_height, params.max_layer_height))
            })
        })
        .collect();
    trimmed.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut profile = Vec::new();
    let mut last_hi: f64 = 0.0;
    for (lo, hi, height) in trimmed {
        let lo = lo.max(last_hi);
        if hi <= lo + EPSILON {
            continue;
        }
        let z = profile.len().checked_sub(2).map_or(0.0, |i| profile[i]);
        if lo > z + EPSILON {
            append_step(&mut profile, z, params.layer_height);
            append_step(&mut profile, lo, params.layer_height);
        }
        append_step(&mut profile, lo, height);
        append_step(&mut profile, hi, height);
        last_hi = hi;
    }

    let z = profile.len().checked_sub(2).map_or(0.0, |i| profile[i]);
    if z < top {
        append_step(&mut profile, z, params.layer_height);
        append_step(&mut profile, top, params.layer_height);
    }
    profile
}

/// `[lo0, hi0, lo1, hi1, ...]` object-Z bounds of every object layer.
pub fn generate_object_layers(params: &SlicingParameters, profile: &[f64]) -> Vec<f64> {
    let top = params.object_print_z_height();
    let mut out = Vec::new();
    let mut print_z = 0.0;
    if params.first_object_layer_height_fixed() {
        out.push(0.0);
        print_z = params.first_object_layer_height;
        out.push(print_z);
    }

    let mut idx = 0;
    let mut slice_z = print_z + 0.5 * params.min_layer_height;
    while slice_z < top {
        let mut height = params.min_layer_height;
        if idx + 1 < profile.len() {
            let mut next = idx + 2;
            while next + 1 < profile.len() && slice_z >= profile[next] {
                idx = next;
                next += 2;
            }
            let (z1, h1) = (profile[idx], profile[idx + 1]);
            height = h1;
            if next + 1 < profile.len() {
                let (z2, h2) = (profile[next], profile[next + 1]);
                if z2 - z1 > EPSILON {
                    let t = ((slice_z - z1) / (z2 - z1)).clamp(0.0, 1.0);
                    height = h1 + (h2 - h1) * t;
                }
            }
        }
        height = height.clamp(params.min_layer_height, params.max_layer_height);
        if height <= 0.0 {
            break;
        }
        slice_z = print_z + 0.5 * height;
        if slice_z >= top {
            break;
        }
        out.push(print_z);
        print_z += height;
        slice_z = print_z + 0.5 * params.min_layer_height;
        out.push(print_z);
    }
    out
}

/// Reconcile a stored profile with new parameters.
///
/// An odd-length profile is regenerated from the ranges. A profile ending
/// above the object is truncated at the new top, one ending below is
/// extended with regular layers; user edits below the shorter of the two
/// heights survive. Returns true when `profile` changed.
pub fn update_layer_height_profile(
    params: &SlicingParameters,
    ranges: &[LayerConfigRange],
    profile: &mut Vec<f64>,
) -> bool {
    let top = params.object_print_z_height();
    if profile.is_empty() || profile.len() % 2 != 0 {
        *profile = layer_height_profile_from_ranges(params, ranges);
        return true;
    }

    let mut changed = false;
    for h in profile.iter_mut().skip(1).step_by(2) {
        let clamped = h.clamp(params.min_layer_height, params.max_layer_height);
        if clamped != *h {
            *h = clamped;
            changed = true;
        }
    }

    let last_z = profile[profile.len() - 2];
    if (last_z - top).abs() <= 1e-3 {
        return changed;
    }

    if last_z > top {
        let height_at_top = profile_height_at(profile, top);
        let keep = profile.chunks_exact(2).take_while(|p| p[0] < top).count();
        profile.truncate(keep * 2);
        append_step(profile, top, height_at_top);
    } else {
        append_step(profile, last_z, params.layer_height);
        append_step(profile, top, params.layer_height);
    }
    true
}

/// Layer height the profile gives at object Z `z`.
pub fn profile_height_at(profile: &[f64], z: f64) -> f64 {
    let points: Vec<(f64, f64)> = profile.chunks_exact(2).map(|p| (p[0], p[1])).collect();
    match points.iter().position(|&(pz, _)| pz > z) {
        None => points.last().map_or(0.0, |p| p.1),
        Some(0) => points[0].1,
        Some(i) => {
            let (z1, h1) = points[i - 1];
            let (z2, h2) = points[i];
            if z2 - z1 > EPSILON {
                h1 + (h2 - h1) * (z - z1) / (z2 - z1)
            } else {
                h2
            }
        }
    }
}
