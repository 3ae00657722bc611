//! Filament, nozzle and extruder compatibility rules.
//!
//! Pure checks over the resolved print config. Nothing here mutates state;
//! callers decide whether a failure blocks slicing.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use slicekit_config::{DynamicConfig, FilamentMapMode, NozzleType, NozzleVolumeType};
use tracing::debug;

use crate::error::{PrintError, Result};

/// Thermal class of a filament.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FilamentTempType {
    /// Needs a hot chamber and bed.
    HighTemp,
    /// Softens in a hot chamber.
    LowTemp,
    /// Prints with either class.
    HighLowCompatible,
    /// Not in the table.
    Undefined,
}

/// Outcome of mixing several filaments on one plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilamentCompatibilityType {
    /// All filaments share a thermal class.
    Compatible,
    /// High and low temperature filaments are mixed.
    HighLowMixed,
    /// High temperature with compatible filaments.
    HighMidMixed,
    /// Low temperature with compatible filaments.
    LowMidMixed,
}

const HIGH_TEMP_FILAMENTS: &[&str] = &[
    "ABS", "ABS-GF", "ASA", "ASA-AERO", "PA", "PA-CF", "PA-GF", "PA6-CF", "PA6-GF", "PAHT-CF",
    "PC", "PC-CF", "PET-CF", "PPA-CF", "PPA-GF", "PPS", "PPS-CF",
];

const LOW_TEMP_FILAMENTS: &[&str] = &["BVOH", "PLA", "PLA-AERO", "PLA-CF", "PVA", "TPU"];

const HIGH_LOW_COMPATIBLE_FILAMENTS: &[&str] =
    &["EVA", "HIPS", "PCTG", "PE", "PE-CF", "PETG", "PETG-CF", "PHA", "PP", "PP-CF", "PP-GF"];

/// Thermal class of a filament type name.
pub fn get_filament_temp_type(filament_type: &str) -> FilamentTempType {
    let name = filament_type.trim().to_ascii_uppercase();
    let name = name.as_str();
    if HIGH_TEMP_FILAMENTS.contains(&name) {
        FilamentTempType::HighTemp
    } else if LOW_TEMP_FILAMENTS.contains(&name) {
        FilamentTempType::LowTemp
    } else if HIGH_LOW_COMPATIBLE_FILAMENTS.contains(&name) {
        FilamentTempType::HighLowCompatible
    } else {
        FilamentTempType::Undefined
    }
}

/// Classify a set of filament types. Unknown types are ignored.
pub fn check_multi_filaments_compatibility<S: AsRef<str>>(types: &[S]) -> FilamentCompatibilityType {
    let classes: BTreeSet<FilamentTempType> =
        types.iter().map(|t| get_filament_temp_type(t.as_ref())).collect();
    let high = classes.contains(&FilamentTempType::HighTemp);
    let low = classes.contains(&FilamentTempType::LowTemp);
    let mid = classes.contains(&FilamentTempType::HighLowCompatible);
    if high && low {
        FilamentCompatibilityType::HighLowMixed
    } else if high && mid {
        FilamentCompatibilityType::HighMidMixed
    } else if low && mid {
        FilamentCompatibilityType::LowMidMixed
    } else {
        FilamentCompatibilityType::Compatible
    }
}

/// False when high and low temperature classes meet.
pub fn is_filaments_compatible(types: &[FilamentTempType]) -> bool {
    let high = types.contains(&FilamentTempType::HighTemp);
    let low = types.contains(&FilamentTempType::LowTemp);
    !(high && low)
}

/// Class a multi-material object prints as.
///
/// Low or high temperature absorbs compatible filaments; high and low
/// together have no common class and give `None`. Unknown types are ignored.
pub fn get_compatible_filament_type(
    types: impl IntoIterator<Item = FilamentTempType>,
) -> Option<FilamentTempType> {
    let classes: BTreeSet<FilamentTempType> = types.into_iter().collect();
    let high = classes.contains(&FilamentTempType::HighTemp);
    let low = classes.contains(&FilamentTempType::LowTemp);
    match (high, low) {
        (true, true) => None,
        (true, false) => Some(FilamentTempType::HighTemp),
        (false, true) => Some(FilamentTempType::LowTemp),
        (false, false) if classes.contains(&FilamentTempType::HighLowCompatible) => {
            Some(FilamentTempType::HighLowCompatible)
        }
        (false, false) => Some(FilamentTempType::Undefined),
    }
}

/// Filaments that must not run through one nozzle class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NozzleFilamentRule {
    /// Nozzle diameter the rule applies to (mm).
    pub nozzle_diameter: f64,
    /// Flow class the rule applies to; `None` for any.
    #[serde(default)]
    pub volume_type: Option<NozzleVolumeType>,
    /// Filament types or preset names that are not allowed.
    pub incompatible_filaments: Vec<String>,
}

/// Table of nozzle/filament restrictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NozzleFilamentRules {
    /// Rules in no particular order.
    pub rules: Vec<NozzleFilamentRule>,
}

impl Default for NozzleFilamentRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl NozzleFilamentRules {
    /// Restrictions known for stock nozzles.
    pub fn builtin() -> Self {
        let filled: Vec<String> = [
            "ABS-GF", "PA-CF", "PA6-CF", "PAHT-CF", "PET-CF", "PETG-CF", "PLA-CF", "PPA-CF",
            "PPA-GF", "PPS-CF",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self {
            rules: vec![
                NozzleFilamentRule {
                    nozzle_diameter: 0.2,
                    volume_type: None,
                    incompatible_filaments: filled,
                },
                NozzleFilamentRule {
                    nozzle_diameter: 0.4,
                    volume_type: Some(NozzleVolumeType::HighFlow),
                    incompatible_filaments: vec!["TPU".into(), "PVA".into()],
                },
            ],
        }
    }

    /// Load a table from JSON.
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Filaments not allowed on a nozzle of `diameter` and `volume_type`.
    pub fn get_incompatible_filaments_by_nozzle(
        &self,
        diameter: f64,
        volume_type: Option<NozzleVolumeType>,
    ) -> Vec<String> {
        let mut out: Vec<String> = self
            .rules
            .iter()
            .filter(|r| (r.nozzle_diameter - diameter).abs() < 1e-3)
            .filter(|r| match (r.volume_type, volume_type) {
                (None, _) => true,
                (Some(rule), Some(actual)) => rule == actual,
                (Some(_), None) => false,
            })
            .flat_map(|r| r.incompatible_filaments.iter().cloned())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// Type name of 1-based `filament`.
pub fn filament_type(config: &DynamicConfig, filament: u32) -> String {
    config
        .opt_string_at("filament_type", filament.max(1) as usize - 1)
        .map(str::to_string)
        .unwrap_or_default()
}

fn filament_alias(config: &DynamicConfig, filament: u32) -> String {
    config
        .opt_string_at("filament_settings_id", filament.max(1) as usize - 1)
        .map(str::to_string)
        .unwrap_or_else(|_| filament_type(config, filament))
}

/// Check every used filament against the nozzles of every extruder and
/// report all violations at once.
pub fn check_compatible_of_nozzle_and_filament(
    config: &DynamicConfig,
    used_filaments: &[u32],
    rules: &NozzleFilamentRules,
) -> Result<()> {
    let mut nozzles = BTreeSet::new();
    for e in 0..config.extruder_count() {
        let diameter = config.opt_float_at("nozzle_diameter", e)?;
        let volume_type: Option<NozzleVolumeType> = config
            .opt_string_at("nozzle_volume_type", e)
            .ok()
            .and_then(|s| s.parse().ok());
        nozzles.insert(((diameter * 1000.0).round() as i64, volume_type));
    }

    let mut violations = BTreeSet::new();
    for (diameter_um, volume_type) in nozzles {
        let diameter = diameter_um as f64 / 1000.0;
        let incompatible = rules.get_incompatible_filaments_by_nozzle(diameter, volume_type);
        for &f in used_filaments {
            let ty = filament_type(config, f);
            let alias = filament_alias(config, f);
            let hit = incompatible
                .iter()
                .any(|i| i.eq_ignore_ascii_case(&ty) || i.eq_ignore_ascii_case(&alias));
            if hit {
                let nozzle = match volume_type {
                    Some(vt) => format!("{diameter} mm {vt} nozzle"),
                    None => format!("{diameter} mm nozzle"),
                };
                violations.insert(format!("{alias} is not compatible with the {nozzle}."));
            }
        }
    }

    if violations.is_empty() {
        return Ok(());
    }
    let message = violations.into_iter().collect::<Vec<_>>().join("\n");
    debug!(%message, "nozzle/filament incompatibility");
    Err(PrintError::Incompatible(message))
}

/// Per extruder, the used filaments it physically cannot print.
///
/// Flexible filament only feeds the master extruder on multi-extruder
/// machines, and a filament needing a harder nozzle than an extruder has is
/// unprintable there.
pub fn get_physical_unprintable_filaments(
    config: &DynamicConfig,
    used_filaments: &[u32],
) -> Vec<BTreeSet<u32>> {
    let extruders = config.extruder_count();
    let master = config
        .opt_int("master_extruder_id")
        .map(|m| m.max(1) as usize - 1)
        .unwrap_or(0);
    let mut out = vec![BTreeSet::new(); extruders];
    for (e, unprintable) in out.iter_mut().enumerate() {
        let nozzle_hrc = config
            .opt_string_at("nozzle_type", e)
            .ok()
            .and_then(|s| s.parse::<NozzleType>().ok())
            .map_or(0, NozzleType::hrc);
        for &f in used_filaments {
            let idx = f.max(1) as usize - 1;
            if extruders > 1 && e != master && filament_type(config, f).eq_ignore_ascii_case("TPU") {
                unprintable.insert(f);
            }
            let required = config.opt_int_at("required_nozzle_HRC", idx).unwrap_or(0);
            if nozzle_hrc > 0 && required > nozzle_hrc {
                unprintable.insert(f);
            }
        }
    }
    out
}

fn extruder_side(extruder: usize) -> &'static str {
    if extruder == 0 {
        "left"
    } else {
        "right"
    }
}

/// Under manual filament mapping, fail on the first filament assigned to an
/// extruder that cannot print it. Automatic modes pick printable extruders
/// themselves and always pass.
pub fn check_filament_printable(
    config: &DynamicConfig,
    used_filaments: &[u32],
    mode: FilamentMapMode,
    filament_maps: &[u32],
) -> Result<()> {
    if mode != FilamentMapMode::Manual {
        return Ok(());
    }
    let unprintable = get_physical_unprintable_filaments(config, used_filaments);
    for &f in used_filaments {
        let idx = f.max(1) as usize - 1;
        let extruder = filament_maps
            .get(idx)
            .map(|&e| e.max(1) as usize - 1)
            .unwrap_or(0);
        let mask = config.opt_int_at("filament_printable", idx).unwrap_or(!0);
        let by_mask = extruder < 63 && mask & (1 << extruder) == 0;
        let by_physics = unprintable.get(extruder).is_some_and(|s| s.contains(&f));
        if by_mask || by_physics {
            let message = format!(
                "The {} extruder can not print {}. Please change the filament grouping.",
                extruder_side(extruder),
                filament_type(config, f)
            );
            debug!(filament = f, extruder, "filament not printable");
            return Err(PrintError::Incompatible(message));
        }
    }
    Ok(())
}

/// False when PLA and PETG are both used.
pub fn check_mixture_of_pla_and_petg<S: AsRef<str>>(types: &[S]) -> bool {
    let has = |name: &str| types.iter().any(|t| t.as_ref().eq_ignore_ascii_case(name));
    !(has("PLA") && has("PETG"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual_config() -> DynamicConfig {
        let mut config = DynamicConfig::defaults();
        config.set("nozzle_diameter", vec![0.4, 0.4]);
        config.set("nozzle_volume_type", vec!["standard", "high_flow"]);
        config.set("nozzle_type", vec!["hardened_steel", "brass"]);
        config.set("master_extruder_id", 1i64);
        config.set("filament_type", vec!["PLA", "TPU", "PA-CF"]);
        config.set("filament_settings_id", vec!["Generic PLA", "Generic TPU", "Generic PA-CF"]);
        config.set("required_nozzle_HRC", vec![3i64, 3, 40]);
        config.set("filament_printable", vec![3i64, 3, 3]);
        config.set("filament_map", vec![1i64, 1, 2]);
        config
    }

    #[test]
    fn test_temp_types() {
        assert_eq!(get_filament_temp_type("pla"), FilamentTempType::LowTemp);
        assert_eq!(get_filament_temp_type("ABS"), FilamentTempType::HighTemp);
        assert_eq!(get_filament_temp_type("PETG"), FilamentTempType::HighLowCompatible);
        assert_eq!(get_filament_temp_type("Unobtainium"), FilamentTempType::Undefined);
    }

    #[test]
    fn test_mixture_classification() {
        assert_eq!(check_multi_filaments_compatibility(&["ABS", "PLA"]), FilamentCompatibilityType::HighLowMixed);
        assert_eq!(check_multi_filaments_compatibility(&["PLA", "PETG"]), FilamentCompatibilityType::LowMidMixed);
        assert_eq!(check_multi_filaments_compatibility(&["ABS", "PETG"]), FilamentCompatibilityType::HighMidMixed);
        assert_eq!(check_multi_filaments_compatibility(&["PLA", "???"]), FilamentCompatibilityType::Compatible);
    }

    #[test]
    fn test_collapse_rule() {
        let t = |names: &[&str]| {
            get_compatible_filament_type(names.iter().map(|n| get_filament_temp_type(n)))
        };
        assert_eq!(t(&["PLA", "PETG"]), Some(FilamentTempType::LowTemp));
        assert_eq!(t(&["ABS", "PETG"]), Some(FilamentTempType::HighTemp));
        assert_eq!(t(&["ABS", "PLA"]), None);
        assert_eq!(t(&["PETG", "???"]), Some(FilamentTempType::HighLowCompatible));
        assert!(!is_filaments_compatible(&[FilamentTempType::HighTemp, FilamentTempType::LowTemp]));
        assert!(is_filaments_compatible(&[FilamentTempType::HighTemp, FilamentTempType::Undefined]));
    }

    #[test]
    fn test_nozzle_check_lists_every_violation() {
        let mut config = dual_config();
        config.set("nozzle_diameter", vec![0.2, 0.4]);
        let err = check_compatible_of_nozzle_and_filament(&config, &[1, 2, 3], &NozzleFilamentRules::builtin())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Generic PA-CF"));
        assert!(message.contains("Generic TPU"));
        assert_eq!(message.lines().count(), 2);
    }

    #[test]
    fn test_nozzle_check_passes_standard_setup() {
        let config = DynamicConfig::defaults();
        assert!(check_compatible_of_nozzle_and_filament(&config, &[1], &NozzleFilamentRules::builtin()).is_ok());
    }

    #[test]
    fn test_rules_load_from_json() {
        let rules = NozzleFilamentRules::from_json_str(
            r#"{"rules":[{"nozzle_diameter":0.6,"incompatible_filaments":["PVA"]}]}"#,
        )
        .unwrap();
        assert_eq!(rules.get_incompatible_filaments_by_nozzle(0.6, None), vec!["PVA"]);
        assert!(rules.get_incompatible_filaments_by_nozzle(0.4, None).is_empty());
    }

    #[test]
    fn test_physical_unprintables() {
        let unprintable = get_physical_unprintable_filaments(&dual_config(), &[1, 2, 3]);
        assert!(unprintable[0].is_empty());
        // TPU off the master extruder, PA-CF needs more than brass.
        assert_eq!(unprintable[1], BTreeSet::from([2, 3]));
    }

    #[test]
    fn test_printable_check_is_manual_only_and_fail_fast() {
        let config = dual_config();
        assert!(check_filament_printable(&config, &[1, 2, 3], FilamentMapMode::AutoForFlush, &[1, 1, 2]).is_ok());
        let err = check_filament_printable(&config, &[1, 2, 3], FilamentMapMode::Manual, &[1, 1, 2]).unwrap_err();
        assert_eq!(err.to_string(), "The right extruder can not print PA-CF. Please change the filament grouping.");
        assert!(check_filament_printable(&config, &[1, 2], FilamentMapMode::Manual, &[1, 1, 2]).is_ok());
    }

    #[test]
    fn test_pla_petg_mixture() {
        assert!(!check_mixture_of_pla_and_petg(&["PLA", "PETG"]));
        assert!(check_mixture_of_pla_and_petg(&["PLA", "PLA"]));
    }
}
