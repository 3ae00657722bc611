//! Typed views of enum-valued options.
//!
//! Enum options are stored as strings in [`DynamicConfig`](crate::DynamicConfig);
//! these types give them names and parse them back with `opt_enum`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

macro_rules! config_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $s:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $s)] $variant ),+
        }

        impl $name {
            /// Every variant in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Name as stored in configuration files.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($s => Ok($name::$variant),)+
                    _ => Err(ConfigError::InvalidEnum {
                        enum_name: stringify!($name),
                        value: s.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

config_enum! {
    /// Policy deciding how filaments are assigned to physical extruders.
    FilamentMapMode {
        /// Follow the global setting.
        Default => "default",
        /// Group filaments to minimize flushing.
        AutoForFlush => "auto_for_flush",
        /// Group filaments for print quality.
        AutoForQuality => "auto_for_quality",
        /// Use the explicit per-filament mapping.
        Manual => "manual",
    }
}

config_enum! {
    /// Build plate surface.
    BedType {
        /// Follow the global setting.
        Default => "default",
        /// Smooth cool plate.
        CoolPlate => "cool_plate",
        /// Engineering plate.
        EngineeringPlate => "engineering_plate",
        /// High temperature plate.
        HighTempPlate => "high_temp_plate",
        /// Textured PEI plate.
        TexturedPlate => "textured_plate",
        /// Cool plate with tack coating.
        SuperTack => "supertack_plate",
    }
}

config_enum! {
    /// Order in which objects on a plate are printed.
    PrintSequence {
        /// Follow the global setting.
        ByDefault => "by_default",
        /// All objects layer by layer.
        ByLayer => "by_layer",
        /// One object after another.
        ByObject => "by_object",
    }
}

config_enum! {
    /// Nozzle flow class.
    NozzleVolumeType {
        /// Standard flow.
        Standard => "standard",
        /// High flow.
        HighFlow => "high_flow",
    }
}

config_enum! {
    /// Nozzle material, which decides its hardness.
    NozzleType {
        /// Undefined material.
        Undefined => "undefine",
        /// Brass.
        Brass => "brass",
        /// Stainless steel.
        StainlessSteel => "stainless_steel",
        /// Hardened steel.
        HardenedSteel => "hardened_steel",
        /// Tungsten carbide.
        TungstenCarbide => "tungsten_carbide",
    }
}

impl NozzleType {
    /// Rockwell hardness of the nozzle material.
    pub fn hrc(self) -> i64 {
        match self {
            NozzleType::Undefined => 0,
            NozzleType::Brass => 2,
            NozzleType::StainlessSteel => 20,
            NozzleType::HardenedSteel => 55,
            NozzleType::TungstenCarbide => 85,
        }
    }
}

config_enum! {
    /// Brim generation mode.
    BrimType {
        /// Brim width chosen per object.
        AutoBrim => "auto_brim",
        /// Brim only around the outer contour.
        OuterOnly => "outer_only",
        /// No brim.
        NoBrim => "no_brim",
    }
}

config_enum! {
    /// Sparse infill pattern.
    InfillPattern {
        /// Rectilinear grid (alternating 0°/90°).
        Grid => "grid",
        /// Single direction lines (alternating 45°/-45°).
        Line => "line",
        /// Triangular pattern.
        Triangles => "triangles",
        /// Hexagonal honeycomb.
        Honeycomb => "honeycomb",
        /// Gyroid (approximated with lines).
        Gyroid => "gyroid",
    }
}

config_enum! {
    /// Which surfaces receive an ironing pass.
    IroningType {
        /// Ironing disabled.
        NoIroning => "no ironing",
        /// Topmost surface only.
        TopmostOnly => "outer_top",
        /// Every top surface.
        TopSurfaces => "top",
        /// Every solid surface.
        AllSolid => "solid",
    }
}

config_enum! {
    /// Fuzzy skin application.
    FuzzySkinType {
        /// Disabled.
        Disabled => "none",
        /// Outer walls only.
        External => "external",
        /// All walls.
        All => "all",
        /// Only where painted.
        Painted => "painted",
    }
}

config_enum! {
    /// Support generation style.
    SupportType {
        /// Normal support, automatic placement.
        NormalAuto => "normal(auto)",
        /// Tree support, automatic placement.
        TreeAuto => "tree(auto)",
        /// Normal support, enforcers only.
        NormalManual => "normal(manual)",
        /// Tree support, enforcers only.
        TreeManual => "tree(manual)",
    }
}

impl SupportType {
    /// True when supports are placed automatically from overhangs.
    pub fn is_auto(self) -> bool {
        matches!(self, SupportType::NormalAuto | SupportType::TreeAuto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_round_trip() {
        for mode in FilamentMapMode::ALL {
            assert_eq!(mode.as_str().parse::<FilamentMapMode>().unwrap(), *mode);
        }
        assert_eq!(IroningType::NoIroning.to_string(), "no ironing");
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let err = "glass".parse::<BedType>().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnum { enum_name: "BedType", .. }));
    }

    #[test]
    fn test_nozzle_hardness_order() {
        assert!(NozzleType::HardenedSteel.hrc() > NozzleType::Brass.hrc());
        assert!(NozzleType::TungstenCarbide.hrc() > NozzleType::HardenedSteel.hrc());
    }
}
