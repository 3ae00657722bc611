#![warn(missing_docs)]

//! Print configuration store for slicekit.
//!
//! Options live in a flat, ordered key/value map ([`DynamicConfig`]) that
//! can be layered (`apply`), compared (`diff`) and read through typed
//! getters. Enum-valued options have typed views in [`enums`].
//!
//! # Example
//!
//! ```ignore
//! use slicekit_config::{DynamicConfig, PrinterProfile};
//!
//! let mut config = DynamicConfig::defaults();
//! PrinterProfile::bambu_x1c().apply_to(&mut config);
//! config.apply(&DynamicConfig::load("overrides.toml")?);
//!
//! let layer_height = config.opt_float("layer_height")?;
//! ```

pub mod defaults;
pub mod enums;
pub mod error;
pub mod printer;
pub mod value;

pub use defaults::{
    is_object_key, is_print_key, is_region_key, key_scope, KeyScope, OBJECT_KEYS, REGION_KEYS,
    VOLUME_EXTRUDER_KEY,
};
pub use enums::{
    BedType, BrimType, FilamentMapMode, FuzzySkinType, InfillPattern, IroningType, NozzleType,
    NozzleVolumeType, PrintSequence, SupportType,
};
pub use error::{ConfigError, Result};
pub use printer::PrinterProfile;
pub use value::{ConfigValue, DynamicConfig};
