//! Error types for configuration access.

use thiserror::Error;

/// Errors raised while reading or loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The key is not present.
    #[error("missing config key: {0}")]
    MissingKey(String),

    /// The key holds a value of another type.
    #[error("config key {key} is not a {expected}")]
    TypeMismatch {
        /// Offending key.
        key: String,
        /// Expected value type.
        expected: &'static str,
    },

    /// A string does not name a variant of the enum.
    #[error("invalid value {value:?} for {enum_name}")]
    InvalidEnum {
        /// Enum type name.
        enum_name: &'static str,
        /// Rejected value.
        value: String,
    },

    /// Unsupported config file extension.
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// TOML parse failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parse failure.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// File access failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
