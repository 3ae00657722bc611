//! Error types for the print pipeline.

use slicekit_config::ConfigError;
use slicekit_model::ObjectId;
use thiserror::Error;

/// Errors raised while applying, validating or processing a print.
///
/// Object-scoped variants carry the [`ObjectId`] of the model object so a
/// caller can point at exactly one failing object.
#[derive(Error, Debug)]
pub enum PrintError {
    /// A step failed for one object.
    #[error("object {object_id}: {message}")]
    Object {
        /// Model object that failed.
        object_id: ObjectId,
        /// What went wrong.
        message: String,
    },

    /// Settings make slicing impossible.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Object the settings belong to, if object-scoped.
        object_id: Option<ObjectId>,
        /// What went wrong.
        message: String,
    },

    /// The whole plate cannot be processed.
    #[error("{0}")]
    Plate(String),

    /// Toolpaths of two objects collide.
    #[error("Found gcode path conflicts between object {object1} and {object2} at height {height:.2}")]
    Conflict {
        /// First object's name.
        object1: String,
        /// Second object's name.
        object2: String,
        /// Print Z of the first colliding layer.
        height: f64,
    },

    /// Filament, nozzle or extruder combination cannot print.
    #[error("{0}")]
    Incompatible(String),

    /// Processing was canceled.
    #[error("canceled")]
    Canceled,

    /// Option lookup failed.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Cached data could not be written.
    #[error("cache error: {0}")]
    Cache(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PrintError {
    /// Object the error is scoped to, if any.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            PrintError::Object { object_id, .. } => Some(*object_id),
            PrintError::InvalidConfig { object_id, .. } => *object_id,
            _ => None,
        }
    }

    /// True for errors that invalidate the whole plate.
    pub fn is_plate_fatal(&self) -> bool {
        self.object_id().is_none() && !matches!(self, PrintError::Canceled)
    }

    pub(crate) fn object(object_id: ObjectId, message: impl Into<String>) -> Self {
        PrintError::Object {
            object_id,
            message: message.into(),
        }
    }
}

/// Non-fatal problem bound to one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintWarning {
    /// Model object the warning is about.
    pub object_id: ObjectId,
    /// Human readable description.
    pub message: String,
}

impl std::fmt::Display for PrintWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "object {}: {}", self.object_id, self.message)
    }
}

/// Result type for print operations.
pub type Result<T> = std::result::Result<T, PrintError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoping() {
        let id = ObjectId::next();
        let err = PrintError::object(id, "no layers");
        assert_eq!(err.object_id(), Some(id));
        assert!(!err.is_plate_fatal());
        assert!(PrintError::Plate("empty".into()).is_plate_fatal());
        assert!(!PrintError::Canceled.is_plate_fatal());
    }

    #[test]
    fn test_conflict_message() {
        let err = PrintError::Conflict {
            object1: "a".into(),
            object2: "b".into(),
            height: 1.0,
        };
        assert!(err
            .to_string()
            .starts_with("Found gcode path conflicts between object a and b"));
    }
}
