//! Error types for plate operations.

use slicekit_config::ConfigError;
use slicekit_model::{ModelError, ObjectId};
use slicekit_print::PrintError;
use thiserror::Error;

/// Errors raised by [`PartPlate`](crate::PartPlate) and
/// [`PartPlateList`](crate::PartPlateList).
#[derive(Error, Debug)]
pub enum PlateError {
    /// The `(object, instance)` pair does not exist in the model.
    #[error("invalid instance: object {object} instance {instance}")]
    InvalidInstance {
        /// Object index in the model.
        object: usize,
        /// Instance index in the object.
        instance: usize,
    },

    /// The instance is not assigned to the plate.
    #[error("object {object} instance {instance} is not on this plate")]
    InstanceNotFound {
        /// Object index in the model.
        object: usize,
        /// Instance index in the object.
        instance: usize,
    },

    /// No plate with this index.
    #[error("no plate with index {0}")]
    PlateIndex(usize),

    /// No print with this print index.
    #[error("no print with index {0}")]
    PrintIndex(usize),

    /// Plate limit reached.
    #[error("at most {0} plates are supported")]
    TooManyPlates(usize),

    /// The only remaining plate cannot be deleted.
    #[error("the last plate can not be deleted")]
    LastPlate,

    /// Some instance protrudes from the printable area.
    #[error("plate {0} has objects outside the printable area")]
    NotReady(usize),

    /// Filament, nozzle or extruder combination cannot print.
    #[error("{0}")]
    Incompatible(String),

    /// Nothing on the plate can be printed.
    #[error("plate {0} has no printable instances")]
    NoPrintableInstances(usize),

    /// The print pipeline of a plate failed.
    #[error("plate {plate_index}: {source}")]
    Print {
        /// Plate whose print failed.
        plate_index: usize,
        /// Pipeline error.
        #[source]
        source: PrintError,
    },

    /// Model lookup failed.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Option lookup failed.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl PlateError {
    /// Plate the error belongs to, when known.
    pub fn plate_index(&self) -> Option<usize> {
        match self {
            PlateError::PlateIndex(i) | PlateError::NotReady(i) | PlateError::NoPrintableInstances(i) => Some(*i),
            PlateError::Print { plate_index, .. } => Some(*plate_index),
            _ => None,
        }
    }

    /// Model object the error is bound to, for object-scoped pipeline errors.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            PlateError::Print { source, .. } => source.object_id(),
            _ => None,
        }
    }
}

/// Result type for plate operations.
pub type Result<T> = std::result::Result<T, PlateError>;
