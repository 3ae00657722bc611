//! Error types for the model.

use thiserror::Error;

/// Errors raised by model lookups and loading.
#[derive(Error, Debug)]
pub enum ModelError {
    /// No object at this index.
    #[error("invalid object index {0}")]
    InvalidObject(usize),

    /// No instance at this index.
    #[error("invalid instance {instance} of object {object}")]
    InvalidInstance {
        /// Object index.
        object: usize,
        /// Instance index.
        instance: usize,
    },

    /// Mesh has no triangles.
    #[error("mesh is empty")]
    EmptyMesh,

    /// Project file could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Project file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;
