#![warn(missing_docs)]

//! Model description consumed by the slicekit print pipeline.
//!
//! A [`Model`] holds [`ModelObject`]s; each object is a list of
//! [`ModelVolume`]s (printable parts, negative volumes, modifiers, support
//! enforcers and blockers) placed on the bed by one or more
//! [`ModelInstance`]s. Meshes are turned into per-layer polygons by a
//! [`MeshSlicer`].
//!
//! # Example
//!
//! ```ignore
//! use slicekit_model::{Model, ModelInstance, ModelObject, ModelVolume, TriangleMesh};
//!
//! let mut object = ModelObject::new("cube");
//! object.add_volume(ModelVolume::new("part", TriangleMesh::cuboid(origin, [20.0, 20.0, 20.0])));
//! object.add_instance(ModelInstance::new(Vec3::new(100.0, 100.0, 0.0)));
//!
//! let mut model = Model::new();
//! model.add_object(object);
//! ```

pub mod error;
pub mod mesh;
pub mod model;
pub mod slicer;

pub use error::{ModelError, Result};
pub use mesh::TriangleMesh;
pub use model::{
    LayerConfigRange, Model, ModelInstance, ModelObject, ModelVolume, ModelVolumeType, ObjectId,
    PaintedPatch,
};
pub use slicer::{MeshSlicer, PlanarSlicer};
