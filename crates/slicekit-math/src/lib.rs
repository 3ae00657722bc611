#![warn(missing_docs)]

//! Math and 2D geometry types for the slicekit print pipeline.
//!
//! Thin wrappers around nalgebra for points, vectors and transforms, plus
//! the planar primitives the slicing pipeline works on: polygons,
//! polylines, polygons with holes, bounding boxes and polygon booleans.
//!
//! All coordinates are millimetres in `f64`.

use nalgebra::{Matrix4, Vector2, Vector3, Vector4};
use serde::{Deserialize, Serialize};

pub mod bbox;
pub mod clip;
pub mod polygon;

pub use bbox::{BoundingBox, BoundingBox3};
pub use clip::{
    area_ex, convex_hull, diff_ex, intersection_ex, offset_ex, overlaps, union_ex,
};
pub use polygon::{point_in_polygon, ExPolygon, ExPolygons, Polygon, Polyline};

/// A point in 3D space.
pub type Point3 = nalgebra::Point3<f64>;

/// A vector in 3D space.
pub type Vec3 = Vector3<f64>;

/// A point in the XY plane.
pub type Point2 = nalgebra::Point2<f64>;

/// A vector in the XY plane.
pub type Vec2 = Vector2<f64>;

/// Distance below which two coordinates are considered equal (mm).
pub const EPSILON: f64 = 1e-4;

/// A 4x4 affine transformation matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// The underlying 4x4 matrix.
    pub matrix: Matrix4<f64>,
}

impl Transform {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    /// Translation by `(dx, dy, dz)`.
    pub fn translation(dx: f64, dy: f64, dz: f64) -> Self {
        let mut m = Matrix4::identity();
        m[(0, 3)] = dx;
        m[(1, 3)] = dy;
        m[(2, 3)] = dz;
        Self { matrix: m }
    }

    /// Non-uniform scale by `(sx, sy, sz)`.
    pub fn scale(sx: f64, sy: f64, sz: f64) -> Self {
        let mut m = Matrix4::identity();
        m[(0, 0)] = sx;
        m[(1, 1)] = sy;
        m[(2, 2)] = sz;
        Self { matrix: m }
    }

    /// Rotation about the X axis by `angle` radians.
    pub fn rotation_x(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        let mut m = Matrix4::identity();
        m[(1, 1)] = c;
        m[(1, 2)] = -s;
        m[(2, 1)] = s;
        m[(2, 2)] = c;
        Self { matrix: m }
    }

    /// Rotation about the Y axis by `angle` radians.
    pub fn rotation_y(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        let mut m = Matrix4::identity();
        m[(0, 0)] = c;
        m[(0, 2)] = s;
        m[(2, 0)] = -s;
        m[(2, 2)] = c;
        Self { matrix: m }
    }

    /// Rotation about the Z axis by `angle` radians.
    pub fn rotation_z(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        let mut m = Matrix4::identity();
        m[(0, 0)] = c;
        m[(0, 1)] = -s;
        m[(1, 0)] = s;
        m[(1, 1)] = c;
        Self { matrix: m }
    }

    /// Compose `offset * Rz * Ry * Rx * scale`, the order used for model instances.
    pub fn from_parts(offset: &Vec3, rotation: &Vec3, scale: &Vec3) -> Self {
        Self::translation(offset.x, offset.y, offset.z)
            .then(&Self::rotation_z(rotation.z))
            .then(&Self::rotation_y(rotation.y))
            .then(&Self::rotation_x(rotation.x))
            .then(&Self::scale(scale.x, scale.y, scale.z))
    }

    /// Compose: `self` then `other` (self * other).
    pub fn then(&self, other: &Transform) -> Self {
        Self {
            matrix: self.matrix * other.matrix,
        }
    }

    /// Transform a point.
    pub fn apply_point(&self, p: &Point3) -> Point3 {
        let v = self.matrix * Vector4::new(p.x, p.y, p.z, 1.0);
        Point3::new(v.x, v.y, v.z)
    }

    /// Transform a direction vector (ignores translation).
    pub fn apply_vec(&self, v: &Vec3) -> Vec3 {
        let r = self.matrix * Vector4::new(v.x, v.y, v.z, 0.0);
        Vec3::new(r.x, r.y, r.z)
    }

    /// The translation column.
    pub fn translation_part(&self) -> Vec3 {
        Vec3::new(
            self.matrix[(0, 3)],
            self.matrix[(1, 3)],
            self.matrix[(2, 3)],
        )
    }

    /// Copy of this transform with the translation removed.
    pub fn without_translation(&self) -> Self {
        let mut matrix = self.matrix;
        matrix[(0, 3)] = 0.0;
        matrix[(1, 3)] = 0.0;
        matrix[(2, 3)] = 0.0;
        Self { matrix }
    }

    /// Compare the linear (rotation/scale) parts within `tol`.
    pub fn linear_eq(&self, other: &Transform, tol: f64) -> bool {
        (0..3).all(|r| (0..3).all(|c| (self.matrix[(r, c)] - other.matrix[(r, c)]).abs() <= tol))
    }

    /// Inverse of this transform, if it exists.
    pub fn inverse(&self) -> Option<Self> {
        self.matrix.try_inverse().map(|matrix| Self { matrix })
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}
