//! Indexed triangle meshes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use slicekit_math::{BoundingBox3, Point3, Transform};

/// Indexed triangle mesh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriangleMesh {
    /// Flat array of vertex positions: `[x0, y0, z0, x1, y1, z1, ...]` (f32).
    pub vertices: Vec<f32>,
    /// Flat array of triangle indices: `[i0, i1, i2, ...]` (u32).
    pub indices: Vec<u32>,
}

impl TriangleMesh {
    /// Create an empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Axis-aligned box with its minimum corner at `min`.
    pub fn cuboid(min: Point3, size: [f64; 3]) -> Self {
        let (x0, y0, z0) = (min.x as f32, min.y as f32, min.z as f32);
        let (x1, y1, z1) = (
            (min.x + size[0]) as f32,
            (min.y + size[1]) as f32,
            (min.z + size[2]) as f32,
        );
        let vertices = vec![
            x0, y0, z0, x1, y0, z0, x1, y1, z0, x0, y1, z0, // bottom
            x0, y0, z1, x1, y0, z1, x1, y1, z1, x0, y1, z1, // top
        ];
        let indices = vec![
            0, 2, 1, 0, 3, 2, // bottom
            4, 5, 6, 4, 6, 7, // top
            0, 1, 5, 0, 5, 4, // front
            2, 3, 7, 2, 7, 6, // back
            0, 4, 7, 0, 7, 3, // left
            1, 2, 6, 1, 6, 5, // right
        ];
        Self { vertices, indices }
    }

    /// Number of triangles.
    pub fn num_triangles(&self) -> usize {
        self.indices.len() / 3
    }

    /// Number of vertices.
    pub fn num_vertices(&self) -> usize {
        self.vertices.len() / 3
    }

    /// True if the mesh has no triangles.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty() || self.vertices.is_empty()
    }

    /// Vertex `i` as a point.
    pub fn vertex(&self, i: usize) -> Point3 {
        Point3::new(
            self.vertices[i * 3] as f64,
            self.vertices[i * 3 + 1] as f64,
            self.vertices[i * 3 + 2] as f64,
        )
    }

    /// Iterate vertices.
    pub fn points(&self) -> impl Iterator<Item = Point3> + '_ {
        (0..self.num_vertices()).map(|i| self.vertex(i))
    }

    /// Merge another mesh into this one.
    pub fn merge(&mut self, other: &TriangleMesh) {
        let offset = self.num_vertices() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.indices
            .extend(other.indices.iter().map(|&i| i + offset));
    }

    /// Bounding box of the untransformed vertices.
    pub fn bounding_box(&self) -> BoundingBox3 {
        self.transformed_bounding_box(&Transform::identity())
    }

    /// Bounding box of the vertices after applying `trafo`.
    pub fn transformed_bounding_box(&self, trafo: &Transform) -> BoundingBox3 {
        let mut bb = BoundingBox3::empty();
        for p in self.points() {
            bb.include_point(&trafo.apply_point(&p));
        }
        bb
    }

    /// Hash of the vertex and index buffers.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for v in &self.vertices {
            v.to_bits().hash(&mut hasher);
        }
        self.indices.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cuboid_bounds() {
        let mesh = TriangleMesh::cuboid(Point3::new(1.0, 2.0, 0.0), [10.0, 20.0, 5.0]);
        assert_eq!(mesh.num_triangles(), 12);
        let bb = mesh.bounding_box();
        assert_relative_eq!(bb.min.x, 1.0);
        assert_relative_eq!(bb.max.y, 22.0);
        assert_relative_eq!(bb.max.z, 5.0);
    }

    #[test]
    fn test_transformed_bounds_follow_translation() {
        let mesh = TriangleMesh::cuboid(Point3::origin(), [10.0, 10.0, 10.0]);
        let bb = mesh.transformed_bounding_box(&Transform::translation(5.0, 0.0, -2.0));
        assert_relative_eq!(bb.min.x, 5.0);
        assert_relative_eq!(bb.min.z, -2.0);
    }

    #[test]
    fn test_content_hash_distinguishes_meshes() {
        let a = TriangleMesh::cuboid(Point3::origin(), [10.0, 10.0, 10.0]);
        let b = TriangleMesh::cuboid(Point3::origin(), [10.0, 10.0, 11.0]);
        assert_eq!(a.content_hash(), a.clone().content_hash());
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
