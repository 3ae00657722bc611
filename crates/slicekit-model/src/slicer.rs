//! Mesh slicing: intersect a triangle mesh with horizontal planes.
//!
//! The print pipeline consumes slicing through [`MeshSlicer`], so a host can
//! plug in its own slicer. [`PlanarSlicer`] is the built-in implementation.

use rayon::prelude::*;
use slicekit_math::{ExPolygon, ExPolygons, Point2, Polygon, Transform};

use crate::mesh::TriangleMesh;

/// Produces one set of polygons per requested Z.
pub trait MeshSlicer: Send + Sync {
    /// Slice `mesh`, placed by `trafo`, at every height in `zs`.
    ///
    /// The result has exactly `zs.len()` entries, in the order of `zs`.
    fn slice(&self, mesh: &TriangleMesh, trafo: &Transform, zs: &[f64]) -> Vec<ExPolygons>;
}

/// Plane/triangle intersection slicer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanarSlicer;

impl MeshSlicer for PlanarSlicer {
    fn slice(&self, mesh: &TriangleMesh, trafo: &Transform, zs: &[f64]) -> Vec<ExPolygons> {
        if mesh.is_empty() {
            return vec![Vec::new(); zs.len()];
        }
        let triangles = extract_triangles(mesh, trafo);
        zs.par_iter()
            .map(|&z| organize_contours(slice_at_z(&triangles, z)))
            .collect()
    }
}

/// A triangle with its vertices and bounding Z range.
#[derive(Debug, Clone, Copy)]
struct Triangle {
    v: [[f64; 3]; 3],
    z_min: f64,
    z_max: f64,
}

fn extract_triangles(mesh: &TriangleMesh, trafo: &Transform) -> Vec<Triangle> {
    let points: Vec<[f64; 3]> = mesh
        .points()
        .map(|p| {
            let q = trafo.apply_point(&p);
            [q.x, q.y, q.z]
        })
        .collect();

    mesh.indices
        .chunks_exact(3)
        .filter_map(|tri| {
            let v = [
                *points.get(tri[0] as usize)?,
                *points.get(tri[1] as usize)?,
                *points.get(tri[2] as usize)?,
            ];
            let z_min = v[0][2].min(v[1][2]).min(v[2][2]);
            let z_max = v[0][2].max(v[1][2]).max(v[2][2]);
            Some(Triangle { v, z_min, z_max })
        })
        .collect()
}

fn slice_at_z(triangles: &[Triangle], z: f64) -> Vec<Polygon> {
    let segments: Vec<([f64; 2], [f64; 2])> = triangles
        .iter()
        .filter(|t| t.z_min <= z && t.z_max >= z)
        .filter_map(|t| triangle_plane_intersection(t, z))
        .collect();
    chain_segments(segments)
}

/// Intersect a triangle with the plane at `z`, projected to XY.
fn triangle_plane_intersection(tri: &Triangle, z: f64) -> Option<([f64; 2], [f64; 2])> {
    let eps = 1e-10;
    let d = [tri.v[0][2] - z, tri.v[1][2] - z, tri.v[2][2] - z];

    if d.iter().all(|&x| x > eps) || d.iter().all(|&x| x < -eps) {
        return None;
    }

    let mut points: Vec<[f64; 2]> = Vec::with_capacity(3);
    for i in 0..3 {
        let j = (i + 1) % 3;
        let (va, vb, da, db) = (tri.v[i], tri.v[j], d[i], d[j]);
        if (da > eps && db < -eps) || (da < -eps && db > eps) {
            let t = da / (da - db);
            points.push([va[0] + t * (vb[0] - va[0]), va[1] + t * (vb[1] - va[1])]);
        } else if da.abs() <= eps && db.abs() > eps {
            points.push([va[0], va[1]]);
        } else if db.abs() <= eps && da.abs() > eps {
            points.push([vb[0], vb[1]]);
        }
    }

    points.dedup_by(|a, b| {
        let dx = a[0] - b[0];
        let dy = a[1] - b[1];
        dx * dx + dy * dy < eps * eps
    });

    if points.len() >= 2 {
        Some((points[0], points[1]))
    } else {
        None
    }
}

/// Chain line segments into closed loops.
fn chain_segments(segments: Vec<([f64; 2], [f64; 2])>) -> Vec<Polygon> {
    let eps = 1e-6;
    let mut remaining = segments;
    let mut loops = Vec::new();

    while let Some((start, end)) = remaining.pop() {
        let mut chain = vec![Point2::new(start[0], start[1]), Point2::new(end[0], end[1])];

        let mut changed = true;
        while changed {
            changed = false;
            let (Some(&head), Some(&tail)) = (chain.first(), chain.last()) else {
                break;
            };
            let mut i = 0;
            while i < remaining.len() {
                let (a, b) = remaining[i];
                let pa = Point2::new(a[0], a[1]);
                let pb = Point2::new(b[0], b[1]);
                if (pa - tail).norm() < eps {
                    chain.push(pb);
                } else if (pb - tail).norm() < eps {
                    chain.push(pa);
                } else if (pb - head).norm() < eps {
                    chain.insert(0, pa);
                } else if (pa - head).norm() < eps {
                    chain.insert(0, pb);
                } else {
                    i += 1;
                    continue;
                }
                remaining.swap_remove(i);
                changed = true;
                break;
            }
        }

        if let (Some(first), Some(last)) = (chain.first(), chain.last()) {
            if (first - last).norm() < eps {
                chain.pop();
            }
        }
        if chain.len() >= 3 {
            loops.push(Polygon::new(chain));
        }
    }
    loops
}

/// Nest closed loops into polygons with holes by containment depth.
///
/// Loops at even depth are contours, loops at odd depth are holes of the
/// smallest contour enclosing them. Triangle winding is not trusted.
fn organize_contours(mut loops: Vec<Polygon>) -> ExPolygons {
    loops.retain(|l| l.area() > 1e-9);
    loops.sort_by(|a, b| b.area().total_cmp(&a.area()));

    // parent[i] = index of the smallest larger loop containing loop i.
    let mut parent: Vec<Option<usize>> = vec![None; loops.len()];
    let mut depth = vec![0usize; loops.len()];
    for i in 0..loops.len() {
        let probe = loops[i].points[0];
        for j in (0..i).rev() {
            if loops[j].contains_point(&probe) {
                parent[i] = Some(j);
                depth[i] = depth[j] + 1;
                break;
            }
        }
    }

    let mut out: Vec<ExPolygon> = Vec::new();
    let mut expoly_of: Vec<Option<usize>> = vec![None; loops.len()];
    for i in 0..loops.len() {
        if depth[i] % 2 == 0 {
            expoly_of[i] = Some(out.len());
            out.push(ExPolygon::new(loops[i].clone()));
        } else if let Some(idx) = parent[i].and_then(|p| expoly_of[p]) {
            let mut hole = loops[i].clone();
            hole.ensure_cw();
            out[idx].holes.push(hole);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use slicekit_math::{area_ex, Point3};

    #[test]
    fn test_slice_cube() {
        let mesh = TriangleMesh::cuboid(Point3::origin(), [10.0, 10.0, 10.0]);
        let layers = PlanarSlicer.slice(&mesh, &Transform::identity(), &[0.1, 5.0, 9.9]);
        assert_eq!(layers.len(), 3);
        for layer in &layers {
            assert_eq!(layer.len(), 1);
            assert_relative_eq!(area_ex(layer), 100.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_slice_above_mesh_is_empty() {
        let mesh = TriangleMesh::cuboid(Point3::origin(), [10.0, 10.0, 10.0]);
        let layers = PlanarSlicer.slice(&mesh, &Transform::identity(), &[12.0]);
        assert!(layers[0].is_empty());
    }

    #[test]
    fn test_slice_applies_transform() {
        let mesh = TriangleMesh::cuboid(Point3::origin(), [10.0, 10.0, 10.0]);
        let layers = PlanarSlicer.slice(&mesh, &Transform::translation(20.0, 0.0, 0.0), &[5.0]);
        let bb = layers[0][0].bounding_box();
        assert_relative_eq!(bb.min.x, 20.0, epsilon = 1e-6);
    }

    #[test]
    fn test_nested_loops_become_holes() {
        let outer = Polygon::rectangle(Point2::new(0.0, 0.0), Point2::new(10.0, 10.0));
        let inner = Polygon::rectangle(Point2::new(3.0, 3.0), Point2::new(7.0, 7.0));
        let island = Polygon::rectangle(Point2::new(4.0, 4.0), Point2::new(6.0, 6.0));
        let expolys = organize_contours(vec![inner, island, outer]);
        assert_eq!(expolys.len(), 2);
        assert_eq!(expolys[0].holes.len(), 1);
        assert_relative_eq!(area_ex(&expolys), 100.0 - 16.0 + 4.0, epsilon = 1e-9);
    }
}
