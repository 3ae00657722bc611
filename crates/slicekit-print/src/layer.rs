//! Layers and the toolpaths they carry.

use serde::{Deserialize, Serialize};
use slicekit_math::{BoundingBox, ExPolygon, ExPolygons, Polyline};

/// Classification of a slice surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurfaceType {
    /// Visible from above.
    Top,
    /// Visible from below.
    Bottom,
    /// Solid shell inside the object.
    InternalSolid,
    /// Sparse interior.
    Internal,
}

impl SurfaceType {
    /// True for surfaces printed at full density.
    pub fn is_solid(self) -> bool {
        !matches!(self, SurfaceType::Internal)
    }
}

/// A classified area of one region on one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Surface {
    /// Classification.
    pub surface_type: SurfaceType,
    /// Covered area.
    pub expolygon: ExPolygon,
}

/// What an extrusion is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtrusionRole {
    /// Outermost wall.
    ExternalPerimeter,
    /// Inner wall.
    Perimeter,
    /// Solid infill inside the object.
    SolidInfill,
    /// Solid infill of a top surface.
    TopSolidInfill,
    /// Solid infill of a bottom surface.
    BottomSurface,
    /// Sparse infill.
    InternalInfill,
    /// Ironing pass over a top surface.
    Ironing,
    /// Support body.
    SupportMaterial,
    /// Support interface.
    SupportMaterialInterface,
    /// Skirt loop.
    Skirt,
    /// Brim loop.
    Brim,
    /// Wipe tower.
    WipeTower,
}

/// A single extrusion along a polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionPath {
    /// Purpose.
    pub role: ExtrusionRole,
    /// Path; a closed loop repeats its first point at the end.
    pub polyline: Polyline,
    /// Line width (mm).
    pub width: f64,
    /// Layer height (mm).
    pub height: f64,
    /// Flow multiplier.
    pub flow: f64,
}

impl ExtrusionPath {
    /// Path with full flow.
    pub fn new(role: ExtrusionRole, polyline: Polyline, width: f64, height: f64) -> Self {
        Self {
            role,
            polyline,
            width,
            height,
            flow: 1.0,
        }
    }

    /// Path length (mm).
    pub fn length(&self) -> f64 {
        self.polyline.length()
    }

    /// Extruded volume per mm of path (mm³/mm).
    pub fn mm3_per_mm(&self) -> f64 {
        self.width * self.height * self.flow
    }

    /// Extruded volume (mm³).
    pub fn volume(&self) -> f64 {
        self.length() * self.mm3_per_mm()
    }
}

/// Ordered group of extrusions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionEntityCollection {
    /// Extrusions in print order.
    pub entities: Vec<ExtrusionPath>,
}

impl ExtrusionEntityCollection {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing is extruded.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Number of extrusions.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Append one extrusion.
    pub fn push(&mut self, path: ExtrusionPath) {
        self.entities.push(path);
    }

    /// Append extrusions.
    pub fn extend(&mut self, paths: impl IntoIterator<Item = ExtrusionPath>) {
        self.entities.extend(paths);
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.entities.clear();
    }

    /// Total path length (mm).
    pub fn total_length(&self) -> f64 {
        self.entities.iter().map(ExtrusionPath::length).sum()
    }

    /// Total extruded volume (mm³).
    pub fn total_volume(&self) -> f64 {
        self.entities.iter().map(ExtrusionPath::volume).sum()
    }

    /// Number of path vertices.
    pub fn num_points(&self) -> usize {
        self.entities.iter().map(|e| e.polyline.len()).sum()
    }

    /// Bounds of every path vertex.
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(self.entities.iter().flat_map(|e| e.polyline.points.iter()))
    }

    /// Drop vertices closer than `tolerance` to the simplified path.
    pub fn simplify(&mut self, tolerance: f64) {
        for e in &mut self.entities {
            if e.polyline.len() > 2 {
                e.polyline = e.polyline.simplify(tolerance);
            }
        }
    }
}

/// One region's share of a layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerRegion {
    /// Index into the object's regions.
    pub region_id: usize,
    /// Sliced area of the region.
    pub slices: ExPolygons,
    /// Area left for infill inside the walls, classified.
    pub fill_surfaces: Vec<Surface>,
    /// Walls.
    pub perimeters: ExtrusionEntityCollection,
    /// Infill.
    pub fills: ExtrusionEntityCollection,
    /// Ironing.
    pub ironings: ExtrusionEntityCollection,
}

impl LayerRegion {
    /// Empty region share.
    pub fn new(region_id: usize) -> Self {
        Self {
            region_id,
            ..Default::default()
        }
    }

    /// Area inside the walls, unclassified.
    pub fn fill_expolygons(&self) -> ExPolygons {
        self.fill_surfaces.iter().map(|s| s.expolygon.clone()).collect()
    }

    /// True when the region extrudes nothing.
    pub fn has_extrusions(&self) -> bool {
        !(self.perimeters.is_empty() && self.fills.is_empty() && self.ironings.is_empty())
    }
}

/// One horizontal slice of an object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Index from the bottom.
    pub id: usize,
    /// Z the meshes were cut at (object coordinates).
    pub slice_z: f64,
    /// Z of the layer top on the plate.
    pub print_z: f64,
    /// Thickness.
    pub height: f64,
    /// Union of every region's slices.
    pub lslices: ExPolygons,
    /// Per-region content, one entry per region present on this layer.
    pub regions: Vec<LayerRegion>,
    /// Overhangs a travel move must lift over.
    pub lift_overhangs: ExPolygons,
}

impl Layer {
    /// Layer without content.
    pub fn new(id: usize, slice_z: f64, print_z: f64, height: f64) -> Self {
        Self {
            id,
            slice_z,
            print_z,
            height,
            ..Default::default()
        }
    }

    /// Z of the layer bottom.
    pub fn bottom_z(&self) -> f64 {
        self.print_z - self.height
    }

    /// True when no region has area.
    pub fn is_empty(&self) -> bool {
        self.lslices.is_empty()
    }

    /// Region share by region index.
    pub fn region(&self, region_id: usize) -> Option<&LayerRegion> {
        self.regions.iter().find(|r| r.region_id == region_id)
    }
}

/// One layer of support or raft.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupportLayer {
    /// Index from the bottom.
    pub id: usize,
    /// Z of the layer top on the plate.
    pub print_z: f64,
    /// Thickness.
    pub height: f64,
    /// Part of the raft.
    pub is_raft: bool,
    /// Supported area.
    pub support_islands: ExPolygons,
    /// Support and raft toolpaths.
    pub support_fills: ExtrusionEntityCollection,
}

impl SupportLayer {
    /// Layer without content.
    pub fn new(id: usize, print_z: f64, height: f64, is_raft: bool) -> Self {
        Self {
            id,
            print_z,
            height,
            is_raft,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use slicekit_math::Point2;

    fn line(len: f64) -> Polyline {
        Polyline::new(vec![Point2::new(0.0, 0.0), Point2::new(len, 0.0)])
    }

    #[test]
    fn test_path_volume() {
        let path = ExtrusionPath::new(ExtrusionRole::Perimeter, line(10.0), 0.4, 0.2);
        assert_relative_eq!(path.volume(), 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_collection_totals() {
        let mut c = ExtrusionEntityCollection::new();
        c.push(ExtrusionPath::new(ExtrusionRole::Perimeter, line(10.0), 0.4, 0.2));
        c.push(ExtrusionPath::new(ExtrusionRole::InternalInfill, line(5.0), 0.4, 0.2));
        assert_eq!(c.len(), 2);
        assert_relative_eq!(c.total_length(), 15.0);
        assert_relative_eq!(c.bounding_box().max.x, 10.0);
    }

    #[test]
    fn test_simplify_drops_collinear_points() {
        let mut c = ExtrusionEntityCollection::new();
        let points = (0..=10).map(|i| Point2::new(i as f64, 0.0)).collect();
        c.push(ExtrusionPath::new(ExtrusionRole::Perimeter, Polyline::new(points), 0.4, 0.2));
        c.simplify(0.01);
        assert_eq!(c.num_points(), 2);
    }

    #[test]
    fn test_layer_bottom() {
        let layer = Layer::new(0, 0.1, 0.2, 0.2);
        assert_relative_eq!(layer.bottom_z(), 0.0);
        assert!(layer.is_empty());
    }
}
