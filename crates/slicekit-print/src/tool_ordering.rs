//! Filament sequence per layer across every object of a print.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use slicekit_math::EPSILON;

use crate::layer::{ExtrusionRole, LayerRegion};
use crate::print_object::PrintObject;
use crate::region::PrintObjectRegions;

/// Filaments printed on one layer, in print order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LayerTools {
    /// Z of the layer top.
    pub print_z: f64,
    /// 1-based filaments, in the order they are printed.
    pub extruders: Vec<u32>,
    /// Some object extrudes on this layer.
    pub has_object: bool,
    /// Some support extrudes on this layer.
    pub has_support: bool,
}

/// Filament changes of a whole print.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolOrdering {
    layer_tools: Vec<LayerTools>,
    all_printing_extruders: Vec<u32>,
    first_printing_extruder: Option<u32>,
    last_printing_extruder: Option<u32>,
    toolchanges: usize,
}

impl ToolOrdering {
    /// Order filaments for `objects`. Layer-by-layer prints merge layers of
    /// equal height across objects; sequential prints keep objects apart.
    pub fn new(objects: &[PrintObject], sequential: bool) -> Self {
        let mut layer_tools: Vec<LayerTools> = Vec::new();
        if sequential {
            for object in objects {
                let mut own = Vec::new();
                collect_object(object, &mut own);
                layer_tools.extend(own);
            }
        } else {
            for object in objects {
                collect_object(object, &mut layer_tools);
            }
        }
        layer_tools.retain(|lt| !lt.extruders.is_empty());

        let mut ordering = ToolOrdering {
            layer_tools,
            ..Default::default()
        };
        ordering.reorder_extruders();
        ordering
    }

    /// Start every layer with the filament the layer below ended with.
    fn reorder_extruders(&mut self) {
        let mut last: Option<u32> = None;
        let mut all = BTreeSet::new();
        let mut changes = 0;
        for lt in &mut self.layer_tools {
            lt.extruders.sort_unstable();
            lt.extruders.dedup();
            if let Some(prev) = last {
                if let Some(pos) = lt.extruders.iter().position(|&e| e == prev) {
                    lt.extruders[..=pos].rotate_right(1);
                }
            }
            for &e in &lt.extruders {
                if last.is_some_and(|l| l != e) {
                    changes += 1;
                }
                last = Some(e);
                all.insert(e);
            }
        }
        self.first_printing_extruder = self.layer_tools.iter().find_map(|lt| lt.extruders.first().copied());
        self.last_printing_extruder = last;
        self.all_printing_extruders = all.into_iter().collect();
        self.toolchanges = changes;
    }

    /// Layers with at least one extrusion, bottom first.
    pub fn layer_tools(&self) -> &[LayerTools] {
        &self.layer_tools
    }

    /// Tools of the layer topping out at `print_z`.
    pub fn tools_for_layer(&self, print_z: f64) -> Option<&LayerTools> {
        self.layer_tools
            .iter()
            .find(|lt| (lt.print_z - print_z).abs() < EPSILON)
    }

    /// True when nothing is printed.
    pub fn is_empty(&self) -> bool {
        self.layer_tools.is_empty()
    }

    /// Every filament printed, ascending.
    pub fn all_extruders(&self) -> &[u32] {
        &self.all_printing_extruders
    }

    /// Filament of the first extrusion.
    pub fn first_extruder(&self) -> Option<u32> {
        self.first_printing_extruder
    }

    /// Filament of the last extrusion.
    pub fn last_extruder(&self) -> Option<u32> {
        self.last_printing_extruder
    }

    /// Filament changes over the whole print.
    pub fn number_of_toolchanges(&self) -> usize {
        self.toolchanges
    }
}

fn layer_at<'a>(layers: &'a mut Vec<LayerTools>, print_z: f64) -> &'a mut LayerTools {
    let idx = layers.partition_point(|lt| lt.print_z < print_z - EPSILON);
    let found = layers
        .get(idx)
        .is_some_and(|lt| (lt.print_z - print_z).abs() < EPSILON);
    if !found {
        layers.insert(
            idx,
            LayerTools {
                print_z,
                ..Default::default()
            },
        );
    }
    &mut layers[idx]
}

fn collect_object(object: &PrintObject, layers: &mut Vec<LayerTools>) {
    let Some(regions) = object.regions() else {
        return;
    };
    for layer in object.layers() {
        let used: Vec<u32> = layer
            .regions
            .iter()
            .flat_map(|r| region_filaments(regions, r))
            .collect();
        if used.is_empty() {
            continue;
        }
        let lt = layer_at(layers, layer.print_z);
        lt.has_object = true;
        lt.extruders.extend(used);
    }

    let support = object.config().opt_int("support_filament").unwrap_or(0);
    let interface = object.config().opt_int("support_interface_filament").unwrap_or(0);
    for layer in object.support_layers() {
        if layer.support_fills.is_empty() {
            continue;
        }
        let lt = layer_at(layers, layer.print_z);
        lt.has_support = true;
        for (role, filament) in [
            (ExtrusionRole::SupportMaterial, support),
            (ExtrusionRole::SupportMaterialInterface, interface),
        ] {
            // 0 prints with whatever is loaded.
            if filament > 0 && layer.support_fills.entities.iter().any(|p| p.role == role) {
                lt.extruders.push(filament as u32);
            }
        }
    }
}

/// Filaments a layer region actually extrudes with.
pub(crate) fn region_filaments(regions: &PrintObjectRegions, layer_region: &LayerRegion) -> Vec<u32> {
    let Some(region) = regions.region(layer_region.region_id) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    if !layer_region.perimeters.is_empty() {
        out.push(region.wall_filament());
    }
    for path in &layer_region.fills.entities {
        let filament = match path.role {
            ExtrusionRole::InternalInfill => region.sparse_infill_filament(),
            _ => region.solid_infill_filament(),
        };
        if !out.contains(&filament) {
            out.push(filament);
        }
    }
    if !layer_region.ironings.is_empty() && !out.contains(&region.solid_infill_filament()) {
        out.push(region.solid_infill_filament());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lt(print_z: f64, extruders: &[u32]) -> LayerTools {
        LayerTools {
            print_z,
            extruders: extruders.to_vec(),
            has_object: true,
            has_support: false,
        }
    }

    #[test]
    fn test_layer_keeps_previous_extruder_first() {
        let mut ordering = ToolOrdering {
            layer_tools: vec![lt(0.2, &[1, 2]), lt(0.4, &[1, 2]), lt(0.6, &[1])],
            ..Default::default()
        };
        ordering.reorder_extruders();
        assert_eq!(ordering.layer_tools()[1].extruders, vec![2, 1]);
        // 1->2, (2 stays), 2->1, (1 stays)
        assert_eq!(ordering.number_of_toolchanges(), 2);
        assert_eq!(ordering.first_extruder(), Some(1));
        assert_eq!(ordering.last_extruder(), Some(1));
        assert_eq!(ordering.all_extruders(), &[1, 2]);
    }

    #[test]
    fn test_layer_lookup_merges_close_heights() {
        let mut layers = Vec::new();
        layer_at(&mut layers, 0.4).extruders.push(1);
        layer_at(&mut layers, 0.2).extruders.push(2);
        layer_at(&mut layers, 0.4 + 1e-6).extruders.push(3);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[1].extruders, vec![1, 3]);
    }

    #[test]
    fn test_single_filament_has_no_changes() {
        let mut ordering = ToolOrdering {
            layer_tools: vec![lt(0.2, &[1, 1]), lt(0.4, &[1])],
            ..Default::default()
        };
        ordering.reorder_extruders();
        assert_eq!(ordering.number_of_toolchanges(), 0);
        assert_eq!(ordering.tools_for_layer(0.4).map(|l| l.extruders.len()), Some(1));
    }
}
