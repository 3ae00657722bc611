//! Filament usage and cost of a processed print.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use slicekit_config::DynamicConfig;
use slicekit_model::ObjectId;

use crate::error::Result;
use crate::layer::{ExtrusionEntityCollection, ExtrusionRole};
use crate::print_object::PrintObject;
use crate::tool_ordering::ToolOrdering;
use crate::wipe_tower::WipeTowerData;

/// Totals over every extrusion of a print.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrintStatistics {
    /// Filament length over all filaments (mm).
    pub total_used_filament: f64,
    /// Extruded volume (mm³).
    pub total_extruded_volume: f64,
    /// Filament cost.
    pub total_cost: f64,
    /// Filament weight (g).
    pub total_weight: f64,
    /// Filament changes.
    pub total_toolchanges: usize,
    /// Filament length purged into the tower (mm).
    pub total_wipe_tower_filament: f64,
    /// Cost of the purged filament.
    pub total_wipe_tower_cost: f64,
    /// Filament loaded at the start.
    pub initial_tool: Option<u32>,
    /// Filament length per 1-based filament (mm).
    pub filament_stats: BTreeMap<u32, f64>,
}

struct FilamentProps {
    diameter: f64,
    density: f64,
    cost_per_kg: f64,
}

impl FilamentProps {
    fn of(config: &DynamicConfig, filament: u32) -> Result<Self> {
        let idx = filament.saturating_sub(1) as usize;
        Ok(Self {
            diameter: config.opt_float_at("filament_diameter", idx)?,
            density: config.opt_float_at("filament_density", idx)?,
            cost_per_kg: config.opt_float_at("filament_cost", idx)?,
        })
    }

    fn cross_section(&self) -> f64 {
        PI * (self.diameter / 2.0).powi(2)
    }

    /// Grams of `volume` mm³.
    fn weight(&self, volume: f64) -> f64 {
        volume * self.density / 1000.0
    }

    fn cost(&self, volume: f64) -> f64 {
        self.weight(volume) / 1000.0 * self.cost_per_kg
    }
}

fn add_collection(volumes: &mut BTreeMap<u32, f64>, filament: u32, paths: &ExtrusionEntityCollection, copies: f64) {
    let volume = paths.total_volume() * copies;
    if volume > 0.0 {
        *volumes.entry(filament).or_default() += volume;
    }
}

/// Extruded volume per 1-based filament, instances counted.
pub fn extruded_volumes(
    objects: &[PrintObject],
    skirt: &ExtrusionEntityCollection,
    brims: &BTreeMap<ObjectId, ExtrusionEntityCollection>,
    first_extruder: u32,
) -> BTreeMap<u32, f64> {
    let mut volumes = BTreeMap::new();
    for object in objects {
        let copies = object.instances().len() as f64;
        if let Some(regions) = object.regions() {
            for layer in object.layers() {
                for lr in &layer.regions {
                    let Some(region) = regions.region(lr.region_id) else {
                        continue;
                    };
                    add_collection(&mut volumes, region.wall_filament(), &lr.perimeters, copies);
                    for path in &lr.fills.entities {
                        let filament = if path.role == ExtrusionRole::InternalInfill {
                            region.sparse_infill_filament()
                        } else {
                            region.solid_infill_filament()
                        };
                        *volumes.entry(filament).or_default() += path.volume() * copies;
                    }
                    add_collection(&mut volumes, region.solid_infill_filament(), &lr.ironings, copies);
                }
            }
        }
        let filament_of = |key: &str| match object.config().opt_int(key).unwrap_or(0) {
            f if f > 0 => f as u32,
            _ => first_extruder,
        };
        let support = filament_of("support_filament");
        let interface = filament_of("support_interface_filament");
        for layer in object.support_layers() {
            for path in &layer.support_fills.entities {
                let filament = if path.role == ExtrusionRole::SupportMaterialInterface {
                    interface
                } else {
                    support
                };
                *volumes.entry(filament).or_default() += path.volume() * copies;
            }
        }
    }
    add_collection(&mut volumes, first_extruder, skirt, 1.0);
    for brim in brims.values() {
        add_collection(&mut volumes, first_extruder, brim, 1.0);
    }
    volumes
}

impl PrintStatistics {
    /// Totals for the given toolpaths.
    pub fn compute(
        objects: &[PrintObject],
        skirt: &ExtrusionEntityCollection,
        brims: &BTreeMap<ObjectId, ExtrusionEntityCollection>,
        wipe_tower: Option<&WipeTowerData>,
        ordering: &ToolOrdering,
        config: &DynamicConfig,
    ) -> Result<Self> {
        let first = ordering.first_extruder().unwrap_or(1);
        let mut stats = PrintStatistics {
            initial_tool: ordering.first_extruder(),
            total_toolchanges: ordering.number_of_toolchanges(),
            ..Default::default()
        };
        for (filament, volume) in extruded_volumes(objects, skirt, brims, first) {
            let props = FilamentProps::of(config, filament)?;
            let length = volume / props.cross_section();
            stats.total_extruded_volume += volume;
            stats.total_used_filament += length;
            stats.total_weight += props.weight(volume);
            stats.total_cost += props.cost(volume);
            *stats.filament_stats.entry(filament).or_default() += length;
        }
        if let Some(tower) = wipe_tower {
            for (&filament, &length) in &tower.used_filament {
                let props = FilamentProps::of(config, filament)?;
                let volume = length * props.cross_section();
                stats.total_wipe_tower_filament += length;
                stats.total_wipe_tower_cost += props.cost(volume);
                stats.total_used_filament += length;
                stats.total_extruded_volume += volume;
                stats.total_weight += props.weight(volume);
                stats.total_cost += props.cost(volume);
                *stats.filament_stats.entry(filament).or_default() += length;
            }
        }
        Ok(stats)
    }

    /// Reset every total.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::ExtrusionPath;
    use approx::assert_relative_eq;
    use slicekit_math::{Point2, Polyline};

    fn line(length: f64) -> ExtrusionPath {
        ExtrusionPath::new(
            ExtrusionRole::Skirt,
            Polyline::new(vec![Point2::new(0.0, 0.0), Point2::new(length, 0.0)]),
            0.5,
            0.2,
        )
    }

    #[test]
    fn test_skirt_volume_goes_to_first_extruder() {
        let mut skirt = ExtrusionEntityCollection::new();
        skirt.push(line(100.0));
        let volumes = extruded_volumes(&[], &skirt, &BTreeMap::new(), 2);
        assert_relative_eq!(volumes[&2], 10.0);
    }

    #[test]
    fn test_weight_and_cost() {
        let mut skirt = ExtrusionEntityCollection::new();
        skirt.push(line(1000.0));
        let config = DynamicConfig::defaults();
        let stats = PrintStatistics::compute(&[], &skirt, &BTreeMap::new(), None, &ToolOrdering::default(), &config)
            .unwrap();
        assert_relative_eq!(stats.total_extruded_volume, 100.0);
        // 100 mm³ of PLA at 1.24 g/cm³
        assert_relative_eq!(stats.total_weight, 0.124, epsilon = 1e-9);
        assert_relative_eq!(stats.total_cost, 0.124 / 1000.0 * 20.0, epsilon = 1e-9);
        let area = PI * 0.875 * 0.875;
        assert_relative_eq!(stats.filament_stats[&1], 100.0 / area, epsilon = 1e-9);
        assert_eq!(stats.initial_tool, None);
    }

    #[test]
    fn test_tower_purge_counts() {
        let config = DynamicConfig::defaults();
        let mut tower = WipeTowerData::default();
        tower.used_filament.insert(1, 50.0);
        let stats = PrintStatistics::compute(
            &[],
            &ExtrusionEntityCollection::new(),
            &BTreeMap::new(),
            Some(&tower),
            &ToolOrdering::default(),
            &config,
        )
        .unwrap();
        assert_relative_eq!(stats.total_wipe_tower_filament, 50.0);
        assert_relative_eq!(stats.total_used_filament, 50.0);
        assert!(stats.total_wipe_tower_cost > 0.0);
    }
}
