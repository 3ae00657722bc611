//! Hand-off of finished toolpaths to a G-code backend.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::layer::{ExtrusionEntityCollection, ExtrusionPath, ExtrusionRole};
use crate::print::Print;

/// What a backend reports after writing a file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GCodeProcessorResult {
    /// File written.
    pub filename: PathBuf,
    /// Estimated print time (s).
    pub print_time_seconds: f64,
    /// Filament length per 1-based filament (mm), index 0 is filament 1.
    pub filament_used_mm: Vec<f64>,
    /// Printed layers.
    pub layer_count: usize,
    /// Filament changes.
    pub toolchanges: usize,
}

/// Turns a processed [`Print`] into a machine file.
pub trait GCodeExporter: Send + Sync {
    /// Write `print` to `path`.
    fn export(&self, print: &Print, path: &Path) -> Result<GCodeProcessorResult>;
}

#[derive(Serialize)]
struct DumpLayer<'a> {
    print_z: f64,
    paths: Vec<&'a ExtrusionPath>,
}

#[derive(Serialize)]
struct Dump<'a> {
    layers: Vec<DumpLayer<'a>>,
    statistics: &'a crate::statistics::PrintStatistics,
}

/// Writes every toolpath of a print as JSON layers.
///
/// Paths stay in the object frame and are listed once per print object.
/// Times come from the configured wall and infill speeds without
/// acceleration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolpathDumpExporter;

impl ToolpathDumpExporter {
    fn collect<'a>(print: &'a Print) -> Vec<DumpLayer<'a>> {
        let mut layers: Vec<DumpLayer<'a>> = Vec::new();
        let mut push = |z: f64, paths: &'a ExtrusionEntityCollection| {
            if paths.is_empty() {
                return;
            }
            let idx = layers.partition_point(|l| l.print_z < z - slicekit_math::EPSILON);
            match layers.get_mut(idx) {
                Some(l) if (l.print_z - z).abs() < slicekit_math::EPSILON => l.paths.extend(&paths.entities),
                _ => layers.insert(
                    idx,
                    DumpLayer {
                        print_z: z,
                        paths: paths.entities.iter().collect(),
                    },
                ),
            }
        };
        let first_z = print
            .objects()
            .iter()
            .filter_map(|o| o.layers().first().map(|l| l.print_z))
            .fold(f64::INFINITY, f64::min);
        if first_z.is_finite() {
            push(first_z, print.skirt());
            for brim in print.brim().values() {
                push(first_z, brim);
            }
        }
        for object in print.objects() {
            for layer in object.layers() {
                for region in &layer.regions {
                    push(layer.print_z, &region.perimeters);
                    push(layer.print_z, &region.fills);
                    push(layer.print_z, &region.ironings);
                }
            }
            for layer in object.support_layers() {
                push(layer.print_z, &layer.support_fills);
            }
        }
        layers
    }
}

fn path_speed(print: &Print, role: ExtrusionRole) -> f64 {
    let key = match role {
        ExtrusionRole::ExternalPerimeter | ExtrusionRole::Skirt | ExtrusionRole::Brim => "outer_wall_speed",
        ExtrusionRole::Perimeter => "inner_wall_speed",
        _ => "sparse_infill_speed",
    };
    print.config().opt_float(key).unwrap_or(100.0).max(1.0)
}

impl GCodeExporter for ToolpathDumpExporter {
    fn export(&self, print: &Print, path: &Path) -> Result<GCodeProcessorResult> {
        let layers = Self::collect(print);
        let mut seconds = 0.0;
        for layer in &layers {
            for p in &layer.paths {
                seconds += p.length() / path_speed(print, p.role);
            }
        }

        let stats = print.print_statistics();
        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(
            &mut writer,
            &Dump {
                layers,
                statistics: stats,
            },
        )?;
        writer.flush()?;

        let max_filament = stats.filament_stats.keys().copied().max().unwrap_or(0) as usize;
        let mut filament_used_mm = vec![0.0; max_filament];
        for (&filament, &length) in &stats.filament_stats {
            if let Some(slot) = (filament as usize).checked_sub(1).and_then(|i| filament_used_mm.get_mut(i)) {
                *slot = length;
            }
        }
        let result = GCodeProcessorResult {
            filename: path.to_path_buf(),
            print_time_seconds: seconds,
            filament_used_mm,
            layer_count: print.objects().iter().map(|o| o.layers().len()).max().unwrap_or(0),
            toolchanges: stats.total_toolchanges,
        };
        info!(path = %path.display(), layers = result.layer_count, "exported toolpaths");
        Ok(result)
    }
}
