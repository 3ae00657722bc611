#![warn(missing_docs)]

//! Staged print pipeline for the slicekit slicer.
//!
//! A [`Print`] takes a [`Model`](slicekit_model::Model) and a full
//! [`DynamicConfig`](slicekit_config::DynamicConfig) and turns every printable
//! instance into ordered toolpaths. Work is split into steps: per-object
//! [`PrintObjectStep`]s run in parallel across [`PrintObject`]s, then the
//! whole-plate [`PrintStep`]s (tool ordering, skirt and brim, export,
//! conflict check) run once all objects are done.
//!
//! Steps form a dependency graph. Editing the config or the model only
//! clears the steps downstream of what changed, so re-running
//! [`Print::process`] after a small edit repeats little work.
//!
//! # Example
//!
//! ```ignore
//! use slicekit_print::{Print, ToolpathDumpExporter};
//!
//! let mut print = Print::new();
//! print.apply(&model, None, &config)?;
//! print.validate()?;
//! print.process()?;
//! print.export_gcode(Path::new("plate_1.json"), &ToolpathDumpExporter)?;
//! ```

pub mod compat;
pub mod conflict;
pub mod error;
pub mod gcode;
pub mod infill;
pub mod invalidation;
pub mod layer;
pub mod perimeter;
pub mod pipeline;
pub mod print;
pub mod print_object;
pub mod region;
pub mod skirt_brim;
pub mod slicing;
pub mod statistics;
pub mod step;
pub mod support;
pub mod tool_ordering;
pub mod wipe_tower;

pub use compat::{
    check_compatible_of_nozzle_and_filament, check_filament_printable, check_mixture_of_pla_and_petg,
    check_multi_filaments_compatibility, get_compatible_filament_type, get_filament_temp_type,
    get_physical_unprintable_filaments, is_filaments_compatible, FilamentCompatibilityType, FilamentTempType,
    NozzleFilamentRules,
};
pub use conflict::ConflictResult;
pub use error::{PrintError, PrintWarning, Result};
pub use gcode::{GCodeExporter, GCodeProcessorResult, ToolpathDumpExporter};
pub use layer::{ExtrusionEntityCollection, ExtrusionPath, ExtrusionRole, Layer, LayerRegion, SupportLayer};
pub use pipeline::PipelineConfig;
pub use print::{ApplyStatus, Print};
pub use print_object::{PrintInstance, PrintObject};
pub use region::{PrintObjectRegions, PrintRegion, RegionAssigner};
pub use slicing::SlicingParameters;
pub use statistics::PrintStatistics;
pub use step::{CancelToken, PrintObjectStep, PrintStep};
pub use tool_ordering::ToolOrdering;
pub use wipe_tower::WipeTowerData;
