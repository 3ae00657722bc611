#![warn(missing_docs)]

//! Build plates for the slicekit slicer.
//!
//! A [`PartPlateList`] splits the instances of a
//! [`Model`](slicekit_model::Model) across fixed-size plates laid out on a
//! grid. Each [`PartPlate`] tracks which instances it holds, which of them
//! protrude from the printable area or touch an exclusion zone, and its own
//! overrides of bed type, print sequence, spiral vase mode and filament
//! mapping. Instances that overlap no plate land on a separate unprintable
//! plate, so every instance always has exactly one owner.
//!
//! Each plate owns one [`Print`](slicekit_print::Print). The list slices
//! plates independently and reports plate-fatal and object-scoped failures
//! separately in a [`SliceReport`].

pub mod error;
pub mod list;
pub mod plate;

pub use error::{PlateError, Result};
pub use list::{compute_colum_count, PartPlateList, SliceReport, MAX_PLATES_COUNT};
pub use plate::{rounded_exclude_polygon, InstanceKey, PartPlate};
