//! `tagmap-perception` – marker pose fusion.
//!
//! Turns marker detections relative to a moving sensor into a smoothed
//! estimate of every marker's pose in the world frame.
//!
//! # Modules
//!
//! - [`transform`] – [`Transform`][transform::Transform]: immutable rigid-body
//!   transform with composition, linear blending, and one constructor per
//!   quaternion component order.
//! - [`frames`] – [`TfBuffer`][frames::TfBuffer]: time-bounded graph
//!   of named frames, fed by the localization source and queried with a
//!   bounded wait.
//! - [`reference`] – [`ReferenceTracker`][reference::ReferenceTracker]: holds
//!   the latest sensor-to-world snapshot, refreshed through any
//!   [`ReferenceLookup`][reference::ReferenceLookup].
//! - [`fusion`] – [`PoseFusion`][fusion::PoseFusion]: composes detections
//!   with the reference snapshot and smooths them into the estimate table.
//! - [`export`] – [`EstimateSink`][export::EstimateSink] and
//!   [`FileExporter`][export::FileExporter]: whole-table export in the
//!   `Tag <id>: <transform>` line format.

pub mod export;
pub mod frames;
pub mod fusion;
pub mod reference;
pub mod transform;

pub use export::{EstimateSink, FileExporter};
pub use frames::TfBuffer;
pub use fusion::{BatchSummary, ExportOutcome, FusionOutcome, PoseFusion, TickReport};
pub use reference::{LookupError, ReferenceLookup, ReferenceQuery, ReferenceTracker};
pub use transform::{Transform, Vec3};
