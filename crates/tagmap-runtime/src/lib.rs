//! `tagmap-runtime` – the running tracker.
//!
//! # Modules
//!
//! - [`node`] – [`TrackerNode`][node::TrackerNode]: starts the transform
//!   listener, the detection consumer and the fixed-period tick timer as
//!   independent Tokio tasks over a shared
//!   [`PoseFusion`][tagmap_perception::PoseFusion].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber with an optional OTLP span exporter.

pub mod node;
pub mod telemetry;

pub use node::{TrackerHandle, TrackerNode};
pub use telemetry::{init_tracing, TracerProviderGuard};
