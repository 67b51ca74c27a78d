//! `tagmap-middleware` – inbound plumbing.
//!
//! Routes detection batches and frame-graph edges from external producers to
//! the tracker without caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`bridge`] – newline-delimited JSON ingest that validates inbound
//!   messages and publishes them on the bus.

pub mod bridge;
pub mod bus;

pub use bridge::{InboundMessage, JsonLineBridge, PumpStats};
pub use bus::{EventBus, Topic, TopicReceiver};
