//! Multi-threaded time-frame aggregation for streaming data acquisition.
//!
//! Reassembled time slices arriving from independent data streams are
//! synchronized by timestamp across a pool of builder shards, encoded into
//! a big-endian framed record, and published to an event-transport ring
//! and/or size-capped files on disk.
//!
//! The public entry point is [`FrameBuilder`]: construct it from a
//! [`BuilderConfig`], call [`FrameBuilder::start`], feed it slices via
//! [`FrameBuilder::submit`] (or [`FrameBuilder::submit_raw`] for payloads
//! that still carry their prefix), and finish with
//! [`FrameBuilder::shutdown`].

pub mod config;
pub mod data;
pub mod record;
pub mod ring;
pub mod runtime;
pub mod sink;

mod trace;

pub use config::{BuilderConfig, CastMode, ConfigError, FileConfig, RingConfig};
pub use runtime::dispatcher::{FrameBuilder, StartError};
pub use runtime::stats::StatsSnapshot;
pub use trace::init_tracing;

// Re-export serde traits for convenience
pub use serde::{Deserialize, Serialize};
