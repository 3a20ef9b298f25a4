//! Driver and scripted controller for the Sutter MP-285 micro-positioner.
//!
//! The crate talks to a single serial-connected MP-285, converts between
//! micrometers and motor microsteps, and records every move and position query
//! in a CSV event log. On top of that sits a timed well-cycling runner that
//! steps the stage through a fixed list of coordinates.
//!
//! - [`protocol`]: pure encode/decode of the binary command frames
//! - [`session`]: an open, exclusively owned link with cached state
//! - [`event_log`]: the CSV log and the existing-file policy
//! - [`cycle`]: timed well cycling
//! - [`config`]: Figment-based settings

pub mod config;
pub mod cycle;
pub mod error;
pub mod event_log;
pub mod protocol;
pub mod session;

/// `tracing` target for every event the library emits.
pub(crate) const TRACE_TARGET: &str = "hardware::mp285";

pub use error::{StageError, StageResult};
pub use protocol::Position;
pub use session::Session;
