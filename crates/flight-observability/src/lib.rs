//! Observability for the flight transport.
//!
//! This crate provides:
//! - `init_logging` - `tracing` subscriber setup, JSON or human output
//! - `ChannelMetrics` - Per-channel call counters
//! - `TelemetrySink` / `TelemetryReport` - Optional payload reporting

mod logging;
mod metrics;
mod telemetry;

pub use logging::*;
pub use metrics::*;
pub use telemetry::*;
