//! Logging and metrics.
//!
//! Provides:
//! - `tracing` subscriber setup with text or JSON output
//! - OpenTelemetry counters for broadcasts, deliveries and resource transitions

pub mod metrics;
pub mod tracing;
