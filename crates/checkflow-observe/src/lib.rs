//! Observability setup for Checkflow.
//!
//! - `tracing_setup`: subscriber initialization and OpenTelemetry shutdown

pub mod tracing_setup;
