//! Observability setup for the Stratum runtime: tracing subscriber with
//! optional JSON output and OpenTelemetry bridging.

pub mod tracing_setup;

pub use tracing_setup::{TracingOptions, init_test_tracing, init_tracing, shutdown_tracing};
