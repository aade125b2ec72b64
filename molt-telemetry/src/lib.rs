//! Telemetry bootstrap: tracing subscriber setup and Prometheus metrics
//! exporter initialization.

pub mod metrics;
pub mod tracing;
