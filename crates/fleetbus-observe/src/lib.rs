//! Observability for Fleetbus: subscriber setup and optional OpenTelemetry
//! span export.

pub mod tracing_setup;
