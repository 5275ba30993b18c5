// crates/drudge-telemetry/src/lib.rs
//
// drudge-telemetry: metrics, trace propagation and log/trace subscriber setup
// for the Drudge runtime.

pub mod propagation;
pub mod registry;
pub mod subscriber;

pub use propagation::{extract_from_headers, extract_from_metadata, inject_into_metadata};
pub use registry::{
    record, Aggregation, Instrument, InstrumentKind, MetricDescriptor, MetricRegistry,
    RegistryEntry, DEFAULT_LATENCY_BUCKETS,
};
pub use subscriber::{
    install, install_with_provider, tracer_provider, LogFormat, TelemetryConfig, TelemetryGuard,
    TraceExporter,
};
