//! Observability: structured logging and device counters

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{DeviceMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{cycle_span, mqtt_span, sensor_span};
