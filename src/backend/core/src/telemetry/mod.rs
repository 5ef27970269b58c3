//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: JSON/pretty/compact `tracing` output with per-module levels
//! - **Metrics**: Prometheus recorder for the counters emitted by the event
//!   store, the job worker and the error type
//!
//! # Example
//!
//! ```rust,no_run
//! use eventide_core::config::TelemetryConfig;
//! use eventide_core::telemetry::init_telemetry;
//!
//! let config = TelemetryConfig::default();
//! init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry};

use crate::config::TelemetryConfig;

/// Initialize logging and metrics. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<MetricsRegistry> {
    let registry = init_metrics(&config.metrics)?;
    init_logging(&config.logging)?;
    Ok(registry)
}
