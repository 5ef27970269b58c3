//! Prometheus metrics for the event store and the job worker.
//!
//! Metric names emitted by the crate:
//!
//! - `eventide_events_committed_total`
//! - `eventide_concurrency_conflicts_total`
//! - `eventide_jobs_scheduled_total{job_type}`
//! - `eventide_jobs_executed_total{job_type, outcome}`
//! - `eventide_errors_total{code, category, retryable}`

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus recorder is installed
    #[serde(default)]
    pub enabled: bool,

    /// Address of the Prometheus scrape listener
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_metrics_endpoint(),
        }
    }
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

/// Handle to the installed recorder, if any.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder with an HTTP scrape listener.
///
/// Must be called from within a tokio runtime when enabled.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry {
            prometheus_handle: None,
        });
    }

    let addr: SocketAddr = config.endpoint.parse()?;
    let (recorder, exporter) = PrometheusBuilder::new().with_http_listener(addr).build()?;
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow::anyhow!("a global metrics recorder is already installed"))?;
    tokio::spawn(exporter);

    register_metric_descriptions();

    tracing::info!(endpoint = %config.endpoint, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "eventide_events_committed_total",
        "Events committed to the backing log"
    );
    describe_counter!(
        "eventide_concurrency_conflicts_total",
        "Appends rejected by the optimistic concurrency precondition"
    );
    describe_counter!("eventide_jobs_scheduled_total", "Jobs handed to the job store");
    describe_counter!(
        "eventide_jobs_executed_total",
        "Job executions by outcome (succeeded, retried, dead)"
    );
    describe_counter!("eventide_errors_total", "Errors constructed, by code");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_render_empty() {
        let registry = init_metrics(&MetricsConfig::default()).unwrap();
        assert!(registry.render().is_empty());
    }
}
