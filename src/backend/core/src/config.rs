//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Event store configuration
    #[serde(default)]
    pub event_store: EventStoreConfig,

    /// Job substrate configuration
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventStoreConfig {
    /// PostgreSQL connection URL. In-memory log when unset.
    pub database_url: Option<String>,

    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Page size used when reading the global log
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Reserved prefix marking system streams and event types
    #[serde(default = "default_system_prefix")]
    pub system_prefix: String,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_max_connections(),
            page_size: default_page_size(),
            system_prefix: default_system_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Redis connection URL. In-memory job store when unset.
    pub redis_url: Option<String>,

    /// Redis sorted-set key holding scheduled jobs
    #[serde(default = "default_queue_key")]
    pub queue_key: String,

    /// How often the worker polls for due jobs
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum concurrent job executions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound for a single job execution
    #[serde(default = "default_job_timeout", with = "humantime_serde")]
    pub job_timeout: Duration,

    /// How long a claimed job stays invisible to other workers before it is
    /// returned to the queue. Must outlast `job_timeout`.
    #[serde(default = "default_lease_timeout", with = "humantime_serde")]
    pub lease_timeout: Duration,

    /// Maximum items kept in the dead letter queue
    #[serde(default = "default_dead_letter_max_size")]
    pub dead_letter_max_size: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            queue_key: default_queue_key(),
            poll_interval: default_poll_interval(),
            concurrency: default_concurrency(),
            job_timeout: default_job_timeout(),
            lease_timeout: default_lease_timeout(),
            dead_letter_max_size: default_dead_letter_max_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// Default value functions
fn default_max_connections() -> u32 { 10 }
fn default_page_size() -> usize { 200 }
fn default_system_prefix() -> String { "$".to_string() }
fn default_queue_key() -> String { "eventide:jobs:scheduled".to_string() }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_concurrency() -> usize { 4 }
fn default_job_timeout() -> Duration { Duration::from_secs(300) }
fn default_lease_timeout() -> Duration { Duration::from_secs(600) }
fn default_dead_letter_max_size() -> usize { 1000 }

impl Config {
    /// Load configuration from the environment (`EVENTIDE__SECTION__KEY`).
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("EVENTIDE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("EVENTIDE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
