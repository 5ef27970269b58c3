//! Job definitions and traits.
//!
//! - **Job trait**: named, versioned unit of deferred work
//! - **JobContext**: metadata, cancellation and the services a job may call
//! - **RetryPolicy**: retry limits with backoff strategies

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::commands::{CommandBus, CommandRegistry};
use crate::error::{ErrorCode, EventideError, Result};
use crate::sagas::DispatchToSagas;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its due time
    Scheduled,
    Running,
    Completed,
    /// Failed, another attempt is scheduled
    Failed,
    /// Failed for good and moved to the dead letter queue
    Dead,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs due at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    /// Whether another attempt may succeed
    pub retryable: bool,
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Whether the failure came from a cancelled operation.
    pub fn is_cancellation(&self) -> bool {
        self.code.as_deref() == Some(ErrorCode::Cancelled.to_string().as_str())
    }

    /// Keep the code of `error` but never retry.
    pub fn fatal_from(error: EventideError) -> Self {
        Self {
            retryable: false,
            ..Self::from(error)
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<EventideError> for JobError {
    fn from(error: EventideError) -> Self {
        Self {
            message: error.to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed {
        delay_secs: u64,
    },
    /// initial + increment * attempt
    Linear {
        initial_delay_secs: u64,
        increment_secs: u64,
    },
    /// initial * multiplier^attempt, capped
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_secs: 5,
            max_delay_secs: 3600,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before retrying after the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Linear {
                initial_delay_secs,
                increment_secs,
            } => initial_delay_secs + (increment_secs * attempt as u64),
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let delay = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_secs as f64) as u64
            }
        };

        Duration::from_secs(secs)
    }

    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for job retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries)
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a job that failed its `attempt`-th retry (0-indexed) should run again.
    pub fn should_retry(&self, attempt: u32, error: &JobError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        error.retryable
    }

    pub fn next_retry_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata associated with a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub id: JobId,
    /// Registered job name
    pub job_type: String,
    /// Registered job version
    pub job_version: u32,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Number of execution attempts so far
    pub attempts: u32,
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl JobMetadata {
    pub fn new(job_type: impl Into<String>, job_version: u32) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            job_version,
            status: JobStatus::Scheduled,
            priority: JobPriority::default(),
            attempts: 0,
            retry_policy: RetryPolicy::default(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
            timeout_secs: None,
        }
    }

    /// Metadata for `job`, carrying its priority, retry policy and timeout.
    pub fn for_job(job: &dyn Job) -> Self {
        Self {
            priority: job.priority(),
            retry_policy: job.retry_policy(),
            timeout_secs: job.timeout_secs(),
            ..Self::new(job.name(), job.version())
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    /// Undo `mark_running` for a run that was interrupted.
    pub fn mark_released(&mut self) {
        self.status = JobStatus::Scheduled;
        self.started_at = None;
        self.attempts = self.attempts.saturating_sub(1);
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = JobStatus::Failed;
        self.last_error = Some(error.to_string());
    }

    pub fn mark_dead(&mut self, error: &str) {
        self.status = JobStatus::Dead;
        self.finished_at = Some(Utc::now());
        self.last_error = Some(error.to_string());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Collaborators available to executing jobs.
#[derive(Clone)]
pub struct JobServices {
    pub commands: Arc<CommandRegistry>,
    pub command_bus: Arc<dyn CommandBus>,
    pub sagas: Arc<dyn DispatchToSagas>,
}

impl JobServices {
    /// Fail unless at least one command is registered. A worker without
    /// commands cannot decode any scheduled command and would dead-letter
    /// every one it claims.
    pub fn ensure_commands_registered(&self) -> Result<()> {
        if self.commands.is_empty() {
            return Err(EventideError::new(
                ErrorCode::MissingConfiguration,
                "No commands are registered with the job worker",
            ));
        }
        Ok(())
    }
}

/// Context passed to jobs during execution.
pub struct JobContext {
    pub metadata: JobMetadata,
    pub cancellation: CancellationToken,
    pub services: Arc<JobServices>,
}

impl JobContext {
    pub fn new(metadata: JobMetadata, cancellation: CancellationToken, services: Arc<JobServices>) -> Self {
        Self {
            metadata,
            cancellation,
            services,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A unit of deferred work.
///
/// Jobs are persisted as JSON under their `(name, version)` and rebuilt by the
/// `JobRegistry` before execution.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> u32 {
        1
    }

    /// JSON form stored with the queued job.
    fn serialize(&self) -> Result<serde_json::Value>;

    /// Execute the job.
    ///
    /// Return `JobError::retryable()` for transient failures and
    /// `JobError::fatal()` for failures no retry can fix.
    async fn execute(&self, ctx: &JobContext) -> JobResult;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Normal
    }

    /// Execution timeout in seconds.
    fn timeout_secs(&self) -> Option<u64> {
        Some(300)
    }
}
