//! The scheduling substrate: accepts jobs to run at a point in time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{EventideError, Result};

use super::{Job, JobId};

/// Accepts jobs for execution at or after a due time.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Persist `job` so that it runs no earlier than `run_at`.
    async fn schedule(&self, job: &dyn Job, run_at: DateTime<Utc>, cancel: &CancellationToken) -> Result<JobId>;

    /// Persist `job` to run once `delay` has elapsed from now.
    async fn schedule_after(&self, job: &dyn Job, delay: Duration, cancel: &CancellationToken) -> Result<JobId> {
        let run_at = due_after(Utc::now(), delay)?;
        self.schedule(job, run_at, cancel).await
    }
}

/// `now + delay`, or `InvalidArgument` when the sum is out of range.
pub fn due_after(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| EventideError::invalid_argument(format!("Delay {:?} is out of range", delay)))
}
