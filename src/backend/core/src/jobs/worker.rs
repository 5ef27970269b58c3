//! Job worker: runs due jobs with bounded concurrency.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::JobsConfig;
use crate::error::{EventideError, Result};

use super::{due_after, JobContext, JobError, JobQueue, JobRegistry, JobServices, QueuedJob};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    /// Maximum concurrent job executions
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Timeout for jobs that do not declare their own
    pub job_timeout: Duration,
    /// Maximum jobs claimed per poll
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "eventide-worker".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            batch_size: 64,
        }
    }
}

impl From<&JobsConfig> for WorkerConfig {
    fn from(config: &JobsConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval,
            job_timeout: config.job_timeout,
            ..Self::default()
        }
    }
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub retried: Arc<AtomicU64>,
    pub dead_lettered: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
    cancel: CancellationToken,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop polling and cancel running jobs.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.cancel.cancel();
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Wait for the worker loop to exit.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            error!(error = %err, "Job worker task failed");
        }
    }
}

enum Outcome {
    Completed,
    Retried,
    /// Interrupted by cancellation and returned to the queue untouched
    Released,
    DeadLettered,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retried => "retried",
            Self::Released => "released",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Claims due jobs from a `JobQueue` and executes them.
pub struct JobWorker {
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    services: Arc<JobServices>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl JobWorker {
    pub fn new(queue: Arc<JobQueue>, registry: Arc<JobRegistry>, services: Arc<JobServices>, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry,
            services,
            config,
            stats: WorkerStats::new(),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Run every job due at `now`, at most `concurrency` at a time.
    ///
    /// Returns the number of jobs claimed.
    #[instrument(skip(self, cancel), fields(worker = %self.config.name))]
    pub async fn run_pending(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<usize> {
        let requeued = self.queue.requeue_expired(now).await?;
        if requeued > 0 {
            warn!(requeued, "Requeued jobs whose lease expired");
        }

        let due = self.queue.pop_due(now, self.config.batch_size).await?;
        let claimed = due.len();
        if claimed == 0 {
            return Ok(0);
        }

        let semaphore = Semaphore::new(self.config.concurrency.max(1));
        let runs = due.into_iter().map(|job| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                self.run_one(job, cancel).await
            }
        });

        for result in join_all(runs).await {
            if let Err(err) = result {
                err.log();
            }
        }

        debug!(claimed, "Ran due jobs");
        Ok(claimed)
    }

    async fn run_one(&self, mut job: QueuedJob, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            debug!(job_id = %job.metadata.id, "Worker cancelled, returning job unstarted");
            self.queue.release(job).await?;
            metrics::counter!("eventide_jobs_executed_total", "outcome" => Outcome::Released.label()).increment(1);
            return Ok(());
        }

        job.metadata.mark_running();
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);

        let result = self.execute(&job, cancel).await;

        self.stats.active.fetch_sub(1, Ordering::Relaxed);

        let outcome = match result {
            Ok(()) => {
                job.metadata.mark_completed();
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %job.metadata.id, job = %job.metadata.job_type, "Job completed");
                self.queue.complete(&job).await?;
                Outcome::Completed
            }
            Err(err) => self.handle_failure(job, err, cancel).await?,
        };

        metrics::counter!("eventide_jobs_executed_total", "outcome" => outcome.label()).increment(1);
        Ok(())
    }

    async fn execute(&self, job: &QueuedJob, cancel: &CancellationToken) -> std::result::Result<(), JobError> {
        let runnable = self.registry.decode(job).map_err(JobError::fatal_from)?;

        let ctx = JobContext::new(job.metadata.clone(), cancel.child_token(), self.services.clone());
        let timeout = job
            .metadata
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.job_timeout);

        match tokio::time::timeout(timeout, runnable.execute(&ctx)).await {
            Ok(result) => result,
            Err(elapsed) => Err(EventideError::from(elapsed).into()),
        }
    }

    async fn handle_failure(&self, mut job: QueuedJob, err: JobError, cancel: &CancellationToken) -> Result<Outcome> {
        // A run cut short by shutdown says nothing about the job.
        if cancel.is_cancelled() || err.is_cancellation() {
            job.metadata.mark_released();
            info!(
                job_id = %job.metadata.id,
                job = %job.metadata.job_type,
                run_at = %job.run_at,
                "Job interrupted, returned to the queue"
            );
            self.queue.release(job).await?;
            return Ok(Outcome::Released);
        }

        let policy = job.metadata.retry_policy.clone();
        let retry = job.metadata.attempts.saturating_sub(1);

        if policy.should_retry(retry, &err) {
            job.metadata.mark_failed(&err.message);
            let run_at = due_after(Utc::now(), policy.next_retry_delay(retry))?;
            warn!(
                job_id = %job.metadata.id,
                job = %job.metadata.job_type,
                attempt = job.metadata.attempts,
                error = %err,
                run_at = %run_at,
                "Job failed, retrying"
            );
            self.queue.reschedule(job, run_at).await?;
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            return Ok(Outcome::Retried);
        }

        job.metadata.mark_dead(&err.message);
        error!(
            job_id = %job.metadata.id,
            job = %job.metadata.job_type,
            attempt = job.metadata.attempts,
            error = %err,
            "Job failed permanently"
        );
        self.queue.dead_letter(job).await?;
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(Outcome::DeadLettered)
    }

    /// Poll the queue until the returned handle is shut down.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let cancel = CancellationToken::new();
        let stats = self.stats.clone();
        let job_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            info!(
                worker = %self.config.name,
                concurrency = self.config.concurrency,
                "Job worker started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!(worker = %self.config.name, "Worker shutting down");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {
                        if let Err(err) = self.run_pending(Utc::now(), &job_cancel).await {
                            err.log();
                        }
                    }
                }
            }

            info!(worker = %self.config.name, "Worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            cancel,
            stats,
            task,
        }
    }
}
