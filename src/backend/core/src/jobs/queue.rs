//! Due-time job queue with dead letter handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use redis::Script;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::error::{EventideError, Result};

use super::{due_after, Job, JobId, JobMetadata, JobScheduler, JobStatus};

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum items in the dead letter queue
    pub dead_letter_max_size: usize,
    /// How long a claimed job is held before it is returned to the queue
    pub lease_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dead_letter_max_size: 1000,
            lease_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&JobsConfig> for QueueConfig {
    fn from(config: &JobsConfig) -> Self {
        Self {
            dead_letter_max_size: config.dead_letter_max_size,
            lease_timeout: config.lease_timeout,
        }
    }
}

/// A job waiting in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub metadata: JobMetadata,
    /// Serialized job data
    pub data: serde_json::Value,
    /// Earliest time the job may run
    pub run_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    /// Store receipt for a claimed job.
    #[serde(skip)]
    receipt: Option<String>,
}

impl QueuedJob {
    pub fn new(metadata: JobMetadata, data: serde_json::Value, run_at: DateTime<Utc>) -> Self {
        Self {
            metadata,
            data,
            run_at,
            enqueued_at: Utc::now(),
            receipt: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }

    pub fn is_claimed(&self) -> bool {
        self.receipt.is_some()
    }
}

impl Eq for QueuedJob {}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.metadata.id == other.metadata.id
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap order: earliest due time first, then highest priority, then oldest.
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| self.metadata.priority.cmp(&other.metadata.priority))
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting, due or not
    pub pending: usize,
    /// Claimed jobs whose run has not been settled
    pub in_flight: usize,
    pub dead_letter: usize,
}

/// Bounded queue of jobs that will not run again. The oldest entry is evicted first.
#[derive(Debug)]
pub struct DeadLetterQueue {
    jobs: VecDeque<QueuedJob>,
    max_size: usize,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            max_size,
        }
    }

    pub fn push(&mut self, job: QueuedJob) {
        if self.max_size == 0 {
            return;
        }
        if self.jobs.len() >= self.max_size {
            self.jobs.pop_front();
        }
        self.jobs.push_back(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn drain(&mut self) -> Vec<QueuedJob> {
        self.jobs.drain(..).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Stores
// ═══════════════════════════════════════════════════════════════════════════════

/// Where queued jobs wait for their due time.
///
/// Claiming is lease based: a popped job stays in the store, invisible to other
/// callers, until it is completed. If the lease runs out first (the worker
/// died mid-run) `requeue_expired` makes it due again, so every job runs at
/// least once.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn push(&self, job: QueuedJob) -> Result<()>;

    /// Claim up to `limit` jobs due at `now`, earliest first, leased until
    /// `lease_until`. A job is claimed by at most one caller at a time.
    async fn pop_due(&self, now: DateTime<Utc>, limit: usize, lease_until: DateTime<Utc>) -> Result<Vec<QueuedJob>>;

    /// Drop the claim on `job`. Jobs that were never claimed are ignored.
    async fn complete(&self, job: &QueuedJob) -> Result<()>;

    /// Return jobs whose lease ended at or before `now` to the queue.
    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Number of waiting jobs.
    async fn len(&self) -> Result<usize>;

    async fn in_flight(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[derive(Default)]
struct MemoryState {
    waiting: BinaryHeap<QueuedJob>,
    leased: HashMap<String, (DateTime<Utc>, QueuedJob)>,
}

/// In-memory job store for tests and single-process use.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: RwLock<MemoryState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn push(&self, mut job: QueuedJob) -> Result<()> {
        job.receipt = None;
        self.state.write().await.waiting.push(job);
        Ok(())
    }

    async fn pop_due(&self, now: DateTime<Utc>, limit: usize, lease_until: DateTime<Utc>) -> Result<Vec<QueuedJob>> {
        let mut state = self.state.write().await;
        let mut due = Vec::new();
        while due.len() < limit && state.waiting.peek().is_some_and(|job| job.is_due(now)) {
            if let Some(mut job) = state.waiting.pop() {
                let receipt = Uuid::new_v4().to_string();
                state.leased.insert(receipt.clone(), (lease_until, job.clone()));
                job.receipt = Some(receipt);
                due.push(job);
            }
        }
        Ok(due)
    }

    async fn complete(&self, job: &QueuedJob) -> Result<()> {
        if let Some(receipt) = &job.receipt {
            self.state.write().await.leased.remove(receipt);
        }
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .leased
            .iter()
            .filter(|(_, (lease_until, _))| *lease_until <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in &expired {
            if let Some((_, job)) = state.leased.remove(receipt) {
                state.waiting.push(job);
            }
        }
        Ok(expired.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.read().await.waiting.len())
    }

    async fn in_flight(&self) -> Result<usize> {
        Ok(self.state.read().await.leased.len())
    }
}

/// Moves due members to the processing set, scored by lease deadline.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('ZADD', KEYS[2], ARGV[3], member)
end
return due
"#;

/// Moves members with a lapsed lease back to the scheduled set, due now.
const REQUEUE_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, member in ipairs(expired) do
    redis.call('ZREM', KEYS[2], member)
    redis.call('ZADD', KEYS[1], ARGV[1], member)
end
return #expired
"#;

/// Redis job store.
///
/// Keys, all derived from the configured base key:
/// - `<key>`: sorted set of serialized jobs scored by due time in milliseconds
/// - `<key>:processing`: claimed jobs scored by lease deadline
/// - `<key>:dead`: list of members that could not be decoded
///
/// Claiming runs as a script, so concurrent workers never claim the same job.
pub struct RedisJobStore {
    conn: ConnectionManager,
    key: String,
    processing_key: String,
    dead_key: String,
    claim: Script,
    requeue: Script,
}

impl RedisJobStore {
    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let key = key.into();
        Ok(Self {
            conn,
            processing_key: format!("{}:processing", key),
            dead_key: format!("{}:dead", key),
            key,
            claim: Script::new(CLAIM_SCRIPT),
            requeue: Script::new(REQUEUE_SCRIPT),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Park a claimed member that cannot be decoded.
    async fn bury(&self, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zrem(&self.processing_key, member)
            .ignore()
            .rpush(&self.dead_key, member)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip_all, fields(key = %self.key, job_id = %job.metadata.id))]
    async fn push(&self, job: QueuedJob) -> Result<()> {
        let member = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(&self.key)
            .arg(job.run_at.timestamp_millis())
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await?;

        debug!("Job stored");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %self.key))]
    async fn pop_due(&self, now: DateTime<Utc>, limit: usize, lease_until: DateTime<Utc>) -> Result<Vec<QueuedJob>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = self
            .claim
            .key(&self.key)
            .key(&self.processing_key)
            .arg(now.timestamp_millis())
            .arg(limit)
            .arg(lease_until.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        let mut claimed = Vec::with_capacity(members.len());
        for member in members {
            match serde_json::from_str::<QueuedJob>(&member) {
                Ok(mut job) => {
                    job.receipt = Some(member);
                    claimed.push(job);
                }
                Err(err) => {
                    error!(error = %err, dead_key = %self.dead_key, "Undecodable job moved aside");
                    self.bury(&member).await?;
                }
            }
        }

        Ok(claimed)
    }

    async fn complete(&self, job: &QueuedJob) -> Result<()> {
        if let Some(member) = &job.receipt {
            let mut conn = self.conn.clone();
            redis::cmd("ZREM")
                .arg(&self.processing_key)
                .arg(member)
                .query_async::<_, i64>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.clone();
        let requeued: usize = self
            .requeue
            .key(&self.key)
            .key(&self.processing_key)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(requeued)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("ZCARD").arg(&self.key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn in_flight(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("ZCARD")
            .arg(&self.processing_key)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Job store plus dead letter queue. This is the scheduling substrate that
/// scheduled commands are submitted to.
///
/// Every job returned by `pop_due` must be settled with exactly one of
/// `complete`, `reschedule`, `release` or `dead_letter`.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    dead_letter: RwLock<DeadLetterQueue>,
    lease_timeout: Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            dead_letter: RwLock::new(DeadLetterQueue::new(config.dead_letter_max_size)),
            lease_timeout: config.lease_timeout,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryJobStore::new()), QueueConfig::default())
    }

    pub async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        self.store.push(job).await
    }

    /// Claim jobs due at `now`, leased for the configured lease timeout.
    pub async fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueuedJob>> {
        let lease_until = due_after(now, self.lease_timeout)?;
        self.store.pop_due(now, limit, lease_until).await
    }

    /// Settle a claimed job that ran to completion.
    pub async fn complete(&self, job: &QueuedJob) -> Result<()> {
        self.store.complete(job).await
    }

    /// Put a failed job back to run again at `run_at`.
    pub async fn reschedule(&self, mut job: QueuedJob, run_at: DateTime<Utc>) -> Result<()> {
        job.run_at = run_at;
        self.store.push(job.clone()).await?;
        self.store.complete(&job).await
    }

    /// Return a claimed job unchanged, keeping its due time.
    pub async fn release(&self, job: QueuedJob) -> Result<()> {
        self.store.push(job.clone()).await?;
        self.store.complete(&job).await
    }

    pub async fn dead_letter(&self, mut job: QueuedJob) -> Result<()> {
        job.metadata.status = JobStatus::Dead;
        self.store.complete(&job).await?;
        self.dead_letter.write().await.push(job);
        Ok(())
    }

    /// Make jobs claimed by a worker that never settled them due again.
    pub async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.requeue_expired(now).await
    }

    /// Remove and return everything in the dead letter queue.
    pub async fn drain_dead_letters(&self) -> Vec<QueuedJob> {
        self.dead_letter.write().await.drain()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.store.len().await?,
            in_flight: self.store.in_flight().await?,
            dead_letter: self.dead_letter.read().await.len(),
        })
    }
}

#[async_trait]
impl JobScheduler for JobQueue {
    async fn schedule(&self, job: &dyn Job, run_at: DateTime<Utc>, cancel: &CancellationToken) -> Result<JobId> {
        if cancel.is_cancelled() {
            return Err(EventideError::cancelled("schedule"));
        }

        let metadata = JobMetadata::for_job(job);
        let id = metadata.id;
        self.store
            .push(QueuedJob::new(metadata, job.serialize()?, run_at))
            .await?;

        debug!(job_id = %id, job = job.name(), run_at = %run_at, "Job scheduled");
        Ok(id)
    }
}
