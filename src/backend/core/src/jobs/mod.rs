//! Background job system.
//!
//! - **Job Definitions**: named, versioned jobs with retry and backoff policies
//! - **Scheduler**: the `JobScheduler` substrate that accepts jobs for a due time
//! - **Envelope**: the job that carries a scheduled command
//! - **Queue**: due-time ordered storage (in-memory or Redis) with a dead letter queue
//! - **Worker**: concurrent execution of due jobs with graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Command    │    │  JobQueue    │    │  JobWorker   │    │ CommandBus / │
//! │  Scheduler   │───▶│  (JobStore + │───▶│ (JobRegistry │───▶│ saga dispatch│
//! │ (envelopes)  │    │  dead letter)│    │  + retries)  │    │              │
//! └──────────────┘    └──────────────┘    └──────────────┘    └──────────────┘
//! ```

pub mod envelope;
pub mod job;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use envelope::JobEnvelope;
pub use job::{
    BackoffStrategy, Job, JobContext, JobError, JobId, JobMetadata, JobPriority, JobResult, JobServices,
    JobStatus, RetryPolicy,
};
pub use queue::{
    DeadLetterQueue, InMemoryJobStore, JobQueue, JobStore, QueueConfig, QueueStats, QueuedJob, RedisJobStore,
};
pub use registry::JobRegistry;
pub use scheduler::{due_after, JobScheduler};
pub use worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
