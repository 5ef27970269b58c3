#![allow(clippy::result_large_err)]
//! # Eventide Core
//!
//! Event-sourcing persistence with scheduled command dispatch.
//!
//! ## Architecture
//!
//! - **Events**: commits aggregate events to an append-only log with optimistic
//!   concurrency, reads them back per aggregate or globally by cursor
//! - **Snapshots**: versioned aggregate snapshots upgraded step by step on load
//! - **Commands**: a registry naming commands by `(name, version)`, an in-process
//!   command bus and a scheduler that defers commands as jobs
//! - **Jobs**: due-time job queue (in-memory or Redis) with a retrying worker
//! - **Sagas**: delivery of scheduled saga timeouts to the saga they address
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod sagas;
pub mod snapshots;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, EventideError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::commands::{
        Command, CommandBus, CommandDefinition, CommandHandler, CommandRegistry, CommandScheduler,
        DecodedCommand, InProcessCommandBus,
    };
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, EventideError, Result};
    pub use crate::events::{
        Aggregate, AggregateId, AggregateLoader, AllCommittedEventsPage, CommittedEvent, EventLog, EventMetadata,
        EventPersistence, GlobalPosition, InMemoryEventLog, LogPosition, PostgresEventLog, SerializedEvent,
    };
    pub use crate::jobs::{
        Job, JobContext, JobEnvelope, JobError, JobQueue, JobRegistry, JobResult, JobScheduler, JobServices,
        JobWorker, WorkerConfig,
    };
    pub use crate::sagas::{
        DispatchToSagas, InMemorySagaStore, Saga, SagaContext, SagaId, SagaStore, SagaTimeout,
        SagaTimeoutDispatcher, SagaTimeoutHandler,
    };
    pub use crate::snapshots::{InMemorySnapshotStore, Snapshot, SnapshotStore, SnapshotUpgradeChain, SnapshotUpgrader};
}
