//! Integration tests for scheduled commands.
//!
//! Tests cover:
//! - Scheduling with a delay and the resulting envelope
//! - Routing of fired envelopes to the command bus or to saga dispatch
//! - Saga type mismatches
//! - Worker retries, dead-lettering and interruption

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use eventide_core::commands::{Command, CommandBus, CommandHandler, CommandRegistry, CommandScheduler, InProcessCommandBus};
use eventide_core::error::{ErrorCode, EventideError, Result};
use eventide_core::events::AggregateId;
use eventide_core::jobs::{
    Job, JobEnvelope, JobQueue, JobRegistry, JobServices, JobWorker, QueuedJob, RetryPolicy, WorkerConfig,
};
use eventide_core::sagas::{
    DispatchToSagas, InMemorySagaStore, Saga, SagaContext, SagaId, SagaStore, SagaTimeout, SagaTimeoutDispatcher,
    SagaTimeoutHandler,
};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PingCommand {
    thingy_id: String,
}

impl Command for PingCommand {
    fn aggregate_id(&self) -> AggregateId {
        AggregateId::new(self.thingy_id.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThingyTimeout {
    saga_id: String,
}

impl Command for ThingyTimeout {
    fn aggregate_id(&self) -> AggregateId {
        AggregateId::new(self.saga_id.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl SagaTimeout for ThingyTimeout {
    fn saga_id(&self) -> SagaId {
        SagaId::new(self.saga_id.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn into_command(self: Box<Self>) -> Box<dyn Command> {
        self
    }
}

struct ThingySaga {
    id: SagaId,
    timeouts: u32,
}

impl Saga for ThingySaga {
    fn saga_id(&self) -> &SagaId {
        &self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[async_trait]
impl SagaTimeoutHandler<ThingyTimeout> for ThingySaga {
    async fn handle_timeout(&mut self, timeout: ThingyTimeout, ctx: &SagaContext) -> Result<()> {
        assert_eq!(ctx.saga_id.as_str(), timeout.saga_id);
        self.timeouts += 1;
        Ok(())
    }
}

struct UnrelatedSaga {
    id: SagaId,
}

impl Saga for UnrelatedSaga {
    fn saga_id(&self) -> &SagaId {
        &self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Records published pings. Fails the first `failures` deliveries with a
/// concurrency conflict.
#[derive(Clone, Default)]
struct RecordingHandler {
    received: Arc<Mutex<Vec<PingCommand>>>,
    failures: Arc<AtomicU32>,
}

#[async_trait]
impl CommandHandler<PingCommand> for RecordingHandler {
    async fn handle(&self, command: &PingCommand, _cancel: &CancellationToken) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EventideError::optimistic_concurrency(
                command.thingy_id.clone(),
                "stream moved on",
            ));
        }
        self.received.lock().push(command.clone());
        Ok(())
    }
}

struct Harness {
    registry: Arc<CommandRegistry>,
    queue: Arc<JobQueue>,
    scheduler: CommandScheduler,
    handler: RecordingHandler,
    sagas: Arc<InMemorySagaStore>,
    worker: JobWorker,
}

async fn harness() -> Harness {
    let mut registry = CommandRegistry::new();
    registry.register::<PingCommand>("Ping", 2).unwrap();
    registry.register_saga_timeout::<ThingyTimeout>("ThingyTimeout", 1).unwrap();
    let registry = Arc::new(registry);

    let handler = RecordingHandler::default();
    let bus = InProcessCommandBus::new();
    bus.register::<PingCommand, _>(handler.clone());

    let sagas = Arc::new(InMemorySagaStore::new());
    sagas
        .insert(Box::new(ThingySaga {
            id: SagaId::new("saga-1"),
            timeouts: 0,
        }))
        .await
        .unwrap();
    sagas
        .insert(Box::new(UnrelatedSaga {
            id: SagaId::new("saga-unrelated"),
        }))
        .await
        .unwrap();
    let mut dispatcher = SagaTimeoutDispatcher::new(sagas.clone());
    dispatcher.register::<ThingySaga, ThingyTimeout>().unwrap();

    let queue = Arc::new(JobQueue::in_memory());
    let scheduler = CommandScheduler::new(queue.clone(), registry.clone());

    let services = JobServices {
        commands: registry.clone(),
        command_bus: Arc::new(bus) as Arc<dyn CommandBus>,
        sagas: Arc::new(dispatcher) as Arc<dyn DispatchToSagas>,
    };
    let worker = JobWorker::new(
        queue.clone(),
        Arc::new(JobRegistry::with_defaults()),
        Arc::new(services),
        WorkerConfig::default(),
    );

    Harness {
        registry,
        queue,
        scheduler,
        handler,
        sagas,
        worker,
    }
}

async fn saga_timeouts(store: &InMemorySagaStore, id: &str) -> u32 {
    let handle = store.get(&SagaId::new(id)).await.unwrap().unwrap();
    let saga = handle.lock().await;
    saga.as_any().downcast_ref::<ThingySaga>().unwrap().timeouts
}

fn envelope_of(job: &QueuedJob) -> JobEnvelope {
    serde_json::from_value(job.data.clone()).unwrap()
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_command_scheduled_ten_minutes_out() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    let before = Utc::now();

    let command = PingCommand {
        thingy_id: "thingy-1".into(),
    };
    let job_id = h
        .scheduler
        .schedule_after(&command, Duration::from_secs(600), &cancel)
        .await
        .unwrap();
    let after = Utc::now();

    assert_eq!(h.queue.stats().await.unwrap().pending, 1);
    assert!(h.queue.pop_due(before + chrono::Duration::minutes(9), 10).await.unwrap().is_empty());

    let due = h.queue.pop_due(after + chrono::Duration::minutes(10), 10).await.unwrap();
    assert_eq!(due.len(), 1);
    let job = &due[0];
    assert_eq!(job.metadata.id, job_id);
    assert_eq!(job.metadata.job_type, JobEnvelope::JOB_NAME);
    assert_eq!(job.metadata.job_version, JobEnvelope::JOB_VERSION);
    assert!(job.run_at >= before + chrono::Duration::minutes(10));
    assert!(job.run_at <= after + chrono::Duration::minutes(10));

    let envelope = envelope_of(job);
    let definition = h.registry.definition_of::<PingCommand>().unwrap();
    assert_eq!(envelope.name, definition.name);
    assert_eq!(envelope.version, definition.version);
    assert!(!envelope.for_saga);
    assert_eq!(serde_json::from_str::<PingCommand>(&envelope.data).unwrap(), command);
}

#[tokio::test]
async fn test_saga_timeout_is_marked_for_saga() {
    let h = harness().await;
    let run_at = Utc::now() + chrono::Duration::minutes(10);

    h.scheduler
        .schedule_at(
            &ThingyTimeout {
                saga_id: "saga-1".into(),
            },
            run_at,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let due = h.queue.pop_due(run_at, 10).await.unwrap();
    let envelope = envelope_of(&due[0]);
    assert_eq!(envelope.name, "ThingyTimeout");
    assert_eq!(envelope.version, 1);
    assert!(envelope.for_saga);
}

#[tokio::test]
async fn test_unregistered_command_is_not_scheduled() {
    let queue = Arc::new(JobQueue::in_memory());
    let scheduler = CommandScheduler::new(queue.clone(), Arc::new(CommandRegistry::new()));

    let err = scheduler
        .schedule_after(
            &PingCommand {
                thingy_id: "thingy-1".into(),
            },
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::CommandNotRegistered);
    assert_eq!(queue.stats().await.unwrap().pending, 0);
}

// ============================================================================
// Execution
// ============================================================================

#[tokio::test]
async fn test_fired_command_is_published() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    let run_at = Utc::now();

    h.scheduler
        .schedule_at(
            &PingCommand {
                thingy_id: "thingy-7".into(),
            },
            run_at,
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(h.worker.run_pending(run_at, &cancel).await.unwrap(), 1);
    let received = h.handler.received.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].thingy_id, "thingy-7");
    assert_eq!(h.worker.stats().succeeded(), 1);
}

#[tokio::test]
async fn test_fired_timeout_reaches_saga() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    let run_at = Utc::now();

    h.scheduler
        .schedule_at(
            &ThingyTimeout {
                saga_id: "saga-1".into(),
            },
            run_at,
            &cancel,
        )
        .await
        .unwrap();

    h.worker.run_pending(run_at, &cancel).await.unwrap();
    assert_eq!(saga_timeouts(&h.sagas, "saga-1").await, 1);
    assert!(h.handler.received.lock().is_empty());
}

#[tokio::test]
async fn test_timeout_for_missing_saga_completes() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    let run_at = Utc::now();

    h.scheduler
        .schedule_at(
            &ThingyTimeout {
                saga_id: "saga-gone".into(),
            },
            run_at,
            &cancel,
        )
        .await
        .unwrap();

    h.worker.run_pending(run_at, &cancel).await.unwrap();
    assert_eq!(h.worker.stats().succeeded(), 1);
    assert!(h.queue.drain_dead_letters().await.is_empty());
}

#[tokio::test]
async fn test_timeout_for_saga_of_wrong_type_is_dead_lettered() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    let run_at = Utc::now();

    h.scheduler
        .schedule_at(
            &ThingyTimeout {
                saga_id: "saga-unrelated".into(),
            },
            run_at,
            &cancel,
        )
        .await
        .unwrap();

    h.worker.run_pending(run_at, &cancel).await.unwrap();

    let dead = h.queue.drain_dead_letters().await;
    assert_eq!(dead.len(), 1);
    let last_error = dead[0].metadata.last_error.clone().unwrap();
    assert!(last_error.contains("ThingySaga"), "{}", last_error);
}

#[tokio::test]
async fn test_conflicting_command_is_retried() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    h.handler.failures.store(1, Ordering::SeqCst);

    let command = PingCommand {
        thingy_id: "thingy-1".into(),
    };
    let envelope = JobEnvelope::from_command(&command, &h.registry).unwrap();
    h.queue
        .enqueue(QueuedJob::new(
            eventide_core::jobs::JobMetadata::for_job(&envelope).with_retry_policy(
                RetryPolicy::with_retries(2).with_backoff(eventide_core::jobs::BackoffStrategy::fixed(0)),
            ),
            Job::serialize(&envelope).unwrap(),
            Utc::now(),
        ))
        .await
        .unwrap();

    h.worker.run_pending(Utc::now(), &cancel).await.unwrap();
    assert_eq!(h.worker.stats().retried(), 1);
    assert!(h.handler.received.lock().is_empty());

    h.worker.run_pending(Utc::now(), &cancel).await.unwrap();
    assert_eq!(h.handler.received.lock().len(), 1);
    assert!(h.queue.drain_dead_letters().await.is_empty());
}

#[tokio::test]
async fn test_cancelled_worker_leaves_timeout_queued() {
    let h = harness().await;
    let run_at = Utc::now();

    h.scheduler
        .schedule_at(
            &ThingyTimeout {
                saga_id: "saga-1".into(),
            },
            run_at,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    h.worker.run_pending(run_at, &cancel).await.unwrap();

    let stats = h.queue.stats().await.unwrap();
    assert_eq!((stats.pending, stats.in_flight, stats.dead_letter), (1, 0, 0));
    assert_eq!(h.worker.stats().retried(), 0);
    assert_eq!(saga_timeouts(&h.sagas, "saga-1").await, 0);

    // the next healthy pass delivers it
    h.worker.run_pending(run_at, &CancellationToken::new()).await.unwrap();
    assert_eq!(saga_timeouts(&h.sagas, "saga-1").await, 1);
}

#[tokio::test]
async fn test_envelope_with_unknown_command_is_dead_lettered() {
    let h = harness().await;
    let envelope = JobEnvelope {
        data: "{}".into(),
        name: "Pong".into(),
        version: 1,
        for_saga: false,
    };
    h.queue
        .enqueue(QueuedJob::new(
            eventide_core::jobs::JobMetadata::for_job(&envelope),
            Job::serialize(&envelope).unwrap(),
            Utc::now(),
        ))
        .await
        .unwrap();

    h.worker.run_pending(Utc::now(), &CancellationToken::new()).await.unwrap();

    let dead = h.queue.drain_dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].metadata.attempts, 1);
}
