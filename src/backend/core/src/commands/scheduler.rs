//! Scheduling commands for later publication.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::jobs::{due_after, JobEnvelope, JobId, JobScheduler};

use super::{Command, CommandRegistry};

/// Wraps commands in a `JobEnvelope` and submits them to the job substrate.
#[derive(Clone)]
pub struct CommandScheduler {
    jobs: Arc<dyn JobScheduler>,
    registry: Arc<CommandRegistry>,
}

impl CommandScheduler {
    pub fn new(jobs: Arc<dyn JobScheduler>, registry: Arc<CommandRegistry>) -> Self {
        Self { jobs, registry }
    }

    /// Publish `command` at `run_at`.
    ///
    /// Saga timeouts are marked for saga delivery according to their registration.
    #[instrument(skip(self, command, cancel), fields(command = command.type_name(), aggregate_id = %command.aggregate_id()))]
    pub async fn schedule_at<C>(&self, command: &C, run_at: DateTime<Utc>, cancel: &CancellationToken) -> Result<JobId>
    where
        C: Command + Serialize,
    {
        let envelope = JobEnvelope::from_command(command, &self.registry)?;
        let job_id = self.jobs.schedule(&envelope, run_at, cancel).await?;

        debug!(
            job_id = %job_id,
            name = %envelope.name,
            version = envelope.version,
            for_saga = envelope.for_saga,
            "Command scheduled"
        );
        Ok(job_id)
    }

    /// Publish `command` once `delay` has elapsed.
    pub async fn schedule_after<C>(&self, command: &C, delay: Duration, cancel: &CancellationToken) -> Result<JobId>
    where
        C: Command + Serialize,
    {
        let run_at = due_after(Utc::now(), delay)?;
        self.schedule_at(command, run_at, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AggregateId;
    use crate::jobs::JobQueue;
    use serde::Deserialize;
    use std::any::Any;

    #[derive(Debug, Serialize, Deserialize)]
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

    #[tokio::test]
    async fn test_schedule_at_enqueues_envelope() {
        let mut registry = CommandRegistry::new();
        registry.register::<PingCommand>("Ping", 1).unwrap();
        let queue = Arc::new(JobQueue::in_memory());
        let scheduler = CommandScheduler::new(queue.clone(), Arc::new(registry));

        let run_at = Utc::now() + chrono::Duration::minutes(1);
        let command = PingCommand {
            thingy_id: "thingy-1".into(),
        };
        scheduler
            .schedule_at(&command, run_at, &CancellationToken::new())
            .await
            .unwrap();

        assert!(queue.pop_due(Utc::now(), 10).await.unwrap().is_empty());
        let queued = queue.pop_due(run_at, 10).await.unwrap();
        assert_eq!(queued.len(), 1);

        let envelope: JobEnvelope = serde_json::from_value(queued[0].data.clone()).unwrap();
        assert_eq!(envelope.name, "Ping");
        assert!(!envelope.for_saga);
    }
}
