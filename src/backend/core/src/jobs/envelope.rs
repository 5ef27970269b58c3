//! The job that carries a scheduled command.
//!
//! A command is stored as JSON text next to the `(name, version)` it was
//! registered under. When the job fires the command is rebuilt through the
//! `CommandRegistry` and either published on the command bus or, for saga
//! timeouts, handed to saga dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::commands::{Command, CommandRegistry, DecodedCommand};
use crate::error::{ErrorCode, Result};

use super::{Job, JobContext, JobError, JobResult};

/// Serialized command awaiting publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Command as JSON text.
    pub data: String,
    /// Registered command name.
    pub name: String,
    /// Registered command version.
    pub version: u32,
    /// Deliver to saga timeout dispatch instead of the command bus.
    pub for_saga: bool,
}

impl JobEnvelope {
    pub const JOB_NAME: &'static str = "PublishCommand";
    pub const JOB_VERSION: u32 = 1;

    /// Wrap `command` using its registered name, version and capability.
    pub fn from_command<C>(command: &C, registry: &CommandRegistry) -> Result<Self>
    where
        C: Command + Serialize,
    {
        let definition = registry.definition_of::<C>()?;
        Ok(Self {
            data: serde_json::to_string(command)?,
            name: definition.name.clone(),
            version: definition.version,
            for_saga: definition.is_saga_timeout(),
        })
    }
}

#[async_trait]
impl Job for JobEnvelope {
    fn name(&self) -> &'static str {
        Self::JOB_NAME
    }

    fn version(&self) -> u32 {
        Self::JOB_VERSION
    }

    fn serialize(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let services = &ctx.services;
        let decoded = services
            .commands
            .decode(&self.name, self.version, &self.data)
            .map_err(JobError::fatal_from)?;

        match (self.for_saga, decoded) {
            (true, DecodedCommand::SagaTimeout(timeout)) => {
                debug!(command = %self.name, saga_id = %timeout.saga_id(), "Dispatching saga timeout");
                services.sagas.process_timeout(timeout, &ctx.cancellation).await?;
            }
            (true, DecodedCommand::Command(command)) => {
                return Err(JobError::fatal(format!(
                    "Command '{}' v{} ({}) was scheduled for a saga but is not a saga timeout",
                    self.name,
                    self.version,
                    command.type_name()
                ))
                .with_code(ErrorCode::InvalidArgument.to_string()));
            }
            (false, DecodedCommand::Command(command)) => {
                debug!(command = %self.name, aggregate_id = %command.aggregate_id(), "Publishing scheduled command");
                services.command_bus.publish(command, &ctx.cancellation).await?;
            }
            (false, DecodedCommand::SagaTimeout(timeout)) => {
                services
                    .command_bus
                    .publish(timeout.into_command(), &ctx.cancellation)
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandBus, InProcessCommandBus};
    use crate::events::AggregateId;
    use crate::jobs::{JobMetadata, JobServices};
    use crate::sagas::timeout::tests::{ReminderSaga, ReminderTimeout};
    use crate::sagas::{DispatchToSagas, InMemorySagaStore, SagaId, SagaStore, SagaTimeoutDispatcher};
    use std::any::Any;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

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

    fn registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry.register::<PingCommand>("Ping", 3).unwrap();
        registry.register_saga_timeout::<ReminderTimeout>("Reminder", 1).unwrap();
        registry
    }

    #[test]
    fn test_envelope_from_command() {
        let registry = registry();

        let envelope = JobEnvelope::from_command(
            &PingCommand {
                thingy_id: "thingy-1".into(),
            },
            &registry,
        )
        .unwrap();
        assert_eq!(envelope.name, "Ping");
        assert_eq!(envelope.version, 3);
        assert!(!envelope.for_saga);
        assert_eq!(envelope.data, r#"{"thingy_id":"thingy-1"}"#);

        let envelope = JobEnvelope::from_command(
            &ReminderTimeout {
                saga_id: "saga-1".into(),
            },
            &registry,
        )
        .unwrap();
        assert_eq!(envelope.name, "Reminder");
        assert!(envelope.for_saga);
    }

    #[test]
    fn test_unregistered_command_cannot_be_wrapped() {
        let err = JobEnvelope::from_command(
            &PingCommand {
                thingy_id: "thingy-1".into(),
            },
            &CommandRegistry::new(),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommandNotRegistered);
    }

    async fn context() -> (JobContext, Arc<InMemorySagaStore>) {
        let store = Arc::new(InMemorySagaStore::new());
        store
            .insert(Box::new(ReminderSaga {
                id: SagaId::new("saga-1"),
                reminders: 0,
            }))
            .await
            .unwrap();

        let mut dispatcher = SagaTimeoutDispatcher::new(store.clone());
        dispatcher.register::<ReminderSaga, ReminderTimeout>().unwrap();

        let services = JobServices {
            commands: Arc::new(registry()),
            command_bus: Arc::new(InProcessCommandBus::new()) as Arc<dyn CommandBus>,
            sagas: Arc::new(dispatcher) as Arc<dyn DispatchToSagas>,
        };
        let ctx = JobContext::new(
            JobMetadata::new(JobEnvelope::JOB_NAME, JobEnvelope::JOB_VERSION),
            CancellationToken::new(),
            Arc::new(services),
        );
        (ctx, store)
    }

    #[tokio::test]
    async fn test_saga_envelope_reaches_saga() {
        let (ctx, store) = context().await;
        let envelope = JobEnvelope {
            data: r#"{"saga_id":"saga-1"}"#.into(),
            name: "Reminder".into(),
            version: 1,
            for_saga: true,
        };

        envelope.execute(&ctx).await.unwrap();

        let handle = store.get(&SagaId::new("saga-1")).await.unwrap().unwrap();
        let saga = handle.lock().await;
        assert_eq!(saga.as_any().downcast_ref::<ReminderSaga>().unwrap().reminders, 1);
    }

    #[tokio::test]
    async fn test_ordinary_command_marked_for_saga_is_fatal() {
        let (ctx, _) = context().await;
        let envelope = JobEnvelope {
            data: r#"{"thingy_id":"thingy-1"}"#.into(),
            name: "Ping".into(),
            version: 3,
            for_saga: true,
        };

        let err = envelope.execute(&ctx).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.code, Some(ErrorCode::InvalidArgument.to_string()));
    }

    #[tokio::test]
    async fn test_unknown_command_is_fatal() {
        let (ctx, _) = context().await;
        let envelope = JobEnvelope {
            data: "{}".into(),
            name: "Pong".into(),
            version: 1,
            for_saga: false,
        };

        let err = envelope.execute(&ctx).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.code, Some(ErrorCode::CommandNotRegistered.to_string()));
    }
}
