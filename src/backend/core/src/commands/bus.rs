//! Command bus: where decoded commands are published for handling.

use async_trait::async_trait;
use dashmap::DashMap;
use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ErrorCode, EventideError, Result};

use super::Command;

/// Publishes commands to their handlers.
#[async_trait]
pub trait CommandBus: Send + Sync {
    async fn publish(&self, command: Box<dyn Command>, cancel: &CancellationToken) -> Result<()>;
}

/// Handles one command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn handle(&self, command: &C, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn handle(&self, command: &dyn Command, cancel: &CancellationToken) -> Result<()>;
}

struct Typed<C, H> {
    handler: H,
    _command: PhantomData<fn(C)>,
}

#[async_trait]
impl<C, H> ErasedHandler for Typed<C, H>
where
    C: Command,
    H: CommandHandler<C>,
{
    async fn handle(&self, command: &dyn Command, cancel: &CancellationToken) -> Result<()> {
        let command = command.as_any().downcast_ref::<C>().ok_or_else(|| {
            EventideError::invalid_argument(format!(
                "Command is not of type '{}'",
                std::any::type_name::<C>()
            ))
        })?;
        self.handler.handle(command, cancel).await
    }
}

/// Dispatches commands in-process to the handler registered for their type.
#[derive(Default)]
pub struct InProcessCommandBus {
    handlers: DashMap<TypeId, Arc<dyn ErasedHandler>>,
}

impl InProcessCommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for command type `C`, replacing any previous one.
    pub fn register<C, H>(&self, handler: H)
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.handlers.insert(
            TypeId::of::<C>(),
            Arc::new(Typed {
                handler,
                _command: PhantomData,
            }),
        );
    }
}

#[async_trait]
impl CommandBus for InProcessCommandBus {
    async fn publish(&self, command: Box<dyn Command>, cancel: &CancellationToken) -> Result<()> {
        let handler = self
            .handlers
            .get(&command.as_any().type_id())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                EventideError::new(
                    ErrorCode::CommandNotRegistered,
                    format!("No handler registered for command {}", command.type_name()),
                )
            })?;

        debug!(command = command.type_name(), aggregate_id = %command.aggregate_id(), "Publishing command");
        handler.handle(command.as_ref(), cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AggregateId;
    use std::any::Any;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Ping;

    impl Command for Ping {
        fn aggregate_id(&self) -> AggregateId {
            AggregateId::new("thingy-1")
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct CountingHandler(Arc<AtomicU32>);

    #[async_trait]
    impl CommandHandler<Ping> for CountingHandler {
        async fn handle(&self, _command: &Ping, _cancel: &CancellationToken) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_handler() {
        let count = Arc::new(AtomicU32::new(0));
        let bus = InProcessCommandBus::new();
        bus.register::<Ping, _>(CountingHandler(count.clone()));

        bus.publish(Box::new(Ping), &CancellationToken::new()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_without_handler() {
        let bus = InProcessCommandBus::new();
        let err = bus.publish(Box::new(Ping), &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommandNotRegistered);
    }
}
