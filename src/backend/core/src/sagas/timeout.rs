//! Saga timeouts and the typed handlers that receive them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;

use crate::commands::Command;
use crate::error::{EventideError, Result};

use super::{Saga, SagaId};

/// A command addressed to a saga rather than to an aggregate.
///
/// Registered with `CommandRegistry::register_saga_timeout`, which marks
/// scheduled envelopes of this type for saga delivery.
pub trait SagaTimeout: Command {
    fn saga_id(&self) -> SagaId;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    /// The timeout as a plain command, for publishing on the bus.
    fn into_command(self: Box<Self>) -> Box<dyn Command>;
}

/// What a saga sees while handling a timeout.
#[derive(Debug, Clone)]
pub struct SagaContext {
    pub saga_id: SagaId,
    pub cancellation: CancellationToken,
    pub received_at: DateTime<Utc>,
}

impl SagaContext {
    pub fn new(saga_id: SagaId, cancellation: CancellationToken) -> Self {
        Self {
            saga_id,
            cancellation,
            received_at: Utc::now(),
        }
    }
}

/// Implemented by a saga for each timeout type it handles.
#[async_trait]
pub trait SagaTimeoutHandler<T: SagaTimeout>: Saga {
    async fn handle_timeout(&mut self, timeout: T, ctx: &SagaContext) -> Result<()>;
}

/// Type-erased delivery of one timeout type to one saga type.
#[async_trait]
pub trait SagaTimeoutProcessor: Send + Sync {
    async fn process(&self, saga: &mut dyn Saga, timeout: Box<dyn SagaTimeout>, ctx: &SagaContext) -> Result<()>;
}

/// Delivers timeouts of type `T` to sagas of type `S`.
///
/// A timeout that is not a `T`, or a saga that is not an `S`, is rejected with
/// `InvalidArgument` naming the expected type.
pub struct SagaTimeoutUpdater<S, T> {
    _types: PhantomData<fn(S, T)>,
}

impl<S, T> SagaTimeoutUpdater<S, T> {
    pub fn new() -> Self {
        Self { _types: PhantomData }
    }
}

impl<S, T> Default for SagaTimeoutUpdater<S, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S, T> SagaTimeoutProcessor for SagaTimeoutUpdater<S, T>
where
    S: SagaTimeoutHandler<T>,
    T: SagaTimeout,
{
    async fn process(&self, saga: &mut dyn Saga, timeout: Box<dyn SagaTimeout>, ctx: &SagaContext) -> Result<()> {
        let timeout_type = timeout.type_name();
        let timeout = timeout.into_any().downcast::<T>().map_err(|_| {
            EventideError::invalid_argument(format!(
                "Saga timeout is not of type '{}'",
                std::any::type_name::<T>()
            ))
            .with_context("actual_type", timeout_type)
        })?;

        let saga_type = saga.type_name();
        let saga = saga.as_any_mut().downcast_mut::<S>().ok_or_else(|| {
            EventideError::invalid_argument(format!("Saga is not of type '{}'", std::any::type_name::<S>()))
                .with_context("actual_type", saga_type)
        })?;

        saga.handle_timeout(*timeout, ctx).await
    }
}
