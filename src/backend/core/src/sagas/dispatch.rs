//! Routing of fired saga timeouts to the saga they address.

use async_trait::async_trait;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{EventideError, Result};

use super::{SagaContext, SagaStore, SagaTimeout, SagaTimeoutHandler, SagaTimeoutProcessor, SagaTimeoutUpdater};

/// Delivers saga timeouts.
#[async_trait]
pub trait DispatchToSagas: Send + Sync {
    async fn process_timeout(&self, timeout: Box<dyn SagaTimeout>, cancel: &CancellationToken) -> Result<()>;
}

/// Resolves the addressed saga from a `SagaStore` and hands it the timeout
/// through the processor registered for the timeout's type.
pub struct SagaTimeoutDispatcher {
    store: Arc<dyn SagaStore>,
    processors: HashMap<TypeId, Arc<dyn SagaTimeoutProcessor>>,
}

impl SagaTimeoutDispatcher {
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self {
            store,
            processors: HashMap::new(),
        }
    }

    /// Route timeouts of type `T` to sagas of type `S`.
    pub fn register<S, T>(&mut self) -> Result<&mut Self>
    where
        S: SagaTimeoutHandler<T>,
        T: SagaTimeout,
    {
        if self.processors.contains_key(&TypeId::of::<T>()) {
            return Err(EventideError::invalid_argument(format!(
                "A saga is already registered for timeout type '{}'",
                std::any::type_name::<T>()
            )));
        }

        self.processors
            .insert(TypeId::of::<T>(), Arc::new(SagaTimeoutUpdater::<S, T>::new()));
        Ok(self)
    }
}

#[async_trait]
impl DispatchToSagas for SagaTimeoutDispatcher {
    #[instrument(skip_all, fields(timeout = timeout.type_name(), saga_id = %timeout.saga_id()))]
    async fn process_timeout(&self, timeout: Box<dyn SagaTimeout>, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(EventideError::cancelled("process_timeout"));
        }

        let processor = self
            .processors
            .get(&timeout.as_any().type_id())
            .cloned()
            .ok_or_else(|| {
                EventideError::invalid_argument(format!(
                    "No saga registered for timeout type '{}'",
                    timeout.type_name()
                ))
            })?;

        let saga_id = timeout.saga_id();
        let Some(handle) = self.store.get(&saga_id).await? else {
            warn!("Saga not found, dropping timeout");
            return Ok(());
        };

        let mut saga = handle.lock().await;
        let ctx = SagaContext::new(saga_id, cancel.clone());
        processor.process(&mut **saga, timeout, &ctx).await?;

        debug!("Saga timeout handled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sagas::timeout::tests::{ExpiryTimeout, OtherSaga, ReminderSaga, ReminderTimeout};
    use crate::sagas::{InMemorySagaStore, SagaId};

    fn reminder(saga_id: &str) -> Box<dyn SagaTimeout> {
        Box::new(ReminderTimeout {
            saga_id: saga_id.to_string(),
        })
    }

    async fn reminders(store: &InMemorySagaStore, id: &str) -> u32 {
        let handle = store.get(&SagaId::new(id)).await.unwrap().unwrap();
        let saga = handle.lock().await;
        saga.as_any().downcast_ref::<ReminderSaga>().unwrap().reminders
    }

    #[tokio::test]
    async fn test_timeout_reaches_saga() {
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

        dispatcher
            .process_timeout(reminder("saga-1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reminders(&store, "saga-1").await, 1);
    }

    #[tokio::test]
    async fn test_missing_saga_is_skipped() {
        let mut dispatcher = SagaTimeoutDispatcher::new(Arc::new(InMemorySagaStore::new()));
        dispatcher.register::<ReminderSaga, ReminderTimeout>().unwrap();

        dispatcher
            .process_timeout(reminder("saga-404"), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_timeout_type() {
        let dispatcher = SagaTimeoutDispatcher::new(Arc::new(InMemorySagaStore::new()));
        let timeout = Box::new(ExpiryTimeout {
            saga_id: "saga-1".into(),
        });

        let err = dispatcher
            .process_timeout(timeout, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_saga_of_wrong_type() {
        let store = Arc::new(InMemorySagaStore::new());
        store
            .insert(Box::new(OtherSaga {
                id: SagaId::new("saga-1"),
            }))
            .await
            .unwrap();

        let mut dispatcher = SagaTimeoutDispatcher::new(store);
        dispatcher.register::<ReminderSaga, ReminderTimeout>().unwrap();

        let err = dispatcher
            .process_timeout(reminder("saga-1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(err.user_message().contains("ReminderSaga"));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut dispatcher = SagaTimeoutDispatcher::new(Arc::new(InMemorySagaStore::new()));
        dispatcher.register::<ReminderSaga, ReminderTimeout>().unwrap();
        assert!(dispatcher.register::<ReminderSaga, ReminderTimeout>().is_err());
    }
}
