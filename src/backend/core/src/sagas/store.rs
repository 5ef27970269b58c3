//! Saga storage.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{EventideError, Result};

use super::{Saga, SagaId};

/// Shared, exclusively lockable saga instance.
pub type SagaHandle = Arc<Mutex<Box<dyn Saga>>>;

#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn get(&self, saga_id: &SagaId) -> Result<Option<SagaHandle>>;

    /// Add a new saga. Fails if one with the same id exists.
    async fn insert(&self, saga: Box<dyn Saga>) -> Result<SagaHandle>;
}

/// Sagas kept in memory.
///
/// ```
/// # use eventide_core::sagas::{InMemorySagaStore, SagaId, SagaStore};
/// # tokio_test::block_on(async {
/// let store = InMemorySagaStore::new();
/// assert!(store.get(&SagaId::new("order-7")).await.unwrap().is_none());
/// # });
/// ```
#[derive(Default)]
pub struct InMemorySagaStore {
    sagas: DashMap<SagaId, SagaHandle>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn get(&self, saga_id: &SagaId) -> Result<Option<SagaHandle>> {
        Ok(self.sagas.get(saga_id).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, saga: Box<dyn Saga>) -> Result<SagaHandle> {
        let saga_id = saga.saga_id().clone();
        match self.sagas.entry(saga_id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(EventideError::invalid_argument(format!(
                "Saga {} already exists",
                entry.key()
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let handle: SagaHandle = Arc::new(Mutex::new(saga));
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sagas::timeout::tests::ReminderSaga;

    #[test]
    fn test_insert_and_get() {
        tokio_test::block_on(async {
            let store = InMemorySagaStore::new();
            store
                .insert(Box::new(ReminderSaga {
                    id: SagaId::new("saga-1"),
                    reminders: 0,
                }))
                .await
                .unwrap();

            assert_eq!(store.len(), 1);
            let handle = store.get(&SagaId::new("saga-1")).await.unwrap().unwrap();
            assert_eq!(handle.lock().await.saga_id().as_str(), "saga-1");
        });
    }

    #[test]
    fn test_duplicate_insert() {
        tokio_test::block_on(async {
            let store = InMemorySagaStore::new();
            let saga = || {
                Box::new(ReminderSaga {
                    id: SagaId::new("saga-1"),
                    reminders: 0,
                })
            };
            store.insert(saga()).await.unwrap();
            assert!(store.insert(saga()).await.is_err());
        });
    }
}
