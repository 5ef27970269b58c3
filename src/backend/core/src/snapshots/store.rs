//! Snapshot storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::AggregateId;

use super::Snapshot;

/// A snapshot together with the aggregate position it was taken at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub aggregate_id: AggregateId,

    /// Sequence number of the last event folded into the snapshot.
    pub aggregate_sequence_number: u64,

    pub snapshot: Snapshot,

    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, aggregate_id: &AggregateId) -> Result<Option<StoredSnapshot>>;

    async fn put(&self, snapshot: StoredSnapshot) -> Result<()>;

    async fn delete(&self, aggregate_id: &AggregateId) -> Result<()>;
}

/// Latest snapshot per aggregate, kept in memory.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: DashMap<AggregateId, StoredSnapshot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(&self, aggregate_id: &AggregateId) -> Result<Option<StoredSnapshot>> {
        Ok(self.snapshots.get(aggregate_id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, snapshot: StoredSnapshot) -> Result<()> {
        self.snapshots.insert(snapshot.aggregate_id.clone(), snapshot);
        Ok(())
    }

    async fn delete(&self, aggregate_id: &AggregateId) -> Result<()> {
        self.snapshots.remove(aggregate_id);
        Ok(())
    }
}
