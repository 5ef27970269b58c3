//! Aggregate trait and loader for event-sourced state reconstruction.
//!
//! Aggregates are domain objects rebuilt from a stream of events. Each aggregate
//! implements `Default` (empty state) and `apply` (fold an event). Loading starts
//! from the latest snapshot, if any, after running it through the upgrade chain.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::snapshots::{Snapshot, SnapshotStore, SnapshotUpgradeChain, StoredSnapshot};

use super::event::{AggregateId, CommittedEvent, EventMetadata};
use super::persistence::EventPersistence;

// =============================================================================
// Aggregate Trait
// =============================================================================

/// Trait for aggregates that can be reconstructed from committed events.
///
/// Given the same snapshot and event stream the resulting state is deterministic.
pub trait Aggregate: Default + Send {
    /// Name used in log event types (`"{name}.{event}.{version}"`).
    const AGGREGATE_NAME: &'static str;

    /// Version of the snapshot state this aggregate produces.
    const SNAPSHOT_VERSION: u32;

    /// Snapshot state at `SNAPSHOT_VERSION`.
    type SnapshotState: Serialize + DeserializeOwned;

    /// Fold a single committed event into the state.
    fn apply(&mut self, event: &CommittedEvent) -> Result<()>;

    fn restore(&mut self, state: Self::SnapshotState);

    fn snapshot_state(&self) -> Self::SnapshotState;

    /// Metadata for a new event of this aggregate at `aggregate_sequence_number`.
    fn event_metadata(
        aggregate_id: &AggregateId,
        event_name: &str,
        event_version: u32,
        aggregate_sequence_number: u64,
    ) -> EventMetadata {
        EventMetadata::new(
            aggregate_id.clone(),
            Self::AGGREGATE_NAME,
            event_name,
            event_version,
            aggregate_sequence_number,
        )
    }
}

/// An aggregate together with the sequence number it was rebuilt up to.
#[derive(Debug)]
pub struct Rehydrated<A> {
    pub aggregate: A,

    /// Sequence number of the last event folded in. Zero for a new aggregate.
    pub version: u64,

    /// Versions the restored snapshot was upgraded from, if one was used.
    pub snapshot_history: Vec<u32>,
}

// =============================================================================
// Aggregate Loader
// =============================================================================

/// Rebuilds aggregates of type `A` from snapshots and events.
pub struct AggregateLoader<A: Aggregate> {
    persistence: EventPersistence,
    snapshots: Arc<dyn SnapshotStore>,
    upgrades: SnapshotUpgradeChain,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> AggregateLoader<A> {
    pub fn new(persistence: EventPersistence, snapshots: Arc<dyn SnapshotStore>, upgrades: SnapshotUpgradeChain) -> Self {
        Self {
            persistence,
            snapshots,
            upgrades,
            _aggregate: PhantomData,
        }
    }

    /// Restore the latest snapshot (upgraded to the current version) and replay
    /// the events committed after it.
    #[instrument(skip(self, cancel), fields(aggregate = A::AGGREGATE_NAME, aggregate_id = %aggregate_id))]
    pub async fn load(&self, aggregate_id: &AggregateId, cancel: &CancellationToken) -> Result<Rehydrated<A>> {
        let mut aggregate = A::default();
        let mut version = 0;
        let mut snapshot_history = Vec::new();

        if let Some(stored) = self.snapshots.get(aggregate_id).await? {
            let snapshot = self.upgrades.upgrade(stored.snapshot)?;
            let state: A::SnapshotState = serde_json::from_value(snapshot.state)?;
            aggregate.restore(state);
            version = stored.aggregate_sequence_number;
            snapshot_history = snapshot.previous_versions;
            debug!(version, "Restored aggregate from snapshot");
        }

        let events = self
            .persistence
            .load_committed_events(aggregate_id, version + 1, cancel)
            .await?;

        for event in &events {
            aggregate.apply(event)?;
            version = event.aggregate_sequence_number;
        }

        debug!(version, replayed = events.len(), "Aggregate loaded");

        Ok(Rehydrated {
            aggregate,
            version,
            snapshot_history,
        })
    }

    /// Permanently delete the aggregate: its snapshot first, then its events.
    ///
    /// A later `load` starts from an empty aggregate at version 0.
    #[instrument(skip(self, cancel), fields(aggregate = A::AGGREGATE_NAME, aggregate_id = %aggregate_id))]
    pub async fn delete(&self, aggregate_id: &AggregateId, cancel: &CancellationToken) -> Result<()> {
        self.snapshots.delete(aggregate_id).await?;
        self.persistence.delete_events(aggregate_id, cancel).await
    }

    /// Store a snapshot of `aggregate` taken at `version`.
    pub async fn save_snapshot(&self, aggregate_id: &AggregateId, aggregate: &A, version: u64) -> Result<()> {
        let state = serde_json::to_value(aggregate.snapshot_state())?;
        self.snapshots
            .put(StoredSnapshot {
                aggregate_id: aggregate_id.clone(),
                aggregate_sequence_number: version,
                snapshot: Snapshot::new(A::SNAPSHOT_VERSION, state),
                created_at: Utc::now(),
            })
            .await
    }
}
