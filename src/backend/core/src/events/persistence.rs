//! Event persistence engine.
//!
//! Maps aggregate-level operations onto an [`EventLog`]:
//! - committing batches of events with an optimistic-concurrency precondition
//! - reading an aggregate's events back, optionally bounded
//! - paging the global log with an anchor-based cursor
//! - tombstoning aggregates

use metrics::counter;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::error::{ErrorCode, EventideError, Result};

use super::event::{AggregateId, AllCommittedEventsPage, CommittedEvent, SerializedEvent};
use super::log::{EventData, EventLog, ExpectedRevision, LogError, RecordedEvent};
use super::position::{GlobalPosition, LogPosition};

/// Prefix marking system streams and system event types.
pub const DEFAULT_SYSTEM_PREFIX: &str = "$";

/// States of the global read loop.
#[derive(Debug)]
enum PageState {
    /// Next page is read starting at this position.
    Fetching(LogPosition),
    /// A page was read; `candidates` are yet to be filtered, `next` is where to continue.
    HasCandidates {
        candidates: Vec<RecordedEvent>,
        next: LogPosition,
    },
    /// Nothing left to read; carries the final cursor.
    Exhausted(LogPosition),
}

/// Aggregate-facing persistence over a backing event log.
#[derive(Clone)]
pub struct EventPersistence {
    log: Arc<dyn EventLog>,
    system_prefix: String,
}

impl EventPersistence {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            system_prefix: DEFAULT_SYSTEM_PREFIX.to_string(),
        }
    }

    /// Override the reserved prefix used to recognise system records.
    pub fn with_system_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.system_prefix = prefix.into();
        self
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Atomically append a batch to an aggregate's stream.
    ///
    /// The batch must be non-empty and numbered contiguously. The expected prior
    /// revision is derived from the lowest sequence number, so a concurrent writer
    /// that got there first makes this fail with `OptimisticConcurrency` and
    /// nothing is written. Conflicts are never retried here.
    #[instrument(skip(self, events, cancel), fields(aggregate_id = %aggregate_id, count = events.len()))]
    pub async fn commit_events(
        &self,
        aggregate_id: &AggregateId,
        events: Vec<SerializedEvent>,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>> {
        let first_sequence_number = validate_batch(&events)?;
        let expected = expected_revision(first_sequence_number);

        let metadata = events
            .iter()
            .map(|event| serde_json::to_string(&event.metadata))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let records = events
            .iter()
            .zip(&metadata)
            .map(|(event, metadata)| EventData {
                // Fresh id per record; reusing the metadata id would hide conflicts.
                event_id: Uuid::new_v4(),
                event_type: event.metadata.log_event_type(),
                data: event.data.clone(),
                metadata: metadata.clone(),
            })
            .collect();

        // Once submitted, an append is not abandoned.
        if cancel.is_cancelled() {
            return Err(EventideError::cancelled("commit_events"));
        }

        let result = match self
            .log
            .append_to_stream(aggregate_id.as_str(), expected, records)
            .await
        {
            Ok(result) => result,
            Err(err @ LogError::WrongExpectedVersion { .. }) => {
                counter!("eventide_concurrency_conflicts_total").increment(1);
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        trace!(
            aggregate_id = %aggregate_id,
            version = result.current_revision + 1,
            commit_position = result.log_position().commit,
            prepare_position = result.log_position().prepare,
            "Wrote events to the event log"
        );
        counter!("eventide_events_committed_total").increment(events.len() as u64);

        Ok(events
            .into_iter()
            .zip(metadata)
            .zip(result.positions)
            .map(|((event, metadata), position)| CommittedEvent {
                aggregate_id: aggregate_id.clone(),
                aggregate_sequence_number: event.aggregate_sequence_number,
                data: event.data,
                metadata,
                global_position: position.into(),
            })
            .collect())
    }

    /// Load an aggregate's events starting at `from_sequence_number`.
    #[instrument(skip(self, cancel), fields(aggregate_id = %aggregate_id))]
    pub async fn load_committed_events(
        &self,
        aggregate_id: &AggregateId,
        from_sequence_number: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>> {
        let records = self.read_stream(aggregate_id, from_sequence_number, cancel).await?;
        Ok(records.into_iter().map(|record| to_committed(aggregate_id, record)).collect())
    }

    /// Load an aggregate's events numbered `from_sequence_number..=to_sequence_number`.
    #[instrument(skip(self, cancel), fields(aggregate_id = %aggregate_id))]
    pub async fn load_committed_events_range(
        &self,
        aggregate_id: &AggregateId,
        from_sequence_number: u64,
        to_sequence_number: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<CommittedEvent>> {
        let records = self.read_stream(aggregate_id, from_sequence_number, cancel).await?;
        Ok(records
            .into_iter()
            .filter(|record| record.revision < to_sequence_number)
            .map(|record| to_committed(aggregate_id, record))
            .collect())
    }

    /// Read every non-system event from `position` to the end of the log.
    ///
    /// Pages of `page_size + 1` records are read; the last record of each page
    /// is the anchor where the next page starts and is not returned with the
    /// current one. A page with a single record has no anchor and ends the read.
    /// System records are dropped but still move the cursor forward.
    #[instrument(skip(self, cancel), fields(position = %position))]
    pub async fn load_all_committed_events(
        &self,
        position: &GlobalPosition,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> Result<AllCommittedEventsPage> {
        if page_size == 0 {
            return Err(EventideError::invalid_argument("Page size must be at least 1"));
        }
        let read_count = page_size
            .checked_add(1)
            .ok_or_else(|| EventideError::invalid_argument(format!("Page size {} is too large", page_size)))?;

        let mut state = PageState::Fetching(position.position()?);
        let mut events = Vec::new();
        let mut pages = 0usize;

        let final_position = loop {
            state = match state {
                PageState::Fetching(from) if from.is_end() => PageState::Exhausted(LogPosition::END),
                PageState::Fetching(from) => {
                    let read = self.log.read_all(from, read_count);
                    let mut page = cancellable(cancel, "load_all_committed_events", read).await?;
                    pages += 1;

                    let anchor = if page.len() > 1 { page.pop() } else { None };
                    match (page.is_empty(), anchor) {
                        (true, _) => PageState::Exhausted(LogPosition::END),
                        (false, Some(anchor)) => PageState::HasCandidates {
                            candidates: page,
                            next: anchor.position,
                        },
                        (false, None) => PageState::HasCandidates {
                            candidates: page,
                            next: LogPosition::END,
                        },
                    }
                }
                PageState::HasCandidates { candidates, next } => {
                    let before = events.len();
                    events.extend(
                        candidates
                            .into_iter()
                            .filter(|record| !self.is_system_record(record))
                            .map(|record| {
                                let aggregate_id = AggregateId::new(record.stream_id.clone());
                                to_committed(&aggregate_id, record)
                            }),
                    );
                    debug!(
                        page = pages,
                        kept = events.len() - before,
                        next = %next,
                        "Read page of the global log"
                    );

                    if next.is_end() {
                        PageState::Exhausted(next)
                    } else {
                        PageState::Fetching(next)
                    }
                }
                PageState::Exhausted(final_position) => break final_position,
            };
        };

        Ok(AllCommittedEventsPage {
            next_global_position: final_position.into(),
            events,
        })
    }

    /// Tombstone an aggregate. Deleting an already deleted aggregate succeeds.
    #[instrument(skip(self, cancel), fields(aggregate_id = %aggregate_id))]
    pub async fn delete_events(&self, aggregate_id: &AggregateId, cancel: &CancellationToken) -> Result<()> {
        let tombstone = self.log.tombstone(aggregate_id.as_str());
        match cancellable(cancel, "delete_events", tombstone).await {
            Ok(()) => {
                debug!(aggregate_id = %aggregate_id, "Aggregate tombstoned");
                Ok(())
            }
            Err(err) if err.code() == ErrorCode::StreamDeleted => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_sequence_number: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecordedEvent>> {
        let from_revision = from_sequence_number.saturating_sub(1);

        let read = self.log.read_stream(aggregate_id.as_str(), from_revision);
        match cancellable(cancel, "load_committed_events", read).await {
            Ok(records) => Ok(records),
            Err(err) if is_missing_stream(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    fn is_system_record(&self, record: &RecordedEvent) -> bool {
        record.stream_id.starts_with(&self.system_prefix)
            || record.event_type.starts_with(&self.system_prefix)
    }
}

/// Expected prior revision for a batch starting at `first_sequence_number`.
///
/// Sequence numbers are 1-based and revisions 0-based, so the revision before
/// the batch is `first_sequence_number - 2`; below zero means "no stream".
pub fn expected_revision(first_sequence_number: u64) -> ExpectedRevision {
    match first_sequence_number.checked_sub(2) {
        Some(revision) => ExpectedRevision::Exact(revision),
        None => ExpectedRevision::NoStream,
    }
}

fn validate_batch(events: &[SerializedEvent]) -> Result<u64> {
    let first = events
        .first()
        .ok_or_else(|| EventideError::invalid_argument("Cannot commit an empty batch of events"))?
        .aggregate_sequence_number;

    if first == 0 {
        return Err(EventideError::invalid_argument("Aggregate sequence numbers start at 1"));
    }

    for (offset, event) in events.iter().enumerate() {
        if event.aggregate_sequence_number != first + offset as u64 {
            return Err(EventideError::invalid_argument(format!(
                "Events must be numbered contiguously: expected sequence number {}, got {}",
                first + offset as u64,
                event.aggregate_sequence_number
            )));
        }
    }

    Ok(first)
}

fn to_committed(aggregate_id: &AggregateId, record: RecordedEvent) -> CommittedEvent {
    CommittedEvent {
        aggregate_id: aggregate_id.clone(),
        aggregate_sequence_number: record.revision.saturating_add(1),
        data: record.data,
        metadata: record.metadata,
        global_position: record.position.into(),
    }
}

fn is_missing_stream(err: &EventideError) -> bool {
    matches!(err.code(), ErrorCode::StreamNotFound | ErrorCode::StreamDeleted)
}

/// Race a log call against cancellation.
async fn cancellable<T, F>(cancel: &CancellationToken, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, LogError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EventideError::cancelled(operation)),
        result = fut => result.map_err(EventideError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::EventMetadata;
    use crate::events::memory::InMemoryEventLog;

    fn batch(aggregate_id: &str, sequence_numbers: &[u64]) -> Vec<SerializedEvent> {
        sequence_numbers
            .iter()
            .map(|&seq| {
                let metadata = EventMetadata::new(aggregate_id.into(), "thingy", "ping", 1, seq);
                SerializedEvent::new(&serde_json::json!({ "seq": seq }), metadata).unwrap()
            })
            .collect()
    }

    fn persistence() -> (Arc<InMemoryEventLog>, EventPersistence) {
        let log = Arc::new(InMemoryEventLog::new());
        (log.clone(), EventPersistence::new(log))
    }

    #[test]
    fn test_expected_revision_from_first_sequence_number() {
        assert_eq!(expected_revision(1), ExpectedRevision::NoStream);
        assert_eq!(expected_revision(2), ExpectedRevision::Exact(0));
        assert_eq!(expected_revision(4), ExpectedRevision::Exact(2));
    }

    #[tokio::test]
    async fn test_commit_rejects_empty_and_gapped_batches() {
        let (_, persistence) = persistence();
        let cancel = CancellationToken::new();
        let id = AggregateId::new("thingy-1");

        let err = persistence.commit_events(&id, Vec::new(), &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = persistence
            .commit_events(&id, batch("thingy-1", &[1, 3]), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_commit_records_log_event_type() {
        let (log, persistence) = persistence();
        let cancel = CancellationToken::new();
        let id = AggregateId::new("thingy-1");

        persistence
            .commit_events(&id, batch("thingy-1", &[1]), &cancel)
            .await
            .unwrap();

        let records = log.read_stream("thingy-1", 0).await.unwrap();
        assert_eq!(records[0].event_type, "thingy.ping.1");
    }

    #[tokio::test]
    async fn test_commit_uses_fresh_record_ids() {
        let (log, persistence) = persistence();
        let cancel = CancellationToken::new();
        let id = AggregateId::new("thingy-1");
        let events = batch("thingy-1", &[1]);
        let metadata_id = events[0].metadata.event_id;

        persistence.commit_events(&id, events, &cancel).await.unwrap();

        let records = log.read_stream("thingy-1", 0).await.unwrap();
        assert_ne!(records[0].event_id, metadata_id.0);
    }

    #[tokio::test]
    async fn test_cancelled_read_returns_cancelled() {
        let (_, persistence) = persistence();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = persistence
            .load_all_committed_events(&GlobalPosition::start(), 10, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);

        let err = persistence
            .commit_events(&AggregateId::new("a"), batch("a", &[1]), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn test_zero_page_size_is_invalid() {
        let (_, persistence) = persistence();
        let err = persistence
            .load_all_committed_events(&GlobalPosition::start(), 0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_page_size_without_room_for_anchor_is_invalid() {
        let (_, persistence) = persistence();
        let err = persistence
            .load_all_committed_events(&GlobalPosition::start(), usize::MAX, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_custom_system_prefix() {
        let log = Arc::new(InMemoryEventLog::new());
        let persistence = EventPersistence::new(log.clone()).with_system_prefix("_sys");
        let cancel = CancellationToken::new();

        log.append_system_record("_sys-stats", "tick", "{}");
        persistence
            .commit_events(&AggregateId::new("a"), batch("a", &[1]), &cancel)
            .await
            .unwrap();

        let page = persistence
            .load_all_committed_events(&GlobalPosition::start(), 5, &cancel)
            .await
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].aggregate_id.as_str(), "a");
    }
}
