//! In-process [`EventLog`] used by tests and by the binary when no database is configured.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::log::{
    check_expected_revision, EventData, EventLog, ExpectedRevision, LogError, RecordedEvent, WriteResult,
    STREAM_DELETED_EVENT_TYPE,
};
use super::position::LogPosition;

#[derive(Default)]
struct Inner {
    records: Vec<RecordedEvent>,
    /// Indexes into `records`, per stream, in revision order.
    streams: HashMap<String, Vec<usize>>,
    tombstoned: HashSet<String>,
    /// Byte-offset-like counter so commit and prepare positions differ.
    next_prepare: u64,
}

impl Inner {
    fn next_position(&mut self) -> LogPosition {
        self.next_prepare += 1;
        // A commit position is never behind its prepare position.
        LogPosition::new(self.next_prepare * 2, self.next_prepare)
    }

    fn current_revision(&self, stream: &str) -> Option<u64> {
        self.streams
            .get(stream)
            .and_then(|indexes| indexes.last())
            .map(|&index| self.records[index].revision)
    }
}

/// Event log kept entirely in memory behind a read/write lock.
#[derive(Default)]
pub struct InMemoryEventLog {
    inner: RwLock<Inner>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records, system records included.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a record to a system stream, bypassing revision checks.
    pub fn append_system_record(&self, stream: &str, event_type: &str, data: &str) -> LogPosition {
        let mut inner = self.inner.write();
        let revision = inner.current_revision(stream).map_or(0, |r| r + 1);
        let position = inner.next_position();
        let index = inner.records.len();
        inner.records.push(RecordedEvent {
            stream_id: stream.to_string(),
            revision,
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            data: data.to_string(),
            metadata: String::new(),
            position,
            created_at: Utc::now(),
        });
        inner.streams.entry(stream.to_string()).or_default().push(index);
        position
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        events: Vec<EventData>,
    ) -> Result<WriteResult, LogError> {
        let mut inner = self.inner.write();

        if inner.tombstoned.contains(stream) {
            return Err(LogError::StreamDeleted(stream.to_string()));
        }

        let current = inner.current_revision(stream);
        check_expected_revision(stream, expected, current)?;

        let mut revision = current.map_or(0, |r| r + 1);
        let mut positions = Vec::with_capacity(events.len());
        let created_at = Utc::now();

        for event in events {
            let position = inner.next_position();
            let index = inner.records.len();
            inner.records.push(RecordedEvent {
                stream_id: stream.to_string(),
                revision,
                event_id: event.event_id,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
                position,
                created_at,
            });
            inner.streams.entry(stream.to_string()).or_default().push(index);
            positions.push(position);
            revision += 1;
        }

        let current_revision = inner.current_revision(stream).unwrap_or(0);
        Ok(WriteResult {
            current_revision,
            positions,
        })
    }

    async fn read_stream(&self, stream: &str, from_revision: u64) -> Result<Vec<RecordedEvent>, LogError> {
        let inner = self.inner.read();

        if inner.tombstoned.contains(stream) {
            return Err(LogError::StreamDeleted(stream.to_string()));
        }

        let indexes = inner
            .streams
            .get(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;

        Ok(indexes
            .iter()
            .map(|&index| &inner.records[index])
            .filter(|record| record.revision >= from_revision)
            .cloned()
            .collect())
    }

    async fn read_all(&self, from: LogPosition, max_count: usize) -> Result<Vec<RecordedEvent>, LogError> {
        let inner = self.inner.read();

        // Records are stored in position order.
        let start = inner.records.partition_point(|record| record.position < from);

        Ok(inner.records[start..]
            .iter()
            .filter(|record| {
                record.event_type == STREAM_DELETED_EVENT_TYPE || !inner.tombstoned.contains(&record.stream_id)
            })
            .take(max_count)
            .cloned()
            .collect())
    }

    async fn tombstone(&self, stream: &str) -> Result<(), LogError> {
        let mut inner = self.inner.write();

        if !inner.tombstoned.insert(stream.to_string()) {
            return Err(LogError::StreamDeleted(stream.to_string()));
        }

        let position = inner.next_position();
        inner.records.push(RecordedEvent {
            stream_id: stream.to_string(),
            revision: u64::MAX,
            event_id: Uuid::new_v4(),
            event_type: STREAM_DELETED_EVENT_TYPE.to_string(),
            data: String::new(),
            metadata: String::new(),
            position,
            created_at: Utc::now(),
        });

        tracing::debug!(stream = %stream, position = %position, "Stream tombstoned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(event_type: &str) -> EventData {
        EventData {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            data: "{}".to_string(),
            metadata: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_revisions_and_positions() {
        let log = InMemoryEventLog::new();

        let result = log
            .append_to_stream("a", ExpectedRevision::NoStream, vec![record("t"), record("t")])
            .await
            .unwrap();
        assert_eq!(result.current_revision, 1);
        assert_eq!(result.positions.len(), 2);
        assert!(result.positions[0] < result.positions[1]);

        let result = log
            .append_to_stream("a", ExpectedRevision::Exact(1), vec![record("t")])
            .await
            .unwrap();
        assert_eq!(result.current_revision, 2);

        let events = log.read_stream("a", 1).await.unwrap();
        assert_eq!(events.iter().map(|e| e.revision).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_wrong_expected_version_appends_nothing() {
        let log = InMemoryEventLog::new();
        log.append_to_stream("a", ExpectedRevision::NoStream, vec![record("t")])
            .await
            .unwrap();

        let err = log
            .append_to_stream("a", ExpectedRevision::NoStream, vec![record("t")])
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::WrongExpectedVersion { .. }));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_stream_is_not_found() {
        let log = InMemoryEventLog::new();
        assert!(matches!(
            log.read_stream("missing", 0).await,
            Err(LogError::StreamNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tombstone_hides_stream_and_blocks_appends() {
        let log = InMemoryEventLog::new();
        log.append_to_stream("a", ExpectedRevision::Any, vec![record("t")])
            .await
            .unwrap();
        log.append_to_stream("b", ExpectedRevision::Any, vec![record("t")])
            .await
            .unwrap();

        log.tombstone("a").await.unwrap();

        assert!(matches!(log.read_stream("a", 0).await, Err(LogError::StreamDeleted(_))));
        assert!(matches!(
            log.append_to_stream("a", ExpectedRevision::Any, vec![record("t")]).await,
            Err(LogError::StreamDeleted(_))
        ));
        assert!(matches!(log.tombstone("a").await, Err(LogError::StreamDeleted(_))));

        let all = log.read_all(LogPosition::START, 10).await.unwrap();
        let types: Vec<_> = all.iter().map(|e| (e.stream_id.as_str(), e.event_type.as_str())).collect();
        assert_eq!(types, vec![("b", "t"), ("a", STREAM_DELETED_EVENT_TYPE)]);
    }

    #[tokio::test]
    async fn test_read_all_is_inclusive_and_bounded() {
        let log = InMemoryEventLog::new();
        let result = log
            .append_to_stream("a", ExpectedRevision::Any, vec![record("1"), record("2"), record("3")])
            .await
            .unwrap();

        let page = log.read_all(result.positions[1], 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].position, result.positions[1]);

        let page = log.read_all(LogPosition::START, 2).await.unwrap();
        assert_eq!(page.len(), 2);

        assert!(log.read_all(LogPosition::END, 10).await.unwrap().is_empty());
    }
}
