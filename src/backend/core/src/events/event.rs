//! Event identifiers, metadata, and the uncommitted/committed event records.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;

use super::position::GlobalPosition;

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque identifier of an aggregate. Also the name of its stream in the log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AggregateId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AggregateId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Event Metadata
// =============================================================================

/// Metadata attached to every event before it is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Domain-level event identifier. Never reused as the log record id.
    pub event_id: EventId,

    pub aggregate_id: AggregateId,

    pub aggregate_name: String,

    pub event_name: String,

    pub event_version: u32,

    /// 1-based position of the event inside its aggregate.
    pub aggregate_sequence_number: u64,

    pub timestamp: DateTime<Utc>,

    pub correlation_id: Option<String>,

    pub causation_id: Option<EventId>,

    /// Free-form key/value pairs added by enrichers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
}

impl EventMetadata {
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_name: impl Into<String>,
        event_name: impl Into<String>,
        event_version: u32,
        aggregate_sequence_number: u64,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            aggregate_id,
            aggregate_name: aggregate_name.into(),
            event_name: event_name.into(),
            event_version,
            aggregate_sequence_number,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation(mut self, id: EventId) -> Self {
        self.causation_id = Some(id);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Log record type: `"{aggregate_name}.{event_name}.{event_version}"`.
    pub fn log_event_type(&self) -> String {
        format!("{}.{}.{}", self.aggregate_name, self.event_name, self.event_version)
    }
}

// =============================================================================
// Event Records
// =============================================================================

/// An event serialized and ready to be committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEvent {
    pub aggregate_sequence_number: u64,

    /// Serialized event payload.
    pub data: String,

    pub metadata: EventMetadata,
}

impl SerializedEvent {
    /// Serialize `event` as the `aggregate_sequence_number`-th event of its aggregate.
    pub fn new<E: Serialize>(event: &E, metadata: EventMetadata) -> Result<Self> {
        Ok(Self {
            aggregate_sequence_number: metadata.aggregate_sequence_number,
            data: serde_json::to_string(event)?,
            metadata,
        })
    }
}

/// An event read back from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEvent {
    pub aggregate_id: AggregateId,

    /// 1-based sequence number (log revision + 1).
    pub aggregate_sequence_number: u64,

    pub data: String,

    /// Serialized [`EventMetadata`].
    pub metadata: String,

    pub global_position: GlobalPosition,
}

impl CommittedEvent {
    /// Deserialize the event payload.
    pub fn deserialize_data<E: DeserializeOwned>(&self) -> Result<E> {
        Ok(serde_json::from_str(&self.data)?)
    }

    pub fn deserialize_metadata(&self) -> Result<EventMetadata> {
        Ok(serde_json::from_str(&self.metadata)?)
    }
}

/// Result of a global read: the surviving events and where to resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllCommittedEventsPage {
    pub next_global_position: GlobalPosition,
    pub events: Vec<CommittedEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct PingEvent {
        count: u32,
    }

    #[test]
    fn test_event_id_generation() {
        let id1 = EventId::new();
        let id2 = EventId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_log_event_type() {
        let metadata = EventMetadata::new("thingy-1".into(), "thingy", "ping", 1, 1);
        assert_eq!(metadata.log_event_type(), "thingy.ping.1");
    }

    #[test]
    fn test_event_metadata_builders() {
        let cause = EventId::new();
        let metadata = EventMetadata::new("thingy-1".into(), "thingy", "ping", 2, 4)
            .with_correlation("corr-123")
            .with_causation(cause)
            .with_extra("source", "test");

        assert_eq!(metadata.aggregate_sequence_number, 4);
        assert_eq!(metadata.correlation_id.as_deref(), Some("corr-123"));
        assert_eq!(metadata.causation_id, Some(cause));
        assert_eq!(metadata.extra.get("source").map(String::as_str), Some("test"));
    }

    #[test]
    fn test_serialized_event_carries_sequence_number() {
        let metadata = EventMetadata::new("thingy-1".into(), "thingy", "ping", 1, 3);
        let event = SerializedEvent::new(&PingEvent { count: 7 }, metadata).unwrap();
        assert_eq!(event.aggregate_sequence_number, 3);
        assert_eq!(event.data, r#"{"count":7}"#);
    }

    #[test]
    fn test_committed_event_payload_access() {
        let metadata = EventMetadata::new("thingy-1".into(), "thingy", "ping", 1, 1);
        let committed = CommittedEvent {
            aggregate_id: "thingy-1".into(),
            aggregate_sequence_number: 1,
            data: r#"{"count":2}"#.to_string(),
            metadata: serde_json::to_string(&metadata).unwrap(),
            global_position: GlobalPosition::new("1-1"),
        };

        assert_eq!(committed.deserialize_data::<PingEvent>().unwrap(), PingEvent { count: 2 });
        assert_eq!(committed.deserialize_metadata().unwrap(), metadata);
    }
}
