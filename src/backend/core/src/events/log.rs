//! The backing log: an append-only store of streams with a single global order.
//!
//! [`EventLog`] is the narrow seam between the persistence engine and whatever
//! durable substrate holds the records. Stream revisions are 0-based.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorCode, EventideError};

use super::position::LogPosition;

/// Event type of the marker record written when a stream is tombstoned.
pub const STREAM_DELETED_EVENT_TYPE: &str = "$streamDeleted";

/// Precondition on the current revision of a stream when appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedRevision {
    /// No check.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The last record of the stream must have this revision.
    Exact(u64),
}

impl fmt::Display for ExpectedRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::NoStream => f.write_str("no stream"),
            Self::Exact(revision) => write!(f, "{}", revision),
        }
    }
}

/// A record to append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: String,
    pub metadata: String,
}

/// A record as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub stream_id: String,
    pub revision: u64,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: String,
    pub metadata: String,
    pub position: LogPosition,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// Revision of the last appended record.
    pub current_revision: u64,
    /// Log position of each appended record, in append order.
    pub positions: Vec<LogPosition>,
}

impl WriteResult {
    pub fn log_position(&self) -> LogPosition {
        self.positions.last().copied().unwrap_or(LogPosition::START)
    }
}

/// Faults reported by a backing log.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("stream '{stream}' expected revision {expected} but is at {actual}")]
    WrongExpectedVersion {
        stream: String,
        expected: ExpectedRevision,
        actual: ActualRevision,
    },

    #[error("stream '{0}' not found")]
    StreamNotFound(String),

    #[error("stream '{0}' has been deleted")]
    StreamDeleted(String),

    #[error("event log database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event log error: {0}")]
    Other(String),
}

/// Current revision of a stream as seen by a failed append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActualRevision(pub Option<u64>);

impl fmt::Display for ActualRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(revision) => write!(f, "{}", revision),
            None => f.write_str("no stream"),
        }
    }
}

impl From<LogError> for EventideError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::WrongExpectedVersion { ref stream, .. } => {
                let stream = stream.clone();
                let detail = err.to_string();
                EventideError::optimistic_concurrency(stream, detail).with_source(err)
            }
            LogError::StreamNotFound(ref stream) => {
                let stream = stream.clone();
                EventideError::new(ErrorCode::StreamNotFound, format!("Stream '{}' not found", stream))
                    .with_context("stream_id", stream)
                    .with_source(err)
            }
            LogError::StreamDeleted(ref stream) => {
                let stream = stream.clone();
                EventideError::new(ErrorCode::StreamDeleted, format!("Stream '{}' has been deleted", stream))
                    .with_context("stream_id", stream)
                    .with_source(err)
            }
            LogError::Database(e) => EventideError::from(e),
            LogError::Other(message) => EventideError::internal(message),
        }
    }
}

/// Check an append precondition against the stream's last revision.
pub fn check_expected_revision(
    stream: &str,
    expected: ExpectedRevision,
    current: Option<u64>,
) -> Result<(), LogError> {
    let satisfied = match expected {
        ExpectedRevision::Any => true,
        ExpectedRevision::NoStream => current.is_none(),
        ExpectedRevision::Exact(revision) => current == Some(revision),
    };

    if satisfied {
        Ok(())
    } else {
        Err(LogError::WrongExpectedVersion {
            stream: stream.to_string(),
            expected,
            actual: ActualRevision(current),
        })
    }
}

/// Durable, append-only substrate with per-stream revisions and a global order.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append records atomically if the stream's revision matches `expected`.
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        events: Vec<EventData>,
    ) -> Result<WriteResult, LogError>;

    /// Read a stream forward starting at `from_revision` (inclusive).
    async fn read_stream(&self, stream: &str, from_revision: u64) -> Result<Vec<RecordedEvent>, LogError>;

    /// Read the global log forward from `from` (inclusive), at most `max_count` records.
    async fn read_all(&self, from: LogPosition, max_count: usize) -> Result<Vec<RecordedEvent>, LogError>;

    /// Irreversibly delete a stream. Later appends to it fail with `StreamDeleted`.
    async fn tombstone(&self, stream: &str) -> Result<(), LogError>;
}
