//! PostgreSQL-backed [`EventLog`].
//!
//! Every record gets a `BIGSERIAL` global position, used as both the commit and
//! prepare component of its [`LogPosition`]. Stream revisions are guarded by a
//! unique `(stream_id, revision)` constraint, so two writers racing on the same
//! revision cannot both succeed.
//!
//! Sequence values are handed out in insert order, not commit order. Writers
//! therefore take a transaction-scoped advisory lock before inserting, so a
//! position only becomes visible after every lower position has committed and
//! a reader's cursor never moves past a row that is still in flight.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{EventideError, Result};

use super::log::{
    check_expected_revision, ActualRevision, EventData, EventLog, ExpectedRevision, LogError, RecordedEvent,
    WriteResult, STREAM_DELETED_EVENT_TYPE,
};
use super::position::LogPosition;

/// Revision stored on tombstone marker rows.
const TOMBSTONE_REVISION: i64 = i64::MAX;

/// Advisory lock key serializing writes to `event_log`.
const APPEND_LOCK_KEY: i64 = 0x6576_656e_7469_6465;

/// Event log stored in the `event_log` table.
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run the bundled migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EventideError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Hold the append lock until `tx` ends.
    async fn lock_appends(tx: &mut Transaction<'_, Postgres>) -> std::result::Result<(), LogError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn is_tombstoned(tx: &mut Transaction<'_, Postgres>, stream: &str) -> std::result::Result<bool, LogError> {
        let deleted: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM event_log_tombstones WHERE stream_id = $1)")
                .bind(stream)
                .fetch_one(&mut **tx)
                .await?;
        Ok(deleted)
    }
}

#[async_trait]
impl EventLog for PostgresEventLog {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_to_stream(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        events: Vec<EventData>,
    ) -> std::result::Result<WriteResult, LogError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_appends(&mut tx).await?;

        if Self::is_tombstoned(&mut tx, stream).await? {
            return Err(LogError::StreamDeleted(stream.to_string()));
        }

        let current: Option<i64> = sqlx::query_scalar("SELECT MAX(revision) FROM event_log WHERE stream_id = $1")
            .bind(stream)
            .fetch_one(&mut *tx)
            .await?;
        let current = current.map(|revision| revision as u64);
        check_expected_revision(stream, expected, current)?;

        let mut revision = current.map_or(0, |r| r + 1);
        let mut positions = Vec::with_capacity(events.len());

        for event in events {
            let inserted = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO event_log (stream_id, revision, event_id, event_type, data, metadata, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                RETURNING global_position
                "#,
            )
            .bind(stream)
            .bind(revision as i64)
            .bind(event.event_id)
            .bind(&event.event_type)
            .bind(&event.data)
            .bind(&event.metadata)
            .fetch_one(&mut *tx)
            .await;

            let global_position = match inserted {
                Ok(position) => position as u64,
                Err(err) if is_unique_violation(&err) => {
                    return Err(LogError::WrongExpectedVersion {
                        stream: stream.to_string(),
                        expected,
                        actual: ActualRevision(current),
                    });
                }
                Err(err) => return Err(err.into()),
            };

            positions.push(LogPosition::new(global_position, global_position));
            revision += 1;
        }

        tx.commit().await?;

        Ok(WriteResult {
            current_revision: revision.saturating_sub(1),
            positions,
        })
    }

    #[instrument(skip(self))]
    async fn read_stream(
        &self,
        stream: &str,
        from_revision: u64,
    ) -> std::result::Result<Vec<RecordedEvent>, LogError> {
        let mut tx = self.pool.begin().await?;

        if Self::is_tombstoned(&mut tx, stream).await? {
            return Err(LogError::StreamDeleted(stream.to_string()));
        }

        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT global_position, stream_id, revision, event_id, event_type, data, metadata, created_at
            FROM event_log
            WHERE stream_id = $1 AND revision >= $2
            ORDER BY revision ASC
            "#,
        )
        .bind(stream)
        .bind(i64::try_from(from_revision).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM event_log WHERE stream_id = $1)")
                .bind(stream)
                .fetch_one(&mut *tx)
                .await?;
            if !exists {
                return Err(LogError::StreamNotFound(stream.to_string()));
            }
        }

        tx.commit().await?;
        Ok(rows.into_iter().map(RecordedEvent::from).collect())
    }

    #[instrument(skip(self))]
    async fn read_all(
        &self,
        from: LogPosition,
        max_count: usize,
    ) -> std::result::Result<Vec<RecordedEvent>, LogError> {
        let Ok(from) = i64::try_from(from.commit) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT e.global_position, e.stream_id, e.revision, e.event_id, e.event_type, e.data, e.metadata, e.created_at
            FROM event_log e
            WHERE e.global_position >= $1
              AND (e.event_type = $2
                   OR NOT EXISTS (SELECT 1 FROM event_log_tombstones t WHERE t.stream_id = e.stream_id))
            ORDER BY e.global_position ASC
            LIMIT $3
            "#,
        )
        .bind(from)
        .bind(STREAM_DELETED_EVENT_TYPE)
        .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RecordedEvent::from).collect())
    }

    #[instrument(skip(self))]
    async fn tombstone(&self, stream: &str) -> std::result::Result<(), LogError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_appends(&mut tx).await?;

        let marker = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO event_log (stream_id, revision, event_id, event_type, data, metadata, created_at)
            VALUES ($1, $2, $3, $4, '', '', NOW())
            RETURNING global_position
            "#,
        )
        .bind(stream)
        .bind(TOMBSTONE_REVISION)
        .bind(Uuid::new_v4())
        .bind(STREAM_DELETED_EVENT_TYPE)
        .fetch_one(&mut *tx)
        .await;

        let global_position = match marker {
            Ok(position) => position,
            Err(err) if is_unique_violation(&err) => return Err(LogError::StreamDeleted(stream.to_string())),
            Err(err) => return Err(err.into()),
        };

        sqlx::query("INSERT INTO event_log_tombstones (stream_id, global_position) VALUES ($1, $2)")
            .bind(stream)
            .bind(global_position)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(stream = %stream, global_position, "Stream tombstoned");
        Ok(())
    }
}

/// Row type for reading records from the database.
#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    global_position: i64,
    stream_id: String,
    revision: i64,
    event_id: Uuid,
    event_type: String,
    data: String,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for RecordedEvent {
    fn from(row: EventRow) -> Self {
        let position = row.global_position as u64;
        Self {
            stream_id: row.stream_id,
            revision: row.revision as u64,
            event_id: row.event_id,
            event_type: row.event_type,
            data: row.data,
            metadata: row.metadata,
            position: LogPosition::new(position, position),
            created_at: row.created_at,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_conversion_uses_global_position_for_both_components() {
        let row = EventRow {
            global_position: 42,
            stream_id: "thingy-1".into(),
            revision: 3,
            event_id: Uuid::new_v4(),
            event_type: "thingy.ping.1".into(),
            data: "{}".into(),
            metadata: "{}".into(),
            created_at: Utc::now(),
        };

        let record = RecordedEvent::from(row);
        assert_eq!(record.position, LogPosition::new(42, 42));
        assert_eq!(record.revision, 3);
    }

    #[test]
    fn test_non_database_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
