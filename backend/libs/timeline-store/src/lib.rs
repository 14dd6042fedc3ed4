//! Append-only session timeline storage.
//!
//! Every interaction event a provider produces is stored exactly once, keyed
//! by `event_id`, and receives a per-session sequence number `seq` assigned
//! at admission time. `seq` values for a session form a gapless run starting
//! at 1; they define the only ordering the delivery pipeline guarantees.
//!
//! The sequence counter lives on the `sessions` row. Appending bumps the
//! counter with a row-locked `UPDATE ... RETURNING`, so concurrent admitters
//! of the same session serialize on the row lock while distinct sessions
//! proceed independently. The bump happens inside the caller's transaction:
//! if admission aborts, the counter rolls back with it and no gap is left
//! behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

mod error;

pub use error::{StoreError, StoreResult};

/// Kind of a timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A user/provider interaction turn
    Interaction,
    /// Provider-specific extension data, passed through opaquely
    ProviderExtension,
    /// Pipeline-generated system event
    System,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Interaction => "interaction",
            EventKind::ProviderExtension => "provider_extension",
            EventKind::System => "system",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interaction" => Ok(EventKind::Interaction),
            "provider_extension" => Ok(EventKind::ProviderExtension),
            "system" => Ok(EventKind::System),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// A provider-generated event before admission. `seq` does not exist yet;
/// the store assigns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTimelineEvent {
    /// Caller-provided globally unique identifier; the idempotency key for
    /// the whole pipeline
    pub event_id: String,

    /// Owner of the session this event belongs to
    pub user_id: String,

    /// Trace correlation id from the provider invocation
    pub trace_id: String,

    /// Event kind
    pub kind: EventKind,

    /// Opaque provider payload, stored verbatim
    pub payload: serde_json::Value,

    /// Provider-side timestamp in milliseconds since the epoch
    pub timestamp_ms: i64,
}

/// A stored, immutable timeline event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_id: String,
    pub session_id: String,
    pub user_id: String,
    pub trace_id: String,
    /// Strictly increasing per session, starting at 1
    pub seq: i64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Read surface of the timeline store.
#[async_trait]
pub trait TimelineStore: Send + Sync {
    /// Append an event to a session's timeline and return its assigned `seq`.
    ///
    /// Must be called within an existing transaction so the append commits
    /// or aborts atomically with the caller's other writes (the outbox
    /// insert during admission).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] when `event_id` is already
    /// stored; callers resolve idempotent retries against the existing row.
    async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        session_id: &str,
        event: &NewTimelineEvent,
    ) -> StoreResult<i64>;

    /// Read events with `seq > after_seq` in ascending order, at most `limit`.
    async fn read(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> StoreResult<Vec<TimelineEvent>>;

    /// Look up a single event by id.
    async fn read_by_id(&self, event_id: &str) -> StoreResult<TimelineEvent>;

    /// Highest assigned `seq` for a session, 0 when the session is empty or
    /// unknown.
    async fn latest_seq(&self, session_id: &str) -> StoreResult<i64>;
}

/// PostgreSQL-backed timeline store.
pub struct PgTimelineStore {
    pool: PgPool,
}

impl PgTimelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TimelineStore for PgTimelineStore {
    async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        session_id: &str,
        event: &NewTimelineEvent,
    ) -> StoreResult<i64> {
        // Created on first ingest; the conflict arm keeps existing rows as-is.
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(&event.user_id)
        .execute(&mut **tx)
        .await?;

        // Row lock on the session serializes concurrent appenders.
        let seq: i64 = sqlx::query_scalar(
            r#"
            UPDATE sessions
            SET last_seq = last_seq + 1,
                updated_at = NOW()
            WHERE session_id = $1
            RETURNING last_seq
            "#,
        )
        .bind(session_id)
        .fetch_one(&mut **tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO timeline_events (
                event_id,
                session_id,
                user_id,
                trace_id,
                seq,
                kind,
                payload,
                timestamp_ms
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&event.event_id)
        .bind(session_id)
        .bind(&event.user_id)
        .bind(&event.trace_id)
        .bind(seq)
        .bind(event.kind.as_str())
        .bind(&event.payload)
        .bind(event.timestamp_ms)
        .execute(&mut **tx)
        .await;

        match inserted {
            Ok(_) => {
                debug!(
                    event_id = %event.event_id,
                    session_id = %session_id,
                    seq,
                    "Timeline event appended"
                );
                Ok(seq)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(event.event_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> StoreResult<Vec<TimelineEvent>> {
        let rows = sqlx::query_as::<_, TimelineEventRow>(
            r#"
            SELECT
                event_id, session_id, user_id, trace_id,
                seq, kind, payload, timestamp_ms, created_at
            FROM timeline_events
            WHERE session_id = $1 AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(session_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TimelineEvent::try_from).collect()
    }

    async fn read_by_id(&self, event_id: &str) -> StoreResult<TimelineEvent> {
        let row = sqlx::query_as::<_, TimelineEventRow>(
            r#"
            SELECT
                event_id, session_id, user_id, trace_id,
                seq, kind, payload, timestamp_ms, created_at
            FROM timeline_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => TimelineEvent::try_from(row),
            None => Err(StoreError::NotFound(event_id.to_string())),
        }
    }

    async fn latest_seq(&self, session_id: &str) -> StoreResult<i64> {
        let row = sqlx::query("SELECT last_seq FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => row.try_get("last_seq")?,
            None => 0,
        })
    }
}

// Database row representation; `kind` is stored as text.
#[derive(sqlx::FromRow)]
struct TimelineEventRow {
    event_id: String,
    session_id: String,
    user_id: String,
    trace_id: String,
    seq: i64,
    kind: String,
    payload: serde_json::Value,
    timestamp_ms: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<TimelineEventRow> for TimelineEvent {
    type Error = StoreError;

    fn try_from(row: TimelineEventRow) -> Result<Self, Self::Error> {
        let kind = row
            .kind
            .parse::<EventKind>()
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(e.into())))?;

        Ok(TimelineEvent {
            event_id: row.event_id,
            session_id: row.session_id,
            user_id: row.user_id,
            trace_id: row.trace_id,
            seq: row.seq,
            kind,
            payload: row.payload,
            timestamp_ms: row.timestamp_ms,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_round_trip() {
        for kind in [
            EventKind::Interaction,
            EventKind::ProviderExtension,
            EventKind::System,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }

        assert!("invoke_result".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_kind_serde_uses_snake_case() {
        let json = serde_json::to_string(&EventKind::ProviderExtension).unwrap();
        assert_eq!(json, "\"provider_extension\"");

        let kind: EventKind = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(kind, EventKind::System);
    }

    #[test]
    fn test_new_event_payload_survives_serde_verbatim() {
        let payload = serde_json::json!({
            "text": "hello",
            "chunks": [1, 2, 3],
            "nested": { "deep": null }
        });
        let event = NewTimelineEvent {
            event_id: "evt-1".to_string(),
            user_id: "user-1".to_string(),
            trace_id: "trace-1".to_string(),
            kind: EventKind::Interaction,
            payload: payload.clone(),
            timestamp_ms: 1_700_000_000_000,
        };

        let round_tripped: NewTimelineEvent =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(round_tripped.payload, payload);
    }
}
