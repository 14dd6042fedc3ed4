//! # Durable Delivery Outbox
//!
//! The outbox is the durable handoff between the admission transaction and
//! the asynchronous delivery machinery. Admission writes the timeline event
//! and the delivery envelope in one database transaction; a background
//! worker then drives each envelope to the stream broker with at-least-once
//! semantics.
//!
//! This guarantees no envelope is lost even if:
//! - the process crashes after the database commit but before the publish
//! - the broker is temporarily unavailable
//! - a worker dies while holding claimed rows (the lock TTL sweep reclaims
//!   them)
//!
//! ## Envelope lifecycle
//!
//! ```text
//! pending ─┐                         ┌──► delivered ──► consumed
//!          ├── claim ──► processing ─┤
//! failed ──┘                         └──► failed ──► … ──► dead_letter
//! ```
//!
//! Retryable publish failures send the row back to `failed` with exponential
//! backoff and full jitter; permanent failures and exhausted attempts land
//! in `dead_letter`, where the operator replay tool (`outbox-replay`,
//! driving [`OutboxRepository::replay`]) is the only way out.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use delivery_outbox::{SqlxOutboxRepository, DeliveryEnvelope};
//! use sqlx::PgPool;
//!
//! async fn admit(
//!     pool: &PgPool,
//!     outbox: &SqlxOutboxRepository,
//!     envelope: DeliveryEnvelope,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!     // 1. business write (timeline event append) goes here, same tx
//!     // 2. enqueue the envelope atomically with it
//!     outbox.enqueue(&mut tx, &envelope, 12).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! The background side is [`worker::DeliveryWorker`]; consumers close the
//! loop with [`OutboxRepository::mark_consumed`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, warn};

mod backoff;
mod error;
pub mod metrics;
mod replay;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use error::{OutboxError, OutboxResult, PublishError};
pub use replay::{ReplayReport, ReplayRow, ReplaySelector};

use timeline_store::EventKind;

/// Wire schema version carried by every delivery envelope.
pub const ENVELOPE_SCHEMA_VERSION: &str = "v0";

/// Envelope type discriminator for timeline events.
pub const ENVELOPE_TYPE_TIMELINE_EVENT: &str = "timeline_event";

/// Default delivery channel for timeline envelopes.
pub const CHANNEL_TIMELINE: &str = "timeline";

/// The self-contained delivery record written to the broker streams.
///
/// Everything a downstream consumer needs travels inside: the stored event
/// plus the broker keys it was (or will be) appended to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    #[serde(rename = "schemaVersion")]
    pub schema_version: String,

    #[serde(rename = "type")]
    pub envelope_type: String,

    pub event: EnvelopeEvent,

    pub stream: StreamHints,
}

/// The timeline event as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeEvent {
    pub event_id: String,
    pub session_id: String,
    pub user_id: String,
    pub trace_id: String,
    pub seq: i64,
    pub timestamp_ms: i64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// Broker routing hints: the per-session stream key and the shared global
/// key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHints {
    pub key: String,
    #[serde(rename = "globalKey")]
    pub global_key: String,
}

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Enqueued, never claimed
    Pending,
    /// Claimed by a worker, publish in flight
    Processing,
    /// Publish failed, retry scheduled at `next_retry_at`
    Failed,
    /// Appended to the broker streams, downstream ack not yet observed
    Delivered,
    /// Downstream fan-out acknowledged the envelope
    Consumed,
    /// Attempts exhausted or broker rejected the envelope; needs replay
    DeadLetter,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Consumed => "consumed",
            OutboxStatus::DeadLetter => "dead_letter",
        }
    }

    /// Terminal states never transition again, except `dead_letter` which
    /// the operator replay tool resets to `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboxStatus::Delivered | OutboxStatus::Consumed | OutboxStatus::DeadLetter
        )
    }

    /// Legal edges of the status machine. `processing → pending` is the
    /// shutdown lock release; `dead_letter → failed` is operator replay.
    pub fn can_transition_to(self, next: OutboxStatus) -> bool {
        use OutboxStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Processing, Delivered)
                | (Processing, Failed)
                | (Processing, DeadLetter)
                | (Processing, Consumed)
                | (Processing, Pending)
                | (Delivered, Consumed)
                | (DeadLetter, Failed)
        )
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "failed" => Ok(OutboxStatus::Failed),
            "delivered" => Ok(OutboxStatus::Delivered),
            "consumed" => Ok(OutboxStatus::Consumed),
            "dead_letter" => Ok(OutboxStatus::DeadLetter),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// One outbox row: a delivery envelope plus its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct OutboxEnvelope {
    pub event_id: String,
    pub session_id: String,
    pub seq: i64,
    pub channel: String,
    pub payload: DeliveryEnvelope,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Broker entry ids returned by a successful publish, for diagnostics.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub session_entry_id: String,
    pub global_entry_id: String,
}

/// Publisher seam between the delivery worker and the stream broker.
///
/// Implementations classify every failure as transient or permanent; see
/// [`PublishError`].
#[async_trait]
pub trait EnvelopePublisher: Send + Sync {
    async fn publish(&self, envelope: &DeliveryEnvelope) -> Result<PublishReceipt, PublishError>;
}

/// Mutation surface of the outbox shared by the delivery worker, the stream
/// consumer and the replay tool.
///
/// `enqueue` is deliberately not part of this trait: it must run inside the
/// admission database transaction and therefore lives on
/// [`SqlxOutboxRepository`] directly.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Atomically claim up to `batch_size` due rows for `worker_id`.
    ///
    /// Selects rows in `pending` or `failed` whose `next_retry_at` has
    /// passed, oldest first, skipping rows locked by other workers and any
    /// row whose session still has an older undelivered envelope (per-session
    /// single flight). Claimed rows move to `processing` under the worker's
    /// lock.
    async fn claim(&self, worker_id: &str, batch_size: i64) -> OutboxResult<Vec<OutboxEnvelope>>;

    /// `processing → delivered`. Tolerates a row the consumer already marked
    /// `consumed`.
    async fn settle_success(&self, event_id: &str) -> OutboxResult<()>;

    /// Record a failed attempt and return the resulting status.
    ///
    /// Retryable failures with attempts remaining go back to `failed` with
    /// `next_retry_at = now + retry_delay` (database clock); everything else
    /// moves to `dead_letter`. The caller computes `retry_delay` from its
    /// backoff policy and the row's attempt count.
    async fn settle_failure(
        &self,
        event_id: &str,
        error: &str,
        retryable: bool,
        retry_delay: Duration,
    ) -> OutboxResult<OutboxStatus>;

    /// `delivered → consumed` (also accepted from `processing` when the
    /// consumer observes the broker entry before the worker settles).
    /// Idempotent: an already-consumed row is a no-op.
    async fn mark_consumed(&self, event_id: &str) -> OutboxResult<()>;

    /// Return this worker's claimed rows to `pending` with attempts
    /// unchanged. Called on cooperative shutdown so siblings pick the rows
    /// up promptly.
    async fn release_locks(&self, worker_id: &str) -> OutboxResult<u64>;

    /// Reclaim `processing` rows whose lock is older than `lock_ttl`.
    ///
    /// The holder is presumed dead, so attempts are incremented; a row that
    /// thereby reaches `max_attempts` goes to `dead_letter` instead of
    /// `failed`. Returns the reclaimed event ids.
    async fn reclaim_stale(&self, lock_ttl: Duration) -> OutboxResult<Vec<String>>;

    /// Reset dead-letter rows selected by `selector` to `failed`, recording
    /// idempotency under `replay_token`: only rows whose
    /// `(replay_token, event_id)` log insert lands are transitioned, so
    /// repeating an invocation with the same token updates zero rows.
    async fn replay(
        &self,
        selector: &ReplaySelector,
        replay_token: &str,
        note: Option<&str>,
        reset_attempts: bool,
        dry_run: bool,
    ) -> OutboxResult<ReplayReport>;

    /// Undelivered row count and age in seconds of the oldest undelivered
    /// row (0 when none).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;

    /// Row counts per status.
    async fn status_counts(&self) -> OutboxResult<Vec<(OutboxStatus, i64)>>;
}

/// SQLx-based outbox repository on PostgreSQL.
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new envelope in status `pending` within the caller's
    /// transaction, atomically with the timeline append.
    pub async fn enqueue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        envelope: &DeliveryEnvelope,
        max_attempts: i32,
    ) -> OutboxResult<()> {
        let payload = serde_json::to_value(envelope)?;

        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                event_id,
                session_id,
                seq,
                channel,
                payload,
                status,
                attempts,
                max_attempts,
                next_retry_at
            ) VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, NOW())
            "#,
        )
        .bind(&envelope.event.event_id)
        .bind(&envelope.event.session_id)
        .bind(envelope.event.seq)
        .bind(CHANNEL_TIMELINE)
        .bind(&payload)
        .bind(max_attempts)
        .execute(&mut **tx)
        .await?;

        debug!(
            event_id = %envelope.event.event_id,
            session_id = %envelope.event.session_id,
            seq = envelope.event.seq,
            "Envelope enqueued in outbox"
        );

        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn claim(&self, worker_id: &str, batch_size: i64) -> OutboxResult<Vec<OutboxEnvelope>> {
        // The NOT EXISTS clause enforces per-session single flight: a row is
        // claimable only while no lower-seq envelope of the same session is
        // still in a non-terminal state. SKIP LOCKED keeps sibling workers
        // from blocking on each other's candidates.
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            WITH claimable AS (
                SELECT o.event_id
                FROM outbox_events o
                WHERE o.status IN ('pending', 'failed')
                  AND o.next_retry_at <= NOW()
                  AND NOT EXISTS (
                      SELECT 1
                      FROM outbox_events h
                      WHERE h.session_id = o.session_id
                        AND h.seq < o.seq
                        AND h.status NOT IN ('delivered', 'consumed', 'dead_letter')
                  )
                ORDER BY o.created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events o
            SET status = 'processing',
                locked_by = $1,
                locked_at = NOW(),
                updated_at = NOW()
            FROM claimable c
            WHERE o.event_id = c.event_id
            RETURNING
                o.event_id, o.session_id, o.seq, o.channel, o.payload,
                o.status, o.attempts, o.max_attempts, o.next_retry_at,
                o.last_error, o.locked_by, o.locked_at, o.created_at, o.updated_at
            "#,
        )
        .bind(worker_id)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            envelopes.push(OutboxEnvelope::try_from(row)?);
        }

        // Claim order is insertion order; hand rows to the worker in
        // per-session seq order regardless.
        envelopes.sort_by(|a, b| {
            a.session_id
                .cmp(&b.session_id)
                .then(a.seq.cmp(&b.seq))
                .then(a.created_at.cmp(&b.created_at))
        });

        debug!(count = envelopes.len(), worker_id, "Claimed outbox rows");

        Ok(envelopes)
    }

    async fn settle_success(&self, event_id: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'delivered',
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE event_id = $1 AND status = 'processing'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            match self.current_status(event_id).await? {
                Some(OutboxStatus::Consumed) => {
                    // Consumer observed the broker entry first; nothing to do.
                    debug!(event_id = %event_id, "Row already consumed at settle time");
                }
                Some(status) => {
                    warn!(
                        event_id = %event_id,
                        status = status.as_str(),
                        "Row left processing before settle_success"
                    );
                }
                None => return Err(OutboxError::EnvelopeNotFound(event_id.to_string())),
            }
        }

        Ok(())
    }

    async fn settle_failure(
        &self,
        event_id: &str,
        error: &str,
        retryable: bool,
        retry_delay: Duration,
    ) -> OutboxResult<OutboxStatus> {
        let delay_ms = retry_delay.as_millis() as i64;

        let row = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = CASE
                    WHEN $3 AND attempts + 1 < max_attempts THEN 'failed'
                    ELSE 'dead_letter'
                END,
                attempts = attempts + 1,
                last_error = $2,
                next_retry_at = CASE
                    WHEN $3 AND attempts + 1 < max_attempts
                        THEN NOW() + ($4 * interval '1 millisecond')
                    ELSE next_retry_at
                END,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE event_id = $1 AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(retryable)
        .bind(delay_ms)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                let status = status
                    .parse::<OutboxStatus>()
                    .map_err(|e| OutboxError::Other(anyhow::anyhow!(e)))?;
                Ok(status)
            }
            None => Err(OutboxError::EnvelopeNotFound(event_id.to_string())),
        }
    }

    async fn mark_consumed(&self, event_id: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'consumed',
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE event_id = $1 AND status IN ('delivered', 'processing')
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            match self.current_status(event_id).await? {
                Some(OutboxStatus::Consumed) => {
                    debug!(event_id = %event_id, "Row already consumed");
                }
                Some(status) => {
                    // A stale broker duplicate from an earlier attempt; the
                    // row's own retry machinery stays authoritative.
                    warn!(
                        event_id = %event_id,
                        status = status.as_str(),
                        "Ignoring consume for row outside delivered/processing"
                    );
                }
                None => return Err(OutboxError::EnvelopeNotFound(event_id.to_string())),
            }
        }

        Ok(())
    }

    async fn release_locks(&self, worker_id: &str) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                next_retry_at = NOW(),
                updated_at = NOW()
            WHERE status = 'processing' AND locked_by = $1
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reclaim_stale(&self, lock_ttl: Duration) -> OutboxResult<Vec<String>> {
        let ttl_ms = lock_ttl.as_millis() as i64;

        let rows = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = CASE
                    WHEN attempts + 1 >= max_attempts THEN 'dead_letter'
                    ELSE 'failed'
                END,
                attempts = attempts + 1,
                last_error = 'worker lock expired: ' || COALESCE(locked_by, 'unknown'),
                next_retry_at = NOW(),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE status = 'processing'
              AND locked_at IS NOT NULL
              AND locked_at < NOW() - ($1 * interval '1 millisecond')
            RETURNING event_id
            "#,
        )
        .bind(ttl_ms)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            reclaimed.push(row.try_get::<String, _>("event_id")?);
        }

        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "Reclaimed stale processing rows");
        }

        Ok(reclaimed)
    }

    async fn replay(
        &self,
        selector: &ReplaySelector,
        replay_token: &str,
        note: Option<&str>,
        reset_attempts: bool,
        dry_run: bool,
    ) -> OutboxResult<ReplayReport> {
        let mut tx = self.pool.begin().await?;

        let lock_clause = if dry_run { "" } else { "FOR UPDATE SKIP LOCKED" };
        let selected = match selector {
            ReplaySelector::EventId(event_id) => {
                sqlx::query(&format!(
                    "SELECT event_id, session_id, status, attempts FROM outbox_events \
                     WHERE status = 'dead_letter' AND event_id = $1 {lock_clause}"
                ))
                .bind(event_id)
                .fetch_all(&mut *tx)
                .await?
            }
            ReplaySelector::Session(session_id) => {
                sqlx::query(&format!(
                    "SELECT event_id, session_id, status, attempts FROM outbox_events \
                     WHERE status = 'dead_letter' AND session_id = $1 \
                     ORDER BY created_at ASC {lock_clause}"
                ))
                .bind(session_id)
                .fetch_all(&mut *tx)
                .await?
            }
            ReplaySelector::All { limit } => {
                sqlx::query(&format!(
                    "SELECT event_id, session_id, status, attempts FROM outbox_events \
                     WHERE status = 'dead_letter' \
                     ORDER BY created_at ASC LIMIT $1 {lock_clause}"
                ))
                .bind(limit)
                .fetch_all(&mut *tx)
                .await?
            }
        };

        let mut report = ReplayReport::empty(replay_token, dry_run);
        report.selected = selected.len();

        let mut rows = Vec::with_capacity(selected.len());
        for row in &selected {
            rows.push(ReplayRow {
                event_id: row.try_get("event_id")?,
                session_id: row.try_get("session_id")?,
                previous_status: OutboxStatus::DeadLetter,
                previous_attempts: row.try_get("attempts")?,
                new_status: None,
            });
        }

        if dry_run {
            tx.rollback().await?;
            report.rows = rows;
            return Ok(report);
        }

        let mut replayed_ids: Vec<String> = Vec::new();
        for row in &mut rows {
            let inserted = sqlx::query(
                r#"
                INSERT INTO outbox_replay_log (
                    replay_token, event_id, session_id,
                    previous_status, previous_attempts, note
                ) VALUES ($1, $2, $3, 'dead_letter', $4, $5)
                ON CONFLICT (replay_token, event_id) DO NOTHING
                "#,
            )
            .bind(replay_token)
            .bind(&row.event_id)
            .bind(&row.session_id)
            .bind(row.previous_attempts)
            .bind(note)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() > 0 {
                replayed_ids.push(row.event_id.clone());
                row.new_status = Some(OutboxStatus::Failed);
            }
        }
        report.inserted = replayed_ids.len();

        if !replayed_ids.is_empty() {
            let updated = sqlx::query(
                r#"
                UPDATE outbox_events
                SET status = 'failed',
                    next_retry_at = NOW(),
                    last_error = NULL,
                    locked_by = NULL,
                    locked_at = NULL,
                    attempts = CASE WHEN $2 THEN 0 ELSE attempts END,
                    updated_at = NOW()
                WHERE event_id = ANY($1) AND status = 'dead_letter'
                "#,
            )
            .bind(&replayed_ids)
            .bind(reset_attempts)
            .execute(&mut *tx)
            .await?;
            report.updated = updated.rows_affected() as usize;
        }

        tx.commit().await?;
        report.rows = rows;
        Ok(report)
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE status IN ('pending', 'processing', 'failed')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }

    async fn status_counts(&self) -> OutboxResult<Vec<(OutboxStatus, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*)::BIGINT AS total FROM outbox_events GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let status = status
                .parse::<OutboxStatus>()
                .map_err(|e| OutboxError::Other(anyhow::anyhow!(e)))?;
            counts.push((status, row.try_get("total")?));
        }
        Ok(counts)
    }
}

impl SqlxOutboxRepository {
    async fn current_status(&self, event_id: &str) -> OutboxResult<Option<OutboxStatus>> {
        let row = sqlx::query("SELECT status FROM outbox_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                Ok(Some(status.parse::<OutboxStatus>().map_err(|e| {
                    OutboxError::Other(anyhow::anyhow!(e))
                })?))
            }
            None => Ok(None),
        }
    }
}

// Database row representation; payload is the envelope as JSONB.
#[derive(sqlx::FromRow)]
struct OutboxRow {
    event_id: String,
    session_id: String,
    seq: i64,
    channel: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_retry_at: DateTime<Utc>,
    last_error: Option<String>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxEnvelope {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let payload: DeliveryEnvelope = serde_json::from_value(row.payload)?;
        let status = row
            .status
            .parse::<OutboxStatus>()
            .map_err(|e| OutboxError::Other(anyhow::anyhow!(e)))?;

        Ok(OutboxEnvelope {
            event_id: row.event_id,
            session_id: row.session_id,
            seq: row.seq,
            channel: row.channel,
            payload,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
