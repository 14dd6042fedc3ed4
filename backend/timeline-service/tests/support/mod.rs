//! In-memory doubles for the pipeline seams: outbox repository, stream
//! broker and fan-out sink. They mirror the SQL/Redis semantics closely
//! enough to drive the worker and consumer state machines end-to-end
//! without infrastructure.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use delivery_outbox::{
    DeliveryEnvelope, EnvelopeEvent, EnvelopePublisher, OutboxEnvelope, OutboxError,
    OutboxRepository, OutboxResult, OutboxStatus, PublishError, PublishReceipt, ReplayReport,
    ReplayRow, ReplaySelector, StreamHints, ENVELOPE_SCHEMA_VERSION,
    ENVELOPE_TYPE_TIMELINE_EVENT,
};
use stream_broker::{BrokerError, BrokerResult, StreamEntry, TimelineBroker};
use timeline_service::workers::FanoutSink;
use timeline_store::EventKind;

pub const STREAM_PREFIX: &str = "uniassist:timeline:";
pub const GLOBAL_KEY: &str = "uniassist:timeline:all";

pub fn mk_envelope(session_id: &str, event_id: &str, seq: i64) -> DeliveryEnvelope {
    DeliveryEnvelope {
        schema_version: ENVELOPE_SCHEMA_VERSION.to_string(),
        envelope_type: ENVELOPE_TYPE_TIMELINE_EVENT.to_string(),
        event: EnvelopeEvent {
            event_id: event_id.to_string(),
            session_id: session_id.to_string(),
            user_id: "user-1".to_string(),
            trace_id: format!("trace-{event_id}"),
            seq,
            timestamp_ms: 1_700_000_000_000 + seq,
            kind: EventKind::Interaction,
            payload: serde_json::json!({ "text": format!("payload-{event_id}") }),
        },
        stream: StreamHints {
            key: format!("{STREAM_PREFIX}{session_id}"),
            global_key: GLOBAL_KEY.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Outbox double
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryOutbox {
    rows: Mutex<HashMap<String, OutboxEnvelope>>,
    replay_log: Mutex<HashSet<(String, String)>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stand-in for `enqueue`: insert a pending row, due immediately.
    pub fn push(&self, envelope: DeliveryEnvelope, max_attempts: i32) {
        let now = Utc::now();
        let row = OutboxEnvelope {
            event_id: envelope.event.event_id.clone(),
            session_id: envelope.event.session_id.clone(),
            seq: envelope.event.seq,
            channel: "timeline".to_string(),
            payload: envelope,
            status: OutboxStatus::Pending,
            attempts: 0,
            max_attempts,
            next_retry_at: now,
            last_error: None,
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        };
        self.rows.lock().unwrap().insert(row.event_id.clone(), row);
    }

    pub fn get(&self, event_id: &str) -> Option<OutboxEnvelope> {
        self.rows.lock().unwrap().get(event_id).cloned()
    }

    pub fn status_of(&self, event_id: &str) -> Option<OutboxStatus> {
        self.get(event_id).map(|row| row.status)
    }

    /// Bring a retry forward so the next claim sees the row as due.
    pub fn force_due(&self, event_id: &str) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(event_id) {
            row.next_retry_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    /// Backdate a processing lock so it is past the TTL.
    pub fn age_lock(&self, event_id: &str, by: Duration) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(event_id) {
            if let Some(locked_at) = row.locked_at {
                row.locked_at =
                    Some(locked_at - chrono::Duration::from_std(by).expect("duration fits"));
            }
        }
    }

    fn retry_at(delay: Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(delay).expect("duration fits")
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutbox {
    async fn claim(&self, worker_id: &str, batch_size: i64) -> OutboxResult<Vec<OutboxEnvelope>> {
        let mut rows = self.rows.lock().unwrap();
        let now = Utc::now();

        // Head-of-line discipline: a row is blocked while a lower-seq row of
        // the same session is non-terminal, matching the SQL claim query.
        let blocked_sessions: HashMap<String, i64> = rows
            .values()
            .filter(|row| {
                !matches!(
                    row.status,
                    OutboxStatus::Delivered | OutboxStatus::Consumed | OutboxStatus::DeadLetter
                )
            })
            .fold(HashMap::new(), |mut acc, row| {
                acc.entry(row.session_id.clone())
                    .and_modify(|min| *min = (*min).min(row.seq))
                    .or_insert(row.seq);
                acc
            });

        let mut candidates: Vec<String> = rows
            .values()
            .filter(|row| {
                matches!(row.status, OutboxStatus::Pending | OutboxStatus::Failed)
                    && row.next_retry_at <= now
                    && blocked_sessions
                        .get(&row.session_id)
                        .is_some_and(|min| *min == row.seq)
            })
            .map(|row| row.event_id.clone())
            .collect();

        candidates.sort_by_key(|id| {
            let row = &rows[id];
            (row.created_at, row.seq)
        });
        candidates.truncate(batch_size as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let row = rows.get_mut(&id).unwrap();
            row.status = OutboxStatus::Processing;
            row.locked_by = Some(worker_id.to_string());
            row.locked_at = Some(now);
            row.updated_at = now;
            claimed.push(row.clone());
        }

        claimed.sort_by(|a, b| {
            a.session_id
                .cmp(&b.session_id)
                .then(a.seq.cmp(&b.seq))
        });

        Ok(claimed)
    }

    async fn settle_success(&self, event_id: &str) -> OutboxResult<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(event_id)
            .ok_or_else(|| OutboxError::EnvelopeNotFound(event_id.to_string()))?;

        if row.status == OutboxStatus::Processing {
            row.status = OutboxStatus::Delivered;
            row.locked_by = None;
            row.locked_at = None;
            row.updated_at = Utc::now();
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
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(event_id)
            .ok_or_else(|| OutboxError::EnvelopeNotFound(event_id.to_string()))?;

        row.attempts += 1;
        row.last_error = Some(error.to_string());
        row.locked_by = None;
        row.locked_at = None;
        row.updated_at = Utc::now();

        if retryable && row.attempts < row.max_attempts {
            row.status = OutboxStatus::Failed;
            row.next_retry_at = Self::retry_at(retry_delay);
        } else {
            row.status = OutboxStatus::DeadLetter;
        }

        Ok(row.status)
    }

    async fn mark_consumed(&self, event_id: &str) -> OutboxResult<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(event_id)
            .ok_or_else(|| OutboxError::EnvelopeNotFound(event_id.to_string()))?;

        if matches!(
            row.status,
            OutboxStatus::Delivered | OutboxStatus::Processing
        ) {
            row.status = OutboxStatus::Consumed;
            row.locked_by = None;
            row.locked_at = None;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn release_locks(&self, worker_id: &str) -> OutboxResult<u64> {
        let mut rows = self.rows.lock().unwrap();
        let mut released = 0;
        for row in rows.values_mut() {
            if row.status == OutboxStatus::Processing
                && row.locked_by.as_deref() == Some(worker_id)
            {
                row.status = OutboxStatus::Pending;
                row.locked_by = None;
                row.locked_at = None;
                row.next_retry_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn reclaim_stale(&self, lock_ttl: Duration) -> OutboxResult<Vec<String>> {
        let mut rows = self.rows.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::from_std(lock_ttl).expect("duration fits");
        let mut reclaimed = Vec::new();

        for row in rows.values_mut() {
            if row.status == OutboxStatus::Processing
                && row.locked_at.is_some_and(|at| at < cutoff)
            {
                row.attempts += 1;
                row.status = if row.attempts >= row.max_attempts {
                    OutboxStatus::DeadLetter
                } else {
                    OutboxStatus::Failed
                };
                row.last_error = Some(format!(
                    "worker lock expired: {}",
                    row.locked_by.as_deref().unwrap_or("unknown")
                ));
                row.locked_by = None;
                row.locked_at = None;
                row.next_retry_at = Utc::now();
                reclaimed.push(row.event_id.clone());
            }
        }

        Ok(reclaimed)
    }

    async fn replay(
        &self,
        selector: &ReplaySelector,
        replay_token: &str,
        _note: Option<&str>,
        reset_attempts: bool,
        dry_run: bool,
    ) -> OutboxResult<ReplayReport> {
        let mut rows = self.rows.lock().unwrap();
        let mut log = self.replay_log.lock().unwrap();

        let mut selected: Vec<String> = rows
            .values()
            .filter(|row| row.status == OutboxStatus::DeadLetter)
            .filter(|row| match selector {
                ReplaySelector::EventId(id) => row.event_id == *id,
                ReplaySelector::Session(session) => row.session_id == *session,
                ReplaySelector::All { .. } => true,
            })
            .map(|row| row.event_id.clone())
            .collect();
        selected.sort_by_key(|id| rows[id].created_at);
        if let ReplaySelector::All { limit } = selector {
            selected.truncate(*limit as usize);
        }

        let mut report = ReplayReport::empty(replay_token, dry_run);
        report.selected = selected.len();

        for id in selected {
            let previous_attempts = rows[&id].attempts;
            let session_id = rows[&id].session_id.clone();
            let mut row_report = ReplayRow {
                event_id: id.clone(),
                session_id,
                previous_status: OutboxStatus::DeadLetter,
                previous_attempts,
                new_status: None,
            };

            if !dry_run && log.insert((replay_token.to_string(), id.clone())) {
                report.inserted += 1;
                let row = rows.get_mut(&id).unwrap();
                row.status = OutboxStatus::Failed;
                row.next_retry_at = Utc::now();
                row.last_error = None;
                if reset_attempts {
                    row.attempts = 0;
                }
                report.updated += 1;
                row_report.new_status = Some(OutboxStatus::Failed);
            }

            report.rows.push(row_report);
        }

        Ok(report)
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rows = self.rows.lock().unwrap();
        let undelivered: Vec<&OutboxEnvelope> = rows
            .values()
            .filter(|row| {
                matches!(
                    row.status,
                    OutboxStatus::Pending | OutboxStatus::Processing | OutboxStatus::Failed
                )
            })
            .collect();

        let age = undelivered
            .iter()
            .map(|row| (Utc::now() - row.created_at).num_seconds())
            .max()
            .unwrap_or(0);

        Ok((undelivered.len() as i64, age))
    }

    async fn status_counts(&self) -> OutboxResult<Vec<(OutboxStatus, i64)>> {
        let rows = self.rows.lock().unwrap();
        let mut counts: HashMap<OutboxStatus, i64> = HashMap::new();
        for row in rows.values() {
            *counts.entry(row.status).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Broker double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrokerState {
    /// Per-session and global streams, entries in append order
    streams: HashMap<String, Vec<(String, DeliveryEnvelope)>>,
    group_exists: bool,
    /// Index into the global stream of the next entry the group delivers
    group_cursor: usize,
    /// Delivered but unacked global entry ids, in delivery order
    pending: Vec<String>,
    next_entry: u64,
}

/// In-memory broker with failure injection.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    fail_publishes: AtomicUsize,
    reject_publishes: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes with a transient error.
    pub fn fail_next_publishes(&self, n: usize) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Reject every publish with a permanent error until cleared.
    pub fn set_reject_publishes(&self, reject: bool) {
        self.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Externally destroy the consumer group (as an operator or failover
    /// would), leaving the streams intact.
    pub fn destroy_group(&self) {
        let mut state = self.state.lock().unwrap();
        state.group_exists = false;
        state.pending.clear();
    }

    pub fn session_entries(&self, session_id: &str) -> Vec<DeliveryEnvelope> {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(&format!("{STREAM_PREFIX}{session_id}"))
            .map(|entries| entries.iter().map(|(_, env)| env.clone()).collect())
            .unwrap_or_default()
    }

    pub fn global_len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.streams.get(GLOBAL_KEY).map_or(0, |entries| entries.len())
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

#[async_trait]
impl EnvelopePublisher for InMemoryBroker {
    async fn publish(&self, envelope: &DeliveryEnvelope) -> Result<PublishReceipt, PublishError> {
        if self.reject_publishes.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected("entry too large".to_string()));
        }

        let remaining = self.fail_publishes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_publishes.store(remaining - 1, Ordering::SeqCst);
            return Err(PublishError::Transient("broker timeout".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        state.next_entry += 1;
        let entry_id = format!("{}-0", state.next_entry);

        let session_key = format!("{STREAM_PREFIX}{}", envelope.event.session_id);
        state
            .streams
            .entry(session_key)
            .or_default()
            .push((entry_id.clone(), envelope.clone()));
        state
            .streams
            .entry(GLOBAL_KEY.to_string())
            .or_default()
            .push((entry_id.clone(), envelope.clone()));

        Ok(PublishReceipt {
            session_entry_id: entry_id.clone(),
            global_entry_id: entry_id,
        })
    }
}

#[async_trait]
impl TimelineBroker for InMemoryBroker {
    async fn ensure_group(&self) -> BrokerResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.group_exists {
            state.group_exists = true;
            // Recreated at id 0, so retained entries are redelivered; the
            // consumer's idempotency absorbs the duplicates.
            state.group_cursor = 0;
            state.pending.clear();
        }
        Ok(())
    }

    async fn consume(
        &self,
        _consumer: &str,
        start_id: &str,
        _block_ms: u64,
        count: usize,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut state = self.state.lock().unwrap();
        if !state.group_exists {
            return Err(BrokerError::GroupMissing("NOGROUP".to_string()));
        }

        if start_id == "0" {
            // Re-read of this consumer's pending-entries list.
            let ids: Vec<String> = state.pending.iter().take(count).cloned().collect();
            let global = state.streams.get(GLOBAL_KEY).cloned().unwrap_or_default();
            return Ok(global
                .into_iter()
                .filter(|(id, _)| ids.contains(id))
                .map(|(entry_id, envelope)| StreamEntry { entry_id, envelope })
                .collect());
        }

        let global = state.streams.get(GLOBAL_KEY).cloned().unwrap_or_default();
        let new_entries: Vec<(String, DeliveryEnvelope)> = global
            .iter()
            .skip(state.group_cursor)
            .take(count)
            .cloned()
            .collect();

        state.group_cursor += new_entries.len();
        for (id, _) in &new_entries {
            state.pending.push(id.clone());
        }

        Ok(new_entries
            .into_iter()
            .map(|(entry_id, envelope)| StreamEntry { entry_id, envelope })
            .collect())
    }

    async fn ack(&self, entry_ids: &[String]) -> BrokerResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.group_exists {
            return Err(BrokerError::GroupMissing("NOGROUP".to_string()));
        }
        state.pending.retain(|id| !entry_ids.contains(id));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fan-out sink double
// ---------------------------------------------------------------------------

/// Records deliveries; duplicates by `event_id` are tolerated and counted.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<String>>,
    fail_next: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_deliveries(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivery_count(&self, event_id: &str) -> usize {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == event_id)
            .count()
    }
}

#[async_trait]
impl FanoutSink for RecordingSink {
    async fn deliver(&self, envelope: &DeliveryEnvelope) -> anyhow::Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("sink unavailable");
        }

        self.delivered
            .lock()
            .unwrap()
            .push(envelope.event.event_id.clone());
        Ok(())
    }
}
