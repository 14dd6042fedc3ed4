//! Operator-driven replay of dead-lettered envelopes.
//!
//! Replay is idempotent per token: each transitioned row is recorded in
//! `outbox_replay_log` under `(replay_token, event_id)` with a unique
//! constraint, and only rows whose log insert landed are reset. Repeating an
//! invocation with the same token therefore updates zero additional rows.

use serde::{Deserialize, Serialize};

use crate::OutboxStatus;

/// Which dead-letter rows to replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaySelector {
    /// A single envelope
    EventId(String),
    /// Every dead-letter envelope of one session
    Session(String),
    /// Every dead-letter envelope, bounded
    All { limit: i64 },
}

/// Before/after summary for one selected row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRow {
    pub event_id: String,
    pub session_id: String,
    pub previous_status: OutboxStatus,
    pub previous_attempts: i32,
    /// `None` when the row was skipped (token already used for it) or the
    /// run was a dry run
    pub new_status: Option<OutboxStatus>,
}

/// Outcome of one replay invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replay_token: String,
    pub dry_run: bool,
    /// Dead-letter rows matched by the selector
    pub selected: usize,
    /// Replay-log rows inserted (first use of this token per event)
    pub inserted: usize,
    /// Outbox rows actually transitioned back to `failed`
    pub updated: usize,
    pub rows: Vec<ReplayRow>,
}

impl ReplayReport {
    pub fn empty(replay_token: &str, dry_run: bool) -> Self {
        Self {
            replay_token: replay_token.to_string(),
            dry_run,
            selected: 0,
            inserted: 0,
            updated: 0,
            rows: Vec::new(),
        }
    }
}
