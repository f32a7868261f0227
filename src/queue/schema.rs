//! Row definitions for the queue's own table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Dispatch state of a queue entry. `Available` is the only non-terminal
/// state; everything else is retained for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Waiting for (or currently held by) a worker.
    Available,
    /// Handler returned success.
    Completed,
    /// Attempt budget exhausted.
    Discarded,
    /// Handler declined the entry; never retried.
    Cancelled,
}

/// A durable, dispatchable record in the work queue.
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntry {
    /// Queue-assigned identifier.
    pub id: i64,
    /// Named queue this entry belongs to.
    pub queue: String,
    /// Handler kind, used for dispatch.
    pub kind: String,
    /// JSON arguments handed to the handler.
    pub args: Value,
    /// Dispatch state.
    pub status: EntryStatus,
    /// Earliest instant the entry may be dispatched.
    pub scheduled_at: DateTime<Utc>,
    /// Failed attempts so far.
    pub attempts: i32,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Reason recorded when the handler cancelled the entry.
    pub cancel_reason: Option<String>,
    /// Error recorded on the most recent failed attempt.
    pub last_error: Option<String>,
    /// Insertion timestamp; anchors the uniqueness window.
    pub created_at: DateTime<Utc>,
    /// When the entry reached a terminal state.
    pub finalized_at: Option<DateTime<Utc>>,
}
