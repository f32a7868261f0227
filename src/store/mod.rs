//! Durable job and task records.
//!
//! The stores are the single writer for the `jobs` and `tasks` tables.
//! Every mutation that spans a row plus a queue insert runs inside one
//! transaction, so a queue failure rolls the row back too.

mod jobs;
mod tasks;

pub use self::jobs::JobStore;
pub use self::tasks::{OrphanedTask, TaskStore};

use crate::queue::EnqueueError;
use crate::schedule::ScheduleError;

/// Error returned by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The row does not exist, or belongs to another user.
    #[error("not found")]
    NotFound,
    /// The operation conflicts with in-flight work.
    #[error("{0}")]
    Conflict(String),
    /// The request is malformed.
    #[error("{0}")]
    Validation(String),
    /// The schedule descriptor could not be resolved.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    /// The paired queue insert failed.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
    /// The database rejected the operation.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Shorthand for store results.
pub type StoreResult<T> = Result<T, StoreError>;
