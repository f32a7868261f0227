//! The [`QueueJob`] trait and entry insertion.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgExecutor;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// The queue name used when a job does not specify one.
pub const DEFAULT_QUEUE: &str = "default";

/// Error type for queue insertion.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The args failed to serialize to JSON.
    #[error("failed to serialize queue args: {0}")]
    SerializationError(#[from] serde_json::Error),
    /// The insert itself failed.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}

/// Returned (wrapped in `anyhow`) by a handler to finalize its entry as
/// cancelled instead of failed. A cancelled entry is never retried.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct CancelJob {
    reason: String,
}

impl CancelJob {
    /// Cancel with the given audit reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The audit reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// How duplicate inserts are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniquePolicy {
    /// Always insert.
    None,
    /// Suppress the insert while any non-terminal entry with identical
    /// args exists.
    ByArgs,
    /// Suppress the insert while a non-terminal entry with identical args
    /// was created within the window.
    ByArgsWithin(Duration),
}

/// A unit of work that can be enqueued and dispatched by the queue runtime.
pub trait QueueJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique kind of the entry. MUST be unique across the application.
    const KIND: &'static str;

    /// Attempt budget for entries of this kind.
    const MAX_ATTEMPTS: i32 = 3;

    /// Duplicate suppression policy for entries of this kind.
    const UNIQUE: UniquePolicy = UniquePolicy::None;

    /// Queue this kind is dispatched on.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the entry. Returning `Err` consumes an attempt; a wrapped
    /// [`CancelJob`] finalizes the entry as cancelled instead.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Insert an entry for this job, dispatchable at `scheduled_at`.
    ///
    /// Returns the entry id, or `None` when the uniqueness policy
    /// suppressed the insert.
    #[instrument(name = "queue.enqueue", skip(self, executor), fields(kind = Self::KIND))]
    fn enqueue_at<'e, E>(
        &self,
        executor: E,
        scheduled_at: DateTime<Utc>,
    ) -> BoxFuture<'e, Result<Option<i64>, EnqueueError>>
    where
        E: PgExecutor<'e> + 'e,
    {
        self.enqueue_with(executor, scheduled_at, Self::MAX_ATTEMPTS)
    }

    /// Like [`QueueJob::enqueue_at`], with an explicit attempt budget.
    fn enqueue_with<'e, E>(
        &self,
        executor: E,
        scheduled_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> BoxFuture<'e, Result<Option<i64>, EnqueueError>>
    where
        E: PgExecutor<'e> + 'e,
    {
        let args = match serde_json::to_value(self) {
            Ok(args) => args,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        match Self::UNIQUE {
            UniquePolicy::None => {
                let future =
                    insert_entry(executor, Self::QUEUE, Self::KIND, args, scheduled_at, max_attempts);
                async move { Ok(Some(future.await?)) }.boxed()
            }
            UniquePolicy::ByArgs => insert_entry_unique(
                executor,
                Self::QUEUE,
                Self::KIND,
                args,
                scheduled_at,
                max_attempts,
                None,
            ),
            UniquePolicy::ByArgsWithin(window) => insert_entry_unique(
                executor,
                Self::QUEUE,
                Self::KIND,
                args,
                scheduled_at,
                max_attempts,
                Some(window),
            ),
        }
    }
}

fn insert_entry<'e, E>(
    executor: E,
    queue: &'static str,
    kind: &'static str,
    args: Value,
    scheduled_at: DateTime<Utc>,
    max_attempts: i32,
) -> BoxFuture<'e, Result<i64, EnqueueError>>
where
    E: PgExecutor<'e> + 'e,
{
    async move {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO queue_entries (queue, kind, args, scheduled_at, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(queue)
        .bind(kind)
        .bind(args)
        .bind(scheduled_at)
        .bind(max_attempts)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }
    .boxed()
}

fn insert_entry_unique<'e, E>(
    executor: E,
    queue: &'static str,
    kind: &'static str,
    args: Value,
    scheduled_at: DateTime<Utc>,
    max_attempts: i32,
    window: Option<Duration>,
) -> BoxFuture<'e, Result<Option<i64>, EnqueueError>>
where
    E: PgExecutor<'e> + 'e,
{
    // A null cutoff disables the time bound: any non-terminal duplicate
    // suppresses the insert.
    let cutoff = window.and_then(|window| {
        chrono::Duration::from_std(window)
            .ok()
            .map(|window| Utc::now() - window)
    });

    async move {
        // Insert only if no similar entry exists. Rows locked by a worker
        // are skipped, so an in-flight firing never suppresses its own
        // follow-up.
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO queue_entries (queue, kind, args, scheduled_at, max_attempts)
            SELECT $1, $2, $3, $4, $5
            WHERE NOT EXISTS (
                SELECT 1 FROM queue_entries
                WHERE kind = $2
                  AND args = $3
                  AND status = 'available'
                  AND ($6::timestamptz IS NULL OR created_at > $6)
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            ",
        )
        .bind(queue)
        .bind(kind)
        .bind(args)
        .bind(scheduled_at)
        .bind(max_attempts)
        .bind(cutoff)
        .fetch_optional(executor)
        .await?;

        Ok(id)
    }
    .boxed()
}
