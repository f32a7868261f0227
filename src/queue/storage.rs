use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, Postgres, Transaction};
use uuid::Uuid;

use super::schema::QueueEntry;

const ENTRY_COLUMNS: &str = "id, queue, kind, args, status, scheduled_at, attempts, \
     max_attempts, cancel_reason, last_error, created_at, finalized_at";

/// Finds the next ready entry and locks it for the duration of the
/// enclosing transaction. Entries for the same job dispatch in
/// `scheduled_at` order.
pub(crate) async fn find_next_unlocked_entry_tx(
    tx: &mut Transaction<'_, Postgres>,
    queue: &str,
    kinds: &[String],
) -> Result<QueueEntry, sqlx::Error> {
    sqlx::query_as::<_, QueueEntry>(&format!(
        r"
        SELECT {ENTRY_COLUMNS}
        FROM queue_entries
        WHERE queue = $1
          AND kind = ANY($2)
          AND status = 'available'
          AND scheduled_at <= NOW()
        ORDER BY scheduled_at ASC, id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        ",
    ))
    .bind(queue)
    .bind(kinds)
    .fetch_one(&mut **tx)
    .await
}

pub(crate) async fn mark_completed(
    tx: &mut Transaction<'_, Postgres>,
    entry_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE queue_entries SET status = 'completed', finalized_at = NOW() WHERE id = $1",
    )
    .bind(entry_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn mark_cancelled(
    tx: &mut Transaction<'_, Postgres>,
    entry_id: i64,
    reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE queue_entries
        SET status = 'cancelled', cancel_reason = $2, finalized_at = NOW()
        WHERE id = $1
        ",
    )
    .bind(entry_id)
    .bind(reason)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn mark_discarded(
    tx: &mut Transaction<'_, Postgres>,
    entry_id: i64,
    attempts: i32,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE queue_entries
        SET status = 'discarded', attempts = $2, last_error = $3, finalized_at = NOW()
        WHERE id = $1
        ",
    )
    .bind(entry_id)
    .bind(attempts)
    .bind(error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Marks that we just tried and failed to run an entry, pushing it into
/// the future for the next attempt.
pub(crate) async fn reschedule_retry(
    tx: &mut Transaction<'_, Postgres>,
    entry_id: i64,
    attempts: i32,
    error: &str,
    next_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE queue_entries
        SET attempts = $2, last_error = $3, scheduled_at = $4
        WHERE id = $1
        ",
    )
    .bind(entry_id)
    .bind(attempts)
    .bind(error)
    .bind(next_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Deletes the not-yet-dispatched entries whose args reference `job_id`.
/// Used when a job is soft-deleted or replaced.
pub(crate) async fn delete_pending_entries_for_job<'e, E>(
    executor: E,
    job_id: Uuid,
) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "DELETE FROM queue_entries WHERE status = 'available' AND args ->> 'job_id' = $1",
    )
    .bind(job_id.to_string())
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}
