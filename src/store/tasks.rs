//! The task store: one row per firing, plus the boot-time reset of
//! interrupted tasks.

use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{StoreError, StoreResult};
use crate::models::{Task, TaskStatus};

const TASK_COLUMNS: &str =
    "id, job_id, status, payload, result, is_deleted, created_at, updated_at, version";

pub(crate) fn task_columns() -> &'static str {
    TASK_COLUMNS
}

/// A `running` task found at boot, reset by [`TaskStore::reset_running_tasks`].
#[derive(Debug, Clone, FromRow)]
pub struct OrphanedTask {
    /// The reset task.
    pub task_id: Uuid,
    /// Its parent job.
    pub job_id: Uuid,
    /// The job's owner.
    pub user_id: Uuid,
    /// The owner's workspace.
    pub workspace_id: Uuid,
    /// The payload snapshot the task was fired with.
    pub payload: Value,
}

/// Durable record of task rows. Cheap to clone.
#[derive(Clone)]
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    /// Create a store over the shared pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Materialize a task in state `created` and point the job's
    /// `current_task_id` at it.
    #[instrument(name = "tasks.create", skip(self, payload), fields(job.id = %job_id))]
    pub async fn create(&self, job_id: Uuid, payload: &Value) -> StoreResult<Uuid> {
        let task_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r"
            INSERT INTO tasks (id, job_id, status, payload, result, version)
            VALUES ($1, $2, 'created', $3, '', 1)
            ",
        )
        .bind(task_id)
        .bind(job_id)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE jobs SET current_task_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(task_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(task.id = %task_id, "task created");
        Ok(task_id)
    }

    /// Move a task to `running`.
    pub async fn mark_running(&self, task_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'running', updated_at = NOW(), version = version + 1
            WHERE id = $1
            ",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Move a task to a terminal state, record its result, and release
    /// the job's `current_task_id` if it still points here.
    pub async fn finish(
        &self,
        job_id: Uuid,
        task_id: Uuid,
        status: TaskStatus,
        result: &str,
    ) -> StoreResult<()> {
        debug_assert!(status.is_terminal());

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r"
            UPDATE tasks
            SET status = $1, result = $2, updated_at = NOW(), version = version + 1
            WHERE id = $3
            ",
        )
        .bind(status)
        .bind(result)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        sqlx::query(
            r"
            UPDATE jobs
            SET current_task_id = NULL, updated_at = NOW()
            WHERE id = $1 AND current_task_id = $2
            ",
        )
        .bind(job_id)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Fetch a task row by id.
    pub async fn get(&self, task_id: Uuid) -> StoreResult<Task> {
        sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND is_deleted = FALSE",
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    /// Whether a task may still be (re-)executed: it exists, is not
    /// deleted, and has not reached a terminal state.
    pub async fn is_recoverable(&self, task_id: Uuid) -> StoreResult<bool> {
        let recoverable = sqlx::query_scalar::<_, bool>(
            r"
            SELECT EXISTS (
                SELECT 1 FROM tasks
                WHERE id = $1 AND status IN ('created', 'running') AND is_deleted = FALSE
            )
            ",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(recoverable)
    }

    /// Boot-time reset: every task left `running` goes back to `created`
    /// with its result cleared, and the owning jobs' `current_task_id`
    /// columns are released, as two batched updates in one transaction.
    ///
    /// Returns the reset tasks with enough context to re-enqueue them.
    /// Running it again immediately afterwards finds nothing and is a
    /// no-op.
    #[instrument(name = "tasks.reset_running", skip(self))]
    pub async fn reset_running_tasks(&self) -> StoreResult<Vec<OrphanedTask>> {
        let mut tx = self.pool.begin().await?;

        let orphans = sqlx::query_as::<_, OrphanedTask>(
            r"
            SELECT t.id AS task_id, t.job_id, j.user_id, j.workspace_id, t.payload
            FROM tasks t
            JOIN jobs j ON j.id = t.job_id
            WHERE t.status = 'running' AND t.is_deleted = FALSE AND j.is_deleted = FALSE
            FOR UPDATE OF t
            ",
        )
        .fetch_all(&mut *tx)
        .await?;

        if orphans.is_empty() {
            tx.rollback().await?;
            return Ok(orphans);
        }

        let task_ids: Vec<Uuid> = orphans.iter().map(|o| o.task_id).collect();
        let job_ids: Vec<Uuid> = orphans.iter().map(|o| o.job_id).collect();

        sqlx::query(
            r"
            UPDATE tasks
            SET status = 'created', result = '', updated_at = NOW(), version = version + 1
            WHERE id = ANY($1)
            ",
        )
        .bind(&task_ids)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
            UPDATE jobs
            SET current_task_id = NULL, updated_at = NOW()
            WHERE id = ANY($1) AND current_task_id IS NOT NULL
            ",
        )
        .bind(&job_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(orphans)
    }
}
