//! The job store: user-facing job records and their queue wiring.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::tasks::task_columns;
use super::{StoreError, StoreResult};
use crate::handlers::IntervalJobArgs;
use crate::models::{
    CreateJobRequest, IntervalProgress, IntervalSpec, IntervalStatus, Job, JobStatus, JobType,
    JobWithTasks, Page, Payload, ScheduleSpec, Task, UpdateJobRequest,
};
use crate::queue::{QueueJob, storage as queue_storage};
use crate::schedule;

const JOB_COLUMNS: &str = "id, name, user_id, workspace_id, payload, status, type, schedule, \
     interval, is_deleted, enable_recovery, next_run_at, last_run_at, current_task_id, \
     interval_progress, current_interval_id, interval_started_at, queue_entry_id, created_at, \
     updated_at, version";

/// Hard cap on page size.
const MAX_LIMIT: i64 = 20;

/// Durable record of user jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
    default_recovery_enabled: bool,
}

impl JobStore {
    /// Create a store over the shared pool. `default_recovery_enabled`
    /// seeds the `enable_recovery` flag of new jobs.
    pub fn new(pool: PgPool, default_recovery_enabled: bool) -> Self {
        Self {
            pool,
            default_recovery_enabled,
        }
    }

    /// Validate the request, insert the job row, and enqueue its first
    /// firing, all in one transaction. A queue failure rolls back the row.
    #[instrument(name = "jobs.create", skip(self, req), fields(user.id = %user_id))]
    pub async fn create_job(&self, req: CreateJobRequest, user_id: Uuid) -> StoreResult<Job> {
        validate_request(&req)?;

        let now = Utc::now();
        let mut job = Job {
            id: Uuid::new_v4(),
            name: req.name,
            user_id,
            workspace_id: req.workspace_id,
            payload: req.payload,
            status: JobStatus::Active,
            job_type: req.job_type,
            schedule: req.schedule,
            interval: req.interval,
            is_deleted: false,
            enable_recovery: req.enable_recovery.unwrap_or(self.default_recovery_enabled),
            next_run_at: None,
            last_run_at: None,
            current_task_id: None,
            interval_progress: None,
            current_interval_id: None,
            interval_started_at: None,
            queue_entry_id: 0,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        let next_run_at = schedule::compute_next(&job)?;
        job.next_run_at = Some(next_run_at);

        let mut tx = self.pool.begin().await?;
        insert_job_row(&mut tx, &job).await?;

        let args = IntervalJobArgs {
            job_id: job.id,
            user_id: job.user_id,
            workspace_id: job.workspace_id,
            payload: job.payload.clone(),
            task_id: None,
        };
        if let Some(entry_id) = args.enqueue_at(&mut *tx, next_run_at).await? {
            sqlx::query("UPDATE jobs SET queue_entry_id = $1 WHERE id = $2")
                .bind(entry_id)
                .bind(job.id)
                .execute(&mut *tx)
                .await?;
            job.queue_entry_id = entry_id;
        }
        tx.commit().await?;

        info!(job.id = %job.id, next_run_at = %next_run_at, "job created");
        Ok(job)
    }

    /// Fetch one job scoped to its owner, plus a page of its tasks,
    /// newest first.
    pub async fn get_job(
        &self,
        id: Uuid,
        user_id: Uuid,
        task_page: i64,
        task_limit: i64,
    ) -> StoreResult<JobWithTasks> {
        let job = self.fetch_owned(id, user_id).await?;

        let page = task_page.max(1);
        let limit = clamp_limit(task_limit);

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tasks WHERE job_id = $1 AND is_deleted = FALSE",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        let data = sqlx::query_as::<_, Task>(&format!(
            r"
            SELECT {}
            FROM tasks
            WHERE job_id = $1 AND is_deleted = FALSE
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            ",
            task_columns(),
        ))
        .bind(id)
        .bind((page - 1) * limit)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(JobWithTasks {
            job,
            tasks: Page {
                data,
                total,
                total_page: total_pages(total, limit),
                page,
                limit,
            },
        })
    }

    /// List the caller's jobs in a workspace, newest first.
    pub async fn get_jobs(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
        page: i64,
        limit: i64,
    ) -> StoreResult<Page<Job>> {
        let page = page.max(1);
        let limit = clamp_limit(limit);

        let total = sqlx::query_scalar::<_, i64>(
            r"
            SELECT COUNT(*) FROM jobs
            WHERE user_id = $1 AND workspace_id = $2 AND is_deleted = FALSE
            ",
        )
        .bind(user_id)
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await?;

        let data = sqlx::query_as::<_, Job>(&format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE user_id = $1 AND workspace_id = $2 AND is_deleted = FALSE
            ORDER BY created_at DESC
            OFFSET $3 LIMIT $4
            ",
        ))
        .bind(user_id)
        .bind(workspace_id)
        .bind((page - 1) * limit)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            data,
            total,
            total_page: total_pages(total, limit),
            page,
            limit,
        })
    }

    /// Soft-delete a job and purge its not-yet-dispatched queue entries,
    /// in one transaction. The tombstone is retained.
    #[instrument(name = "jobs.delete", skip(self), fields(job.id = %id))]
    pub async fn delete_job(&self, id: Uuid, user_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let found = sqlx::query_scalar::<_, Uuid>(
            r"
            SELECT id FROM jobs
            WHERE id = $1 AND user_id = $2 AND is_deleted = FALSE
            FOR UPDATE
            ",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if found.is_none() {
            return Err(StoreError::NotFound);
        }

        sqlx::query(
            r"
            UPDATE jobs
            SET is_deleted = TRUE, status = 'deleted', updated_at = NOW(), version = version + 1
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let purged = queue_storage::delete_pending_entries_for_job(&mut *tx, id).await?;
        tx.commit().await?;

        debug!(purged, "job deleted");
        Ok(())
    }

    /// Pause the job. Pending queue entries are left alone; the dispatcher
    /// cancels them when they come due.
    pub async fn pause_job(&self, id: Uuid, user_id: Uuid) -> StoreResult<()> {
        self.set_status(id, user_id, JobStatus::Inactive).await
    }

    /// Resume a paused job.
    pub async fn resume_job(&self, id: Uuid, user_id: Uuid) -> StoreResult<()> {
        self.set_status(id, user_id, JobStatus::Active).await
    }

    async fn set_status(&self, id: Uuid, user_id: Uuid, status: JobStatus) -> StoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = $1, updated_at = NOW(), version = version + 1
            WHERE id = $2 AND user_id = $3 AND is_deleted = FALSE
            ",
        )
        .bind(status)
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Update a job. Name and prompt edits mutate in place; any change to
    /// the type, schedule, or interval replaces the job under a fresh id.
    /// Rejected while any of the job's tasks is running.
    #[instrument(name = "jobs.update", skip(self, req), fields(job.id = %id))]
    pub async fn update_job(
        &self,
        id: Uuid,
        user_id: Uuid,
        req: UpdateJobRequest,
    ) -> StoreResult<Job> {
        let job = self.fetch_owned(id, user_id).await?;

        if self.has_running_tasks(id).await? {
            return Err(StoreError::Conflict(
                "job has running tasks; retry when they finish".into(),
            ));
        }

        let type_changed = req.job_type.is_some_and(|t| t != job.job_type);
        let schedule_changed = req
            .schedule
            .as_ref()
            .is_some_and(|s| Some(s) != job.schedule.as_ref());
        let interval_changed = req
            .interval
            .as_ref()
            .is_some_and(|i| Some(i) != job.interval.as_ref());

        if type_changed || schedule_changed || interval_changed {
            self.replace_job(job, req).await
        } else {
            self.update_in_place(job, req).await
        }
    }

    async fn update_in_place(&self, job: Job, req: UpdateJobRequest) -> StoreResult<Job> {
        let name = req.name.unwrap_or(job.name);
        let mut payload = job.payload;
        if let Some(prompt) = req.payload.as_ref().and_then(|p| p.get("prompt")) {
            if let Some(object) = payload.as_object_mut() {
                object.insert("prompt".into(), prompt.clone());
            }
        }

        let updated = sqlx::query_as::<_, Job>(&format!(
            r"
            UPDATE jobs
            SET name = $1, payload = $2, updated_at = NOW(), version = version + 1
            WHERE id = $3
            RETURNING {JOB_COLUMNS}
            ",
        ))
        .bind(name)
        .bind(payload)
        .bind(job.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated)
    }

    /// Soft-delete the old row and create a successor with a fresh id and
    /// a fresh first queue entry.
    async fn replace_job(&self, old: Job, req: UpdateJobRequest) -> StoreResult<Job> {
        let now = Utc::now();
        let mut job = Job {
            id: Uuid::new_v4(),
            name: req.name.unwrap_or_else(|| old.name.clone()),
            user_id: old.user_id,
            workspace_id: old.workspace_id,
            payload: req.payload.unwrap_or_else(|| old.payload.clone()),
            status: JobStatus::Active,
            job_type: req.job_type.unwrap_or(old.job_type),
            schedule: req.schedule.or_else(|| old.schedule.clone()),
            interval: req.interval.or_else(|| old.interval.clone()),
            is_deleted: false,
            enable_recovery: old.enable_recovery,
            next_run_at: None,
            last_run_at: None,
            current_task_id: None,
            interval_progress: None,
            current_interval_id: None,
            interval_started_at: None,
            queue_entry_id: 0,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        validate_descriptor(job.job_type, job.schedule.as_ref(), job.interval.as_ref())?;
        let next_run_at = schedule::compute_next(&job)?;
        job.next_run_at = Some(next_run_at);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            UPDATE jobs
            SET is_deleted = TRUE, status = 'deleted', updated_at = NOW(), version = version + 1
            WHERE id = $1
            ",
        )
        .bind(old.id)
        .execute(&mut *tx)
        .await?;
        queue_storage::delete_pending_entries_for_job(&mut *tx, old.id).await?;

        insert_job_row(&mut tx, &job).await?;
        let args = IntervalJobArgs {
            job_id: job.id,
            user_id: job.user_id,
            workspace_id: job.workspace_id,
            payload: job.payload.clone(),
            task_id: None,
        };
        if let Some(entry_id) = args.enqueue_at(&mut *tx, next_run_at).await? {
            sqlx::query("UPDATE jobs SET queue_entry_id = $1 WHERE id = $2")
                .bind(entry_id)
                .bind(job.id)
                .execute(&mut *tx)
                .await?;
            job.queue_entry_id = entry_id;
        }
        tx.commit().await?;

        info!(old.id = %old.id, new.id = %job.id, "job replaced");
        Ok(job)
    }

    /// Dispatch-time probe: is the job still eligible to fire?
    pub async fn is_job_active(&self, id: Uuid) -> StoreResult<bool> {
        let active = sqlx::query_scalar::<_, bool>(
            r"
            SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE id = $1 AND status = 'active' AND is_deleted = FALSE
            )
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(active)
    }

    /// All active jobs, most recently touched first.
    pub async fn list_active_jobs(&self) -> StoreResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'active' AND is_deleted = FALSE
            ORDER BY updated_at DESC, created_at DESC
            ",
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Fetch an active interval job by id.
    pub async fn find_active_interval_job(&self, id: Uuid) -> StoreResult<Job> {
        sqlx::query_as::<_, Job>(&format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE id = $1 AND type = 'interval' AND status = 'active' AND is_deleted = FALSE
            ",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    /// Compute the next cron firing, enqueue it, and persist the new
    /// `next_run_at` in one transaction, so the entry id write-back cannot
    /// race the insert.
    #[instrument(name = "jobs.reschedule", skip(self, job), fields(job.id = %job.id))]
    pub async fn reschedule_interval_job(&self, job: &Job) -> StoreResult<DateTime<Utc>> {
        let next_run_at = schedule::compute_next(job)?;

        let args = IntervalJobArgs {
            job_id: job.id,
            user_id: job.user_id,
            workspace_id: job.workspace_id,
            payload: job.payload.clone(),
            task_id: None,
        };

        let mut tx = self.pool.begin().await?;
        let entry_id = args.enqueue_at(&mut *tx, next_run_at).await?;
        sqlx::query(
            r"
            UPDATE jobs
            SET next_run_at = $1, last_run_at = NOW(), updated_at = NOW(),
                version = version + 1, queue_entry_id = COALESCE($2, queue_entry_id)
            WHERE id = $3 AND status = 'active' AND is_deleted = FALSE
            ",
        )
        .bind(next_run_at)
        .bind(entry_id)
        .bind(job.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(next_run_at = %next_run_at, deduplicated = entry_id.is_none(), "rescheduled");
        Ok(next_run_at)
    }

    /// The current interval progress of an active interval job, if any.
    pub async fn interval_progress(&self, job_id: Uuid) -> StoreResult<Option<IntervalProgress>> {
        let raw = sqlx::query_scalar::<_, Option<Value>>(
            r"
            SELECT interval_progress FROM jobs
            WHERE id = $1 AND type = 'interval' AND status = 'active' AND is_deleted = FALSE
            ",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match raw.flatten() {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| StoreError::Validation(format!("corrupt interval progress: {err}"))),
        }
    }

    /// Persist updated interval progress and its bookkeeping columns.
    pub async fn update_interval_progress(
        &self,
        job_id: Uuid,
        progress: &IntervalProgress,
    ) -> StoreResult<()> {
        let value = serde_json::to_value(progress)
            .map_err(|err| StoreError::Validation(err.to_string()))?;

        sqlx::query(
            r"
            UPDATE jobs
            SET interval_progress = $1, current_interval_id = $2, interval_started_at = $3,
                updated_at = NOW(), version = version + 1
            WHERE id = $4 AND type = 'interval' AND status = 'active' AND is_deleted = FALSE
            ",
        )
        .bind(value)
        .bind(&progress.interval_id)
        .bind(progress.started_at)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Begin tracking a new interval execution with `total_tasks`
    /// outstanding sub-tasks.
    pub async fn start_new_interval(
        &self,
        job_id: Uuid,
        total_tasks: i32,
    ) -> StoreResult<IntervalProgress> {
        let progress = IntervalProgress::start(total_tasks, Utc::now());
        self.update_interval_progress(job_id, &progress).await?;
        Ok(progress)
    }

    /// Mark the interval completed. Guarded by `interval_id` equality and
    /// idempotent: completing twice is a no-op.
    pub async fn complete_interval(&self, job_id: Uuid, interval_id: &str) -> StoreResult<()> {
        let Some(mut progress) = self.interval_progress(job_id).await? else {
            return Err(StoreError::Validation(format!(
                "interval {interval_id} not found for job {job_id}"
            )));
        };
        if progress.interval_id != interval_id {
            return Err(StoreError::Validation(format!(
                "interval {interval_id} not found for job {job_id}"
            )));
        }
        if progress.status == IntervalStatus::Completed {
            return Ok(());
        }

        progress.status = IntervalStatus::Completed;
        progress.last_updated_at = Utc::now();
        self.update_interval_progress(job_id, &progress).await
    }

    /// Active interval jobs whose tracked interval is still running.
    pub async fn incomplete_interval_jobs(&self) -> StoreResult<Vec<(Job, IntervalProgress)>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE type = 'interval' AND status = 'active' AND is_deleted = FALSE
              AND current_interval_id IS NOT NULL AND interval_progress IS NOT NULL
            ",
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut incomplete = Vec::new();
        for job in jobs {
            let Some(raw) = job.interval_progress.clone() else {
                continue;
            };
            // A single corrupt row must not stall the sweep.
            let Ok(progress) = serde_json::from_value::<IntervalProgress>(raw) else {
                continue;
            };
            if progress.status == IntervalStatus::Running {
                incomplete.push((job, progress));
            }
        }
        Ok(incomplete)
    }

    async fn fetch_owned(&self, id: Uuid, user_id: Uuid) -> StoreResult<Job> {
        sqlx::query_as::<_, Job>(&format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE id = $1 AND user_id = $2 AND is_deleted = FALSE
            ",
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn has_running_tasks(&self, job_id: Uuid) -> StoreResult<bool> {
        let running = sqlx::query_scalar::<_, bool>(
            r"
            SELECT EXISTS (
                SELECT 1 FROM tasks
                WHERE job_id = $1 AND status = 'running' AND is_deleted = FALSE
            )
            ",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(running)
    }
}

async fn insert_job_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job: &Job,
) -> StoreResult<()> {
    sqlx::query(
        r"
        INSERT INTO jobs (id, name, user_id, workspace_id, payload, status, type, schedule,
                          interval, is_deleted, enable_recovery, next_run_at, created_at,
                          updated_at, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ",
    )
    .bind(job.id)
    .bind(&job.name)
    .bind(job.user_id)
    .bind(job.workspace_id)
    .bind(&job.payload)
    .bind(job.status)
    .bind(job.job_type)
    .bind(&job.schedule)
    .bind(&job.interval)
    .bind(job.is_deleted)
    .bind(job.enable_recovery)
    .bind(job.next_run_at)
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.version)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn validate_request(req: &CreateJobRequest) -> StoreResult<()> {
    if req.name.trim().is_empty() {
        return Err(StoreError::Validation("name is required".into()));
    }
    Payload::from_value(&req.payload)
        .map_err(|err| StoreError::Validation(format!("invalid payload: {err}")))?;
    validate_descriptor(req.job_type, req.schedule.as_ref(), req.interval.as_ref())
}

fn validate_descriptor(
    job_type: JobType,
    schedule: Option<&Value>,
    interval: Option<&Value>,
) -> StoreResult<()> {
    match job_type {
        JobType::Scheduled => {
            let descriptor =
                schedule.ok_or_else(|| StoreError::Validation("schedule is required".into()))?;
            let spec: ScheduleSpec = serde_json::from_value(descriptor.clone())
                .map_err(|err| StoreError::Validation(format!("invalid schedule: {err}")))?;
            if spec.execute_at.is_none() {
                return Err(StoreError::Validation(
                    "execute_at is required for scheduled jobs".into(),
                ));
            }
        }
        JobType::Interval => {
            let descriptor =
                interval.ok_or_else(|| StoreError::Validation("interval is required".into()))?;
            let spec: IntervalSpec = serde_json::from_value(descriptor.clone())
                .map_err(|err| StoreError::Validation(format!("invalid interval: {err}")))?;
            if spec.interval_type.is_empty() {
                return Err(StoreError::Validation(
                    "interval_type is required for interval jobs".into(),
                ));
            }
            if spec.value.is_none() {
                return Err(StoreError::Validation(
                    "value is required for interval jobs".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Clamp a caller-supplied page size into `[1, 20]`.
fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, MAX_LIMIT)
}

fn total_pages(total: i64, limit: i64) -> i64 {
    if total == 0 { 0 } else { (total + limit - 1) / limit }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn limits_are_clamped_into_range() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(-3), 1);
        assert_eq!(clamp_limit(10), 10);
        assert_eq!(clamp_limit(21), 20);
        assert_eq!(clamp_limit(1000), 20);
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(total_pages(0, 10), 0);
        assert_eq!(total_pages(1, 10), 1);
        assert_eq!(total_pages(10, 10), 1);
        assert_eq!(total_pages(11, 10), 2);
    }

    fn base_request() -> CreateJobRequest {
        CreateJobRequest {
            name: "daily digest".into(),
            workspace_id: Uuid::new_v4(),
            payload: json!({
                "prompt": "summarize",
                "resource_name": "ai_agent",
                "resource_data": "{\"id\":\"a\",\"name\":\"n\",\"description\":\"\",\"url\":\"http://x\"}",
            }),
            job_type: JobType::Interval,
            schedule: None,
            interval: Some(json!({"interval_type": "minutes", "value": "*/5 * * * *"})),
            enable_recovery: None,
        }
    }

    #[test]
    fn request_validation_checks_descriptor_coherence() {
        assert!(validate_request(&base_request()).is_ok());

        let mut missing_interval = base_request();
        missing_interval.interval = None;
        assert!(matches!(
            validate_request(&missing_interval),
            Err(StoreError::Validation(_))
        ));

        let mut scheduled_without_descriptor = base_request();
        scheduled_without_descriptor.job_type = JobType::Scheduled;
        assert!(matches!(
            validate_request(&scheduled_without_descriptor),
            Err(StoreError::Validation(_))
        ));

        let mut bad_payload = base_request();
        bad_payload.payload = json!({"prompt": "x"});
        assert!(matches!(
            validate_request(&bad_payload),
            Err(StoreError::Validation(_))
        ));
    }
}
