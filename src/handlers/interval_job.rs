//! The `interval_job` handler: one firing of a job.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::{WorkerContext, execute_resource, render_result};
use crate::models::{IntervalStatus, Payload, TaskResultRecord, TaskStatus};
use crate::queue::{CancelJob, QueueJob, UniquePolicy};
use crate::store::StoreError;

use super::task_recovery::TaskRecoveryArgs;

/// The minimum allowed recurring interval is five minutes, so a
/// four-minute window suppresses duplicate firings without ever
/// swallowing a legitimate one.
const UNIQUE_WINDOW: Duration = Duration::from_secs(4 * 60);

/// Queue args for one firing of a job. When `task_id` is set, the firing
/// resumes a recovered task instead of materializing a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalJobArgs {
    /// The job being fired.
    pub job_id: Uuid,
    /// The job's owner.
    pub user_id: Uuid,
    /// The owner's workspace.
    pub workspace_id: Uuid,
    /// Payload snapshot taken when the entry was inserted.
    pub payload: Value,
    /// Set by boot-time recovery to resume an interrupted task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
}

impl QueueJob for IntervalJobArgs {
    const KIND: &'static str = "interval_job";

    // Failures surface immediately; reliability is delegated to the next
    // scheduled firing.
    const MAX_ATTEMPTS: i32 = 1;

    const UNIQUE: UniquePolicy = UniquePolicy::ByArgsWithin(UNIQUE_WINDOW);

    type Context = WorkerContext;

    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()> {
        info!(job.id = %self.job_id, "executing scheduled firing");

        if !ctx.jobs.is_job_active(self.job_id).await? {
            return Err(CancelJob::new(format!("job {} is no longer active", self.job_id)).into());
        }

        let payload = Payload::from_value(&self.payload)?;

        if let Some(task_id) = self.task_id {
            return self.resume_task(&ctx, task_id, &payload).await;
        }

        if self.should_use_recovery(&ctx).await {
            self.execute_with_progress(&ctx, &payload).await
        } else {
            self.execute_plain(&ctx, &payload).await
        }
    }
}

impl IntervalJobArgs {
    /// The plain path: materialize a task, line up the next firing, call
    /// the agent, persist the outcome.
    async fn execute_plain(&self, ctx: &WorkerContext, payload: &Payload) -> anyhow::Result<()> {
        let task_id = ctx.tasks.create(self.job_id, &self.payload).await?;

        // Line up the follow-up before doing any remote work, so a crash
        // mid-execution still produces a future firing.
        self.schedule_next_firing(ctx).await;

        match execute_resource(ctx, task_id, payload).await {
            Ok(result) => {
                ctx.tasks
                    .finish(
                        self.job_id,
                        task_id,
                        TaskStatus::Completed,
                        &render_result(&result),
                    )
                    .await?;
                info!(job.id = %self.job_id, task.id = %task_id, "firing completed");
                Ok(())
            }
            Err(error) => {
                let message = format!("{error:#}");
                if let Err(update_error) = ctx
                    .tasks
                    .finish(self.job_id, task_id, TaskStatus::Failed, &message)
                    .await
                {
                    warn!(%update_error, "failed to record task failure");
                }
                Err(error)
            }
        }
    }

    /// Resume a task that boot-time recovery reset to `created`. The
    /// interrupted firing already produced the follow-up entry, so no
    /// reschedule happens here.
    async fn resume_task(
        &self,
        ctx: &WorkerContext,
        task_id: Uuid,
        payload: &Payload,
    ) -> anyhow::Result<()> {
        if !ctx.tasks.is_recoverable(task_id).await? {
            info!(task.id = %task_id, "task already finished; nothing to resume");
            return Ok(());
        }

        info!(job.id = %self.job_id, task.id = %task_id, "resuming recovered task");
        match execute_resource(ctx, task_id, payload).await {
            Ok(result) => {
                ctx.tasks
                    .finish(
                        self.job_id,
                        task_id,
                        TaskStatus::Completed,
                        &render_result(&result),
                    )
                    .await?;
                Ok(())
            }
            Err(error) => {
                let message = format!("{error:#}");
                if let Err(update_error) = ctx
                    .tasks
                    .finish(self.job_id, task_id, TaskStatus::Failed, &message)
                    .await
                {
                    warn!(%update_error, "failed to record task failure");
                }
                Err(error)
            }
        }
    }

    /// Whether this firing should track interval progress. Requires the
    /// global switch, an active interval job, and the job's own flag.
    async fn should_use_recovery(&self, ctx: &WorkerContext) -> bool {
        if !ctx.recovery.enable_recovery {
            return false;
        }

        match ctx.jobs.find_active_interval_job(self.job_id).await {
            Ok(job) => job.enable_recovery,
            Err(StoreError::NotFound) => false,
            Err(error) => {
                warn!(%error, "recovery eligibility check failed");
                ctx.recovery.default_recovery_enabled
            }
        }
    }

    /// The progress-tracked path. An interval left `running` by a crash
    /// is handed to the `task_recovery` handler instead of starting over.
    async fn execute_with_progress(
        &self,
        ctx: &WorkerContext,
        payload: &Payload,
    ) -> anyhow::Result<()> {
        if let Some(progress) = ctx.jobs.interval_progress(self.job_id).await? {
            if progress.status == IntervalStatus::Running {
                info!(
                    job.id = %self.job_id,
                    interval.id = %progress.interval_id,
                    "found incomplete interval, scheduling recovery"
                );

                let recovery = TaskRecoveryArgs {
                    job_id: self.job_id,
                    interval_id: progress.interval_id.clone(),
                    user_id: self.user_id,
                    workspace_id: self.workspace_id,
                    payload: self.payload.clone(),
                };
                recovery
                    .enqueue_with(&ctx.pool, Utc::now(), ctx.recovery.max_attempts)
                    .await?;

                self.schedule_next_firing(ctx).await;
                return Ok(());
            }
        }

        // One task per firing; the progress record still carries counts so
        // replay handles whatever it finds.
        let mut progress = ctx.jobs.start_new_interval(self.job_id, 1).await?;
        self.schedule_next_firing(ctx).await;

        let task_id = ctx.tasks.create(self.job_id, &self.payload).await?;
        let now = Utc::now();
        progress.task_results.insert(
            task_id.to_string(),
            TaskResultRecord {
                task_id: task_id.to_string(),
                status: TaskStatus::Created,
                started_at: now,
                ended_at: None,
                result: String::new(),
                error: String::new(),
            },
        );
        progress.last_updated_at = now;
        ctx.jobs
            .update_interval_progress(self.job_id, &progress)
            .await?;

        let outcome = execute_resource(ctx, task_id, payload).await;

        let ended_at = Utc::now();
        if let Some(record) = progress.task_results.get_mut(&task_id.to_string()) {
            record.ended_at = Some(ended_at);
            match &outcome {
                Ok(result) => {
                    record.status = TaskStatus::Completed;
                    record.result = render_result(result);
                    progress.completed_tasks += 1;
                }
                Err(error) => {
                    record.status = TaskStatus::Failed;
                    record.error = format!("{error:#}");
                    progress.failed_tasks += 1;
                }
            }
        }
        progress.last_updated_at = ended_at;
        ctx.jobs
            .update_interval_progress(self.job_id, &progress)
            .await?;

        match outcome {
            Ok(result) => {
                ctx.tasks
                    .finish(
                        self.job_id,
                        task_id,
                        TaskStatus::Completed,
                        &render_result(&result),
                    )
                    .await?;
            }
            Err(error) => {
                ctx.tasks
                    .finish(self.job_id, task_id, TaskStatus::Failed, &format!("{error:#}"))
                    .await?;
            }
        }

        // The outcome is captured either way; the firing itself succeeded.
        ctx.jobs
            .complete_interval(self.job_id, &progress.interval_id)
            .await?;
        info!(job.id = %self.job_id, interval.id = %progress.interval_id, "interval completed");
        Ok(())
    }

    /// Insert the follow-up firing for recurring jobs. Failures are
    /// logged, not raised: the current firing must not be lost because
    /// the next one could not be lined up.
    async fn schedule_next_firing(&self, ctx: &WorkerContext) {
        match ctx.jobs.find_active_interval_job(self.job_id).await {
            Ok(job) => {
                if let Err(error) = ctx.jobs.reschedule_interval_job(&job).await {
                    warn!(job.id = %self.job_id, %error, "failed to reschedule job");
                }
            }
            // One-shot jobs and jobs deactivated mid-flight simply stop here.
            Err(StoreError::NotFound) => {}
            Err(error) => warn!(job.id = %self.job_id, %error, "reschedule lookup failed"),
        }
    }
}
