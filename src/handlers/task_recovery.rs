//! The `task_recovery` handler: replay of an interrupted interval.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::{WorkerContext, dispatch_payload, execute_resource, render_result};
use crate::models::{IntervalStatus, Payload, TaskStatus};
use crate::queue::{QueueJob, UniquePolicy};

/// Queue args for replaying the unfinished portion of one interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecoveryArgs {
    /// The job whose interval is replayed.
    pub job_id: Uuid,
    /// The interval execution being replayed; guards idempotence.
    pub interval_id: String,
    /// The job's owner.
    pub user_id: Uuid,
    /// The owner's workspace.
    pub workspace_id: Uuid,
    /// Payload snapshot of the interrupted firing.
    pub payload: Value,
}

impl QueueJob for TaskRecoveryArgs {
    const KIND: &'static str = "task_recovery";

    // Any non-terminal duplicate suppresses re-insertion; running the
    // sweep twice cannot double-schedule a replay.
    const UNIQUE: UniquePolicy = UniquePolicy::ByArgs;

    type Context = WorkerContext;

    async fn run(&self, ctx: WorkerContext) -> anyhow::Result<()> {
        info!(
            job.id = %self.job_id,
            interval.id = %self.interval_id,
            "starting task recovery"
        );

        let Some(progress) = ctx.jobs.interval_progress(self.job_id).await? else {
            info!(job.id = %self.job_id, "no interval progress; nothing to recover");
            return Ok(());
        };
        if progress.interval_id != self.interval_id {
            info!(job.id = %self.job_id, "interval id mismatch; a newer interval took over");
            return Ok(());
        }
        if progress.status != IntervalStatus::Running {
            info!(interval.id = %self.interval_id, "interval is not running; nothing to recover");
            return Ok(());
        }

        let incomplete: Vec<String> = progress
            .task_results
            .values()
            .filter(|record| !record.status.is_terminal())
            .map(|record| record.task_id.clone())
            .collect();

        if incomplete.is_empty() {
            ctx.jobs
                .complete_interval(self.job_id, &self.interval_id)
                .await?;
            return Ok(());
        }

        info!(count = incomplete.len(), "found incomplete tasks for recovery");
        let payload = Payload::from_value(&self.payload)?;

        for task_id in incomplete {
            if let Err(error) = self.recover_task(&ctx, &payload, &task_id).await {
                // One poisonous sub-task must not block the rest.
                warn!(task.id = %task_id, %error, "failed to process recovery task");
            }
        }

        let updated = ctx.jobs.interval_progress(self.job_id).await?;
        if let Some(updated) = updated {
            if updated.interval_id == self.interval_id && updated.is_settled() {
                info!(interval.id = %self.interval_id, "all tasks accounted for");
                ctx.jobs
                    .complete_interval(self.job_id, &self.interval_id)
                    .await?;
            }
        }
        Ok(())
    }
}

impl TaskRecoveryArgs {
    async fn recover_task(
        &self,
        ctx: &WorkerContext,
        payload: &Payload,
        task_id: &str,
    ) -> anyhow::Result<()> {
        // Reload on every pass so concurrent bookkeeping is observed.
        let Some(mut progress) = ctx.jobs.interval_progress(self.job_id).await? else {
            return Ok(());
        };
        let Some(record) = progress.task_results.get_mut(task_id) else {
            anyhow::bail!("task {task_id} not found in interval progress");
        };
        if record.status.is_terminal() {
            return Ok(());
        }

        record.status = TaskStatus::Running;
        record.started_at = Utc::now();
        progress.last_updated_at = record.started_at;
        ctx.jobs
            .update_interval_progress(self.job_id, &progress)
            .await?;

        // Progress entries normally reference a `tasks` row; entries
        // without one still execute under the same agent-call contract.
        let mut row_id = None;
        if let Ok(id) = Uuid::parse_str(task_id) {
            if ctx.tasks.is_recoverable(id).await? {
                row_id = Some(id);
            }
        }
        let outcome = match row_id {
            Some(row_id) => execute_resource(ctx, row_id, payload).await,
            None => dispatch_payload(ctx, payload).await,
        };

        let ended_at = Utc::now();
        let Some(mut progress) = ctx.jobs.interval_progress(self.job_id).await? else {
            return Ok(());
        };
        if let Some(record) = progress.task_results.get_mut(task_id) {
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
            progress.last_updated_at = ended_at;
            ctx.jobs
                .update_interval_progress(self.job_id, &progress)
                .await?;
        }

        if let Some(row_id) = row_id {
            let (status, text) = match &outcome {
                Ok(result) => (TaskStatus::Completed, render_result(result)),
                Err(error) => (TaskStatus::Failed, format!("{error:#}")),
            };
            if let Err(error) = ctx.tasks.finish(self.job_id, row_id, status, &text).await {
                warn!(task.id = %row_id, %error, "failed to update recovered task row");
            }
        }

        outcome.map(|_| ())
    }
}
