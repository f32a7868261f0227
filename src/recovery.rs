//! Reconciliation of work left non-terminal by a restart.
//!
//! Two paths coexist. Task-level recovery runs once at worker boot: tasks
//! left `running` are reset to `created` and re-enqueued with their
//! original task id. Interval-level recovery replays unfinished interval
//! executions; it runs at boot and on a periodic sweep, and the
//! `interval_job` handler defers to it when it finds a running interval.
//!
//! Every operation here is safe to run repeatedly: the queue's uniqueness
//! policies suppress duplicate entries, the task state machine refuses to
//! re-terminate, and interval completion is a set-once transition.

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::RecoveryConfig;
use crate::handlers::{IntervalJobArgs, TaskRecoveryArgs};
use crate::models::JobType;
use crate::queue::QueueJob;
use crate::store::{JobStore, TaskStore};

/// Detects and re-enqueues incomplete work. One instance lives in the
/// worker binary.
pub struct RecoveryController {
    pool: PgPool,
    jobs: JobStore,
    tasks: TaskStore,
    config: RecoveryConfig,
}

impl RecoveryController {
    /// Build a controller over the shared pool and stores.
    pub fn new(pool: PgPool, jobs: JobStore, tasks: TaskStore, config: RecoveryConfig) -> Self {
        Self {
            pool,
            jobs,
            tasks,
            config,
        }
    }

    /// Task-level boot recovery: reset every `running` task to `created`,
    /// clear the owning jobs' `current_task_id`, and enqueue a resume
    /// entry per task. Returns how many entries were enqueued.
    #[instrument(name = "recovery.running_tasks", skip(self))]
    pub async fn recover_running_tasks(&self) -> anyhow::Result<usize> {
        let orphans = self.tasks.reset_running_tasks().await?;
        if orphans.is_empty() {
            info!("no running tasks found to recover");
            return Ok(0);
        }

        info!(count = orphans.len(), "found running tasks to recover");

        let mut recovered = 0;
        for orphan in orphans {
            let args = IntervalJobArgs {
                job_id: orphan.job_id,
                user_id: orphan.user_id,
                workspace_id: orphan.workspace_id,
                payload: orphan.payload,
                task_id: Some(orphan.task_id),
            };
            match args.enqueue_at(&self.pool, Utc::now()).await {
                Ok(Some(_)) => recovered += 1,
                // An identical resume entry already exists.
                Ok(None) => {}
                Err(error) => {
                    warn!(task.id = %orphan.task_id, %error, "failed to enqueue task recovery");
                }
            }
        }

        info!(recovered, "task recovery queued");
        Ok(recovered)
    }

    /// Boot recovery for firings missed while the worker was down: any
    /// active interval job whose `next_run_at` already passed gets
    /// rescheduled from the current time.
    #[instrument(name = "recovery.missed_firings", skip(self))]
    pub async fn recover_missed_firings(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut recovered = 0;

        for job in self.jobs.list_active_jobs().await? {
            if job.job_type != JobType::Interval {
                continue;
            }
            let Some(next_run_at) = job.next_run_at else {
                continue;
            };
            if next_run_at >= now {
                continue;
            }

            info!(job.id = %job.id, missed = %next_run_at, "recovering missed firing");
            match self.jobs.reschedule_interval_job(&job).await {
                Ok(_) => recovered += 1,
                Err(error) => warn!(job.id = %job.id, %error, "failed to recover job"),
            }
        }

        info!(recovered, "missed-firing recovery completed");
        Ok(recovered)
    }

    /// Interval-level recovery: schedule a replay for every interval left
    /// `running`. Honors the global kill-switch and each job's own flag.
    #[instrument(name = "recovery.incomplete_intervals", skip(self))]
    pub async fn recover_incomplete_intervals(&self) -> anyhow::Result<usize> {
        if !self.config.enable_recovery {
            return Ok(0);
        }

        let incomplete = self.jobs.incomplete_interval_jobs().await?;
        info!(count = incomplete.len(), "jobs with incomplete intervals");

        let mut scheduled = 0;
        for (job, progress) in incomplete {
            if !job.enable_recovery {
                continue;
            }

            let args = TaskRecoveryArgs {
                job_id: job.id,
                interval_id: progress.interval_id.clone(),
                user_id: job.user_id,
                workspace_id: job.workspace_id,
                payload: job.payload.clone(),
            };
            match args
                .enqueue_with(&self.pool, Utc::now(), self.config.max_attempts)
                .await
            {
                Ok(Some(entry_id)) => {
                    info!(
                        job.id = %job.id,
                        interval.id = %progress.interval_id,
                        entry.id = entry_id,
                        "scheduled interval recovery"
                    );
                    scheduled += 1;
                }
                Ok(None) => {}
                Err(error) => {
                    // One poisonous job must not stall the sweep.
                    warn!(job.id = %job.id, %error, "failed to schedule recovery");
                }
            }
        }
        Ok(scheduled)
    }

    /// Periodic sweep loop; exits when `shutdown` fires.
    pub async fn run_sweep(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        // The boot-time pass already ran; skip the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.recover_incomplete_intervals().await {
                        warn!(%error, "recovery sweep failed");
                    }
                }
            }
        }
    }
}
