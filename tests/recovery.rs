#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::Utc;
use metronome::RecoveryController;
use metronome::config::RecoveryConfig;
use metronome::models::{CreateJobRequest, JobType, TaskResultRecord, TaskStatus};
use metronome::setup_database;
use metronome::store::{JobStore, TaskStore};
use serde_json::json;
use sqlx::PgPool;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }
}

fn payload(prompt: &str) -> serde_json::Value {
    json!({
        "prompt": prompt,
        "resource_name": "ai_agent",
        "resource_data": "{\"id\":\"a1\",\"name\":\"mailbot\",\"description\":\"\",\"url\":\"http://agent.local\"}",
    })
}

fn interval_request() -> CreateJobRequest {
    CreateJobRequest {
        name: "recurring".into(),
        workspace_id: Uuid::new_v4(),
        payload: payload("summarize the inbox"),
        job_type: JobType::Interval,
        schedule: None,
        interval: Some(json!({ "interval_type": "minutes", "value": "*/5 * * * *" })),
        enable_recovery: None,
    }
}

fn controller(pool: &PgPool, config: RecoveryConfig) -> RecoveryController {
    RecoveryController::new(
        pool.clone(),
        JobStore::new(pool.clone(), config.default_recovery_enabled),
        TaskStore::new(pool.clone()),
        config,
    )
}

async fn available_entries_of_kind(pool: &PgPool, kind: &str) -> anyhow::Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM queue_entries WHERE kind = $1 AND status = 'available'",
    )
    .bind(kind)
    .fetch_one(pool)
    .await?)
}

#[tokio::test]
async fn running_tasks_are_reset_and_re_enqueued_exactly_once() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone(), true);
    let tasks = TaskStore::new(pool.clone());
    let user_id = Uuid::new_v4();

    let job = store.create_job(interval_request(), user_id).await?;
    let task_id = tasks.create(job.id, &payload("x")).await?;
    tasks.mark_running(task_id).await?;

    // Simulate a crash mid-execution: the task row is `running` and the
    // job points at it.
    let current = sqlx::query_scalar::<_, Option<Uuid>>(
        "SELECT current_task_id FROM jobs WHERE id = $1",
    )
    .bind(job.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(current, Some(task_id));

    let recovery = controller(&pool, RecoveryConfig::default());
    let recovered = recovery.recover_running_tasks().await?;
    assert_eq!(recovered, 1);

    // The task is back to `created` with its result cleared.
    let (status, result) = sqlx::query_as::<_, (String, String)>(
        "SELECT status, result FROM tasks WHERE id = $1",
    )
    .bind(task_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(status, "created");
    assert_eq!(result, "");

    // The job no longer points at the task.
    let current = sqlx::query_scalar::<_, Option<Uuid>>(
        "SELECT current_task_id FROM jobs WHERE id = $1",
    )
    .bind(job.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(current, None);

    // A resume entry exists, carrying the original task id.
    let resume_task_id = sqlx::query_scalar::<_, String>(
        r"
        SELECT args ->> 'task_id' FROM queue_entries
        WHERE kind = 'interval_job' AND args ->> 'task_id' IS NOT NULL
        ",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(resume_task_id, task_id.to_string());

    // Running recovery again immediately is a no-op.
    let entries_before = available_entries_of_kind(&pool, "interval_job").await?;
    assert_eq!(recovery.recover_running_tasks().await?, 0);
    assert_eq!(
        available_entries_of_kind(&pool, "interval_job").await?,
        entries_before
    );

    Ok(())
}

#[tokio::test]
async fn incomplete_intervals_are_scheduled_for_replay_once() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone(), true);
    let user_id = Uuid::new_v4();

    let job = store.create_job(interval_request(), user_id).await?;

    // An interval left mid-flight: one sub-task never finished.
    let mut progress = store.start_new_interval(job.id, 1).await?;
    let task_id = Uuid::new_v4().to_string();
    progress.task_results.insert(
        task_id.clone(),
        TaskResultRecord {
            task_id,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            result: String::new(),
            error: String::new(),
        },
    );
    store.update_interval_progress(job.id, &progress).await?;

    let recovery = controller(&pool, RecoveryConfig::default());
    assert_eq!(recovery.recover_incomplete_intervals().await?, 1);
    assert_eq!(available_entries_of_kind(&pool, "task_recovery").await?, 1);

    // The sweep is idempotent: the identical entry is suppressed.
    assert_eq!(recovery.recover_incomplete_intervals().await?, 0);
    assert_eq!(available_entries_of_kind(&pool, "task_recovery").await?, 1);

    Ok(())
}

#[tokio::test]
async fn the_kill_switch_disables_interval_replay() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone(), true);

    let job = store.create_job(interval_request(), Uuid::new_v4()).await?;
    store.start_new_interval(job.id, 1).await?;

    let config = RecoveryConfig {
        enable_recovery: false,
        ..RecoveryConfig::default()
    };
    let recovery = controller(&pool, config);

    assert_eq!(recovery.recover_incomplete_intervals().await?, 0);
    assert_eq!(available_entries_of_kind(&pool, "task_recovery").await?, 0);

    Ok(())
}

#[tokio::test]
async fn missed_firings_are_rescheduled_at_boot() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::new(pool.clone(), true);

    let job = store.create_job(interval_request(), Uuid::new_v4()).await?;

    // Pretend the worker slept through the firing: push next_run_at into
    // the past and settle the stale entry.
    sqlx::query("UPDATE jobs SET next_run_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await?;
    sqlx::query("UPDATE queue_entries SET status = 'discarded', finalized_at = NOW()")
        .execute(&pool)
        .await?;

    let recovery = controller(&pool, RecoveryConfig::default());
    assert_eq!(recovery.recover_missed_firings().await?, 1);

    let next_run_at = sqlx::query_scalar::<_, Option<chrono::DateTime<Utc>>>(
        "SELECT next_run_at FROM jobs WHERE id = $1",
    )
    .bind(job.id)
    .fetch_one(&pool)
    .await?;
    assert!(next_run_at.unwrap() > Utc::now());
    assert_eq!(available_entries_of_kind(&pool, "interval_job").await?, 1);

    // Nothing is missed anymore; a second pass does nothing.
    assert_eq!(recovery.recover_missed_firings().await?, 0);

    Ok(())
}
