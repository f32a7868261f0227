#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::Utc;
use claims::{assert_none, assert_some};
use insta::assert_compact_json_snapshot;
use metronome::queue::{CancelJob, QueueJob, Runner, UniquePolicy};
use metronome::setup_database;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
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

    /// Create a test runner with common configuration
    pub(super) fn create_test_runner<Context: Clone + Send + Sync + 'static>(
        pool: PgPool,
        context: Context,
    ) -> Runner<Context> {
        Runner::new(pool, context).shutdown_when_queue_empty()
    }
}

async fn all_entries(pool: &PgPool) -> anyhow::Result<Value> {
    let rows = sqlx::query_as::<_, (String, Value)>(
        "SELECT kind, args FROM queue_entries ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(serde_json::to_value(rows)?)
}

async fn entry_status(pool: &PgPool, id: i64) -> anyhow::Result<(String, i32, Option<String>)> {
    Ok(sqlx::query_as::<_, (String, i32, Option<String>)>(
        "SELECT status, attempts, cancel_reason FROM queue_entries WHERE id = $1",
    )
    .bind(id)
    .fetch_one(pool)
    .await?)
}

async fn entry_is_locked(pool: &PgPool, id: i64) -> anyhow::Result<bool> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM queue_entries WHERE id = $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.rollback().await?;
    Ok(row.is_none())
}

#[tokio::test]
async fn entries_are_locked_when_fetched_and_retained_when_completed() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob {
        value: String,
    }

    impl QueueJob for TestJob {
        const KIND: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.job_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok(())
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let runner = test_utils::create_test_runner(pool.clone(), test_context.clone())
        .configure_queue("default", |queue| queue.num_workers(2).register::<TestJob>());

    let entry_id = assert_some!(
        TestJob {
            value: "foo".into()
        }
        .enqueue_at(&pool, Utc::now())
        .await?
    );

    assert!(!entry_is_locked(&pool, entry_id).await?);

    let runner = runner.start();
    test_context.job_started_barrier.wait().await;

    assert!(entry_is_locked(&pool, entry_id).await?);

    test_context.assertions_finished_barrier.wait().await;
    runner.wait_for_shutdown().await;

    // Terminal entries are retained for audit, not deleted.
    let (status, attempts, _) = entry_status(&pool, entry_id).await?;
    assert_eq!(status, "completed");
    assert_eq!(attempts, 0);

    Ok(())
}

#[tokio::test]
async fn enqueue_is_deduplicated_by_args() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob {
        value: String,
    }

    impl TestJob {
        fn new(value: &str) -> Self {
            Self {
                value: value.into(),
            }
        }
    }

    impl QueueJob for TestJob {
        const KIND: &'static str = "test";
        const UNIQUE: UniquePolicy = UniquePolicy::ByArgs;
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    assert_some!(TestJob::new("foo").enqueue_at(&pool, Utc::now()).await?);
    assert_compact_json_snapshot!(all_entries(&pool).await?, @r#"[["test", {"value": "foo"}]]"#);

    // Enqueue the same args again, which should be deduplicated
    assert_none!(TestJob::new("foo").enqueue_at(&pool, Utc::now()).await?);
    assert_compact_json_snapshot!(all_entries(&pool).await?, @r#"[["test", {"value": "foo"}]]"#);

    // Different args should NOT be deduplicated
    assert_some!(TestJob::new("bar").enqueue_at(&pool, Utc::now()).await?);
    assert_compact_json_snapshot!(all_entries(&pool).await?, @r#"[["test", {"value": "foo"}], ["test", {"value": "bar"}]]"#);

    Ok(())
}

#[tokio::test]
async fn dedup_window_expires() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct WindowedJob {
        value: String,
    }

    impl QueueJob for WindowedJob {
        const KIND: &'static str = "windowed";
        const UNIQUE: UniquePolicy = UniquePolicy::ByArgsWithin(Duration::from_millis(100));
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let job = WindowedJob {
        value: "foo".into(),
    };
    assert_some!(job.enqueue_at(&pool, Utc::now()).await?);
    assert_none!(job.enqueue_at(&pool, Utc::now()).await?);

    tokio::time::sleep(Duration::from_millis(200)).await;

    // The window has passed; the duplicate is allowed again.
    assert_some!(job.enqueue_at(&pool, Utc::now()).await?);

    Ok(())
}

#[tokio::test]
async fn future_entries_are_not_dispatched() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct FutureJob;

    impl QueueJob for FutureJob {
        const KIND: &'static str = "future";
        type Context = Arc<AtomicU8>;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;
    let counter = Arc::new(AtomicU8::new(0));

    let entry_id = assert_some!(
        FutureJob
            .enqueue_at(&pool, Utc::now() + chrono::Duration::hours(1))
            .await?
    );

    let runner = test_utils::create_test_runner(pool.clone(), counter.clone())
        .configure_queue("default", |queue| queue.num_workers(1).register::<FutureJob>());
    runner.start().wait_for_shutdown().await;

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    let (status, _, _) = entry_status(&pool, entry_id).await?;
    assert_eq!(status, "available");

    Ok(())
}

#[tokio::test]
async fn failing_entries_are_discarded_once_attempts_run_out() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct FailingJob;

    impl QueueJob for FailingJob {
        const KIND: &'static str = "failing";
        const MAX_ATTEMPTS: i32 = 1;
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            anyhow::bail!("agent unreachable")
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let entry_id = assert_some!(FailingJob.enqueue_at(&pool, Utc::now()).await?);

    let runner = test_utils::create_test_runner(pool.clone(), ())
        .configure_queue("default", |queue| queue.num_workers(1).register::<FailingJob>());
    runner.start().wait_for_shutdown().await;

    let (status, attempts, _) = entry_status(&pool, entry_id).await?;
    assert_eq!(status, "discarded");
    assert_eq!(attempts, 1);

    let last_error = sqlx::query_scalar::<_, Option<String>>(
        "SELECT last_error FROM queue_entries WHERE id = $1",
    )
    .bind(entry_id)
    .fetch_one(&pool)
    .await?;
    assert!(last_error.unwrap().contains("agent unreachable"));

    Ok(())
}

#[tokio::test]
async fn failing_entries_with_budget_left_are_rescheduled() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct RetriedJob;

    impl QueueJob for RetriedJob {
        const KIND: &'static str = "retried";
        const MAX_ATTEMPTS: i32 = 3;
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            anyhow::bail!("transient failure")
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let entry_id = assert_some!(RetriedJob.enqueue_at(&pool, Utc::now()).await?);

    // The retry backoff pushes the entry into the future, so the worker
    // finds nothing ready and shuts down after the first attempt.
    let runner = test_utils::create_test_runner(pool.clone(), ())
        .configure_queue("default", |queue| queue.num_workers(1).register::<RetriedJob>());
    runner.start().wait_for_shutdown().await;

    let (status, attempts, _) = entry_status(&pool, entry_id).await?;
    assert_eq!(status, "available");
    assert_eq!(attempts, 1);

    let scheduled_at = sqlx::query_scalar::<_, chrono::DateTime<Utc>>(
        "SELECT scheduled_at FROM queue_entries WHERE id = $1",
    )
    .bind(entry_id)
    .fetch_one(&pool)
    .await?;
    assert!(scheduled_at > Utc::now());

    Ok(())
}

#[tokio::test]
async fn cancelled_entries_record_the_reason_and_are_final() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct DecliningJob;

    impl QueueJob for DecliningJob {
        const KIND: &'static str = "declining";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            Err(CancelJob::new("job is no longer active").into())
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let entry_id = assert_some!(DecliningJob.enqueue_at(&pool, Utc::now()).await?);

    let runner = test_utils::create_test_runner(pool.clone(), ())
        .configure_queue("default", |queue| queue.num_workers(1).register::<DecliningJob>());
    runner.start().wait_for_shutdown().await;

    let (status, attempts, reason) = entry_status(&pool, entry_id).await?;
    assert_eq!(status, "cancelled");
    assert_eq!(attempts, 0);
    assert_eq!(reason.as_deref(), Some("job is no longer active"));

    Ok(())
}
