//! The queue worker: dispatches firings, runs recovery, prunes the queue.

use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use metronome::agent::AgentClient;
use metronome::handlers::{IntervalJobArgs, TaskRecoveryArgs, WorkerContext};
use metronome::queue::{CleanupConfiguration, EntryCleaner, Runner};
use metronome::store::{JobStore, TaskStore};
use metronome::{Config, DEFAULT_QUEUE, RecoveryController, connect, setup_database};

/// How long in-flight handlers may finish after a shutdown signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("worker failed: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("load configuration")?;
    let pool = connect(&config).await.context("connect to database")?;
    setup_database(&pool).await.context("set up database")?;
    info!("connected to the database");

    let jobs = JobStore::new(pool.clone(), config.recovery.default_recovery_enabled);
    let tasks = TaskStore::new(pool.clone());
    let context = WorkerContext {
        pool: pool.clone(),
        jobs: jobs.clone(),
        tasks: tasks.clone(),
        agent: AgentClient::new().context("build agent client")?,
        recovery: config.recovery,
    };

    let runner = Runner::new(pool.clone(), context).configure_queue(DEFAULT_QUEUE, |queue| {
        queue
            .num_workers(config.max_workers)
            .register::<IntervalJobArgs>()
            .register::<TaskRecoveryArgs>()
    });
    let handle = runner.start();
    info!(workers = config.max_workers, "worker started");

    // Recovery runs after the queue is up, so re-enqueued entries
    // dispatch immediately.
    let recovery = RecoveryController::new(pool.clone(), jobs, tasks, config.recovery);
    if let Err(error) = recovery.recover_running_tasks().await {
        warn!(%error, "task recovery failed");
    }
    if let Err(error) = recovery.recover_missed_firings().await {
        warn!(%error, "missed-firing recovery failed");
    }
    if let Err(error) = recovery.recover_incomplete_intervals().await {
        warn!(%error, "interval recovery failed");
    }

    let sweep_token = handle.shutdown_token();
    let sweep = tokio::spawn(async move { recovery.run_sweep(sweep_token).await });

    let mut cleaners = EntryCleaner::new()
        .configure::<IntervalJobArgs>(CleanupConfiguration::default())
        .configure::<TaskRecoveryArgs>(CleanupConfiguration::default())
        .run(&pool);

    shutdown_signal().await;
    info!("shutting down worker…");

    handle.stop(SHUTDOWN_DEADLINE).await;
    cleaners.shutdown().await;
    if let Err(error) = sweep.await {
        warn!(%error, "recovery sweep task panicked");
    }

    info!("worker exited");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
