//! The HTTP API server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use metronome::http::{self, AppState};
use metronome::store::JobStore;
use metronome::{Config, connect, setup_database};

/// How long in-flight requests may drain after a shutdown signal.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("api server failed: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("load configuration")?;
    let jwt_secret = config
        .jwt_secret
        .clone()
        .context("JWT_SECRET_KEY is not set")?;

    let pool = connect(&config).await.context("connect to database")?;
    setup_database(&pool).await.context("set up database")?;
    info!("connected to the database");

    let state = AppState {
        jobs: JobStore::new(pool, config.recovery.default_recovery_enabled),
        jwt_secret: Arc::new(jwt_secret),
        default_limit: 10,
    };
    let router = http::router(state, &config);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("bind port {}", config.port))?;
    info!(port = config.port, "API server started");

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
    });

    shutdown_signal().await;
    info!("shutting down server…");
    shutdown.cancel();

    match tokio::time::timeout(SHUTDOWN_DEADLINE, server).await {
        Ok(joined) => joined??,
        Err(_) => warn!("shutdown deadline reached; dropping in-flight connections"),
    }

    info!("server exited");
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
            // If the handler cannot be installed, never resolve; the other
            // branch still works.
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
