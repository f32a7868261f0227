//! Connection pool construction and schema setup.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::Config;

/// Everything the scheduler persists: jobs, their tasks, and the queue's
/// own entries. `setup_database` executes this idempotently.
const SETUP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    user_id UUID NOT NULL,
    workspace_id UUID NOT NULL,
    payload JSONB NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    type TEXT NOT NULL,
    schedule JSONB,
    interval JSONB,
    is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
    enable_recovery BOOLEAN NOT NULL DEFAULT TRUE,
    next_run_at TIMESTAMPTZ,
    last_run_at TIMESTAMPTZ,
    current_task_id UUID,
    interval_progress JSONB,
    current_interval_id TEXT,
    interval_started_at TIMESTAMPTZ,
    queue_entry_id BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    version BIGINT NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_jobs_owner
    ON jobs (user_id, workspace_id)
    WHERE is_deleted = FALSE;

CREATE INDEX IF NOT EXISTS idx_jobs_current_task_id
    ON jobs (current_task_id)
    WHERE current_task_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS tasks (
    id UUID PRIMARY KEY,
    job_id UUID NOT NULL,
    status TEXT NOT NULL DEFAULT 'created',
    payload JSONB NOT NULL,
    result TEXT NOT NULL DEFAULT '',
    is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    version BIGINT NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_tasks_job_id ON tasks (job_id);
CREATE INDEX IF NOT EXISTS idx_tasks_running
    ON tasks (status)
    WHERE status = 'running' AND is_deleted = FALSE;

CREATE TABLE IF NOT EXISTS queue_entries (
    id BIGSERIAL PRIMARY KEY,
    queue TEXT NOT NULL DEFAULT 'default',
    kind TEXT NOT NULL,
    args JSONB NOT NULL,
    status TEXT NOT NULL DEFAULT 'available',
    scheduled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    cancel_reason TEXT,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    finalized_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_queue_entries_ready
    ON queue_entries (queue, scheduled_at, id)
    WHERE status = 'available';

CREATE INDEX IF NOT EXISTS idx_queue_entries_args_job_id
    ON queue_entries ((args ->> 'job_id'))
    WHERE status = 'available';
"#;

/// Open the shared connection pool, honoring the configured bounds.
pub async fn connect(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .min_connections(config.min_db_connections)
        .connect(&config.database_url)
        .await
}

/// Create the tables and indexes if they do not exist yet.
///
/// Safe to call from every binary at startup.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SETUP_SQL).execute(pool).await?;
    Ok(())
}
