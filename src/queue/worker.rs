use anyhow::anyhow;
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace, warn};

use super::entry::CancelJob;
use super::registry::JobRegistry;
use super::storage;

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: PgPool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) queue_name: String,
    pub(crate) shutdown: CancellationToken,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Dispatch entries until shut down, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                debug!("Shutdown requested. Stopping the worker…");
                break;
            }

            match self.run_next_entry().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No ready queue entries found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No ready queue entries found. Polling again in {sleep_duration:?}…");
                    if self.idle(sleep_duration).await {
                        break;
                    }
                }
                Err(error) => {
                    error!("Failed to run queue entry: {error}");
                    if self.idle(self.sleep_duration_with_jitter()).await {
                        break;
                    }
                }
            }
        }
    }

    /// Sleep, waking early on shutdown. Returns `true` when shut down.
    async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = sleep(duration) => false,
        }
    }

    /// Run the next ready entry on this queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(entry_id))` if an entry was run
    /// - `Ok(None)` if no entries were ready
    /// - `Err(...)` if there was an error retrieving the entry
    #[allow(clippy::cognitive_complexity)]
    async fn run_next_entry(&self) -> anyhow::Result<Option<i64>> {
        let context = self.context.clone();
        let job_registry = self.job_registry.clone();
        let pool = &self.connection_pool;

        let kinds = job_registry.kinds();

        trace!("Looking for the next ready queue entry…");

        // Start a transaction to hold the row lock during execution.
        let mut tx = pool.begin().await?;

        let entry = match storage::find_next_unlocked_entry_tx(&mut tx, &self.queue_name, &kinds)
            .await
        {
            Ok(entry) => entry,
            Err(sqlx::Error::RowNotFound) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        };

        let span = info_span!("job", entry.id = %entry.id, entry.kind = %entry.kind);

        let entry_id = entry.id;
        debug!("Running queue entry…");

        let run_task_fn = job_registry
            .get(&entry.kind)
            .ok_or_else(|| anyhow!("Unknown queue entry kind {}", entry.kind))?;

        let result = AssertUnwindSafe(run_task_fn(context, entry.args.clone()))
            .catch_unwind()
            .instrument(span)
            .await
            .map_err(|e| extract_panic_info(&*e))
            // TODO: Replace with flatten() once that stabilizes
            .and_then(std::convert::identity);

        match result {
            Ok(()) => {
                debug!(entry.id = entry_id, "Entry completed");
                storage::mark_completed(&mut tx, entry_id).await?;
            }
            Err(error) if error.downcast_ref::<CancelJob>().is_some() => {
                let reason = error.to_string();
                debug!(entry.id = entry_id, "Entry cancelled: {reason}");
                storage::mark_cancelled(&mut tx, entry_id, &reason).await?;
            }
            Err(error) => {
                warn!(entry.id = entry_id, "Failed to run queue entry: {error}");
                let attempts = entry.attempts + 1;
                if attempts >= entry.max_attempts {
                    storage::mark_discarded(&mut tx, entry_id, attempts, &format!("{error:#}"))
                        .await?;
                } else {
                    let next_at = Utc::now() + retry_backoff(attempts);
                    storage::reschedule_retry(
                        &mut tx,
                        entry_id,
                        attempts,
                        &format!("{error:#}"),
                        next_at,
                    )
                    .await?;
                }
            }
        }
        tx.commit().await?;

        Ok(Some(entry_id))
    }
}

/// Exponential backoff between attempts: one minute doubled per failure.
fn retry_backoff(attempts: i32) -> chrono::Duration {
    let exponent = attempts.clamp(0, 10) as u32;
    chrono::Duration::minutes(i64::from(2u32.pow(exponent)) / 2)
}

fn extract_panic_info(payload: &(dyn std::any::Any + Send)) -> anyhow::Error {
    if let Some(message) = payload.downcast_ref::<&str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(retry_backoff(1), chrono::Duration::minutes(1));
        assert_eq!(retry_backoff(2), chrono::Duration::minutes(2));
        assert_eq!(retry_backoff(3), chrono::Duration::minutes(4));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(retry_backoff(50), retry_backoff(10));
    }
}
