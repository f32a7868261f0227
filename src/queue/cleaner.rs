use std::{collections::HashMap, marker::PhantomData, time::Duration};
use tracing::error;

use chrono::Utc;
use sqlx::PgPool;
use tokio::task::JoinSet;

use super::entry::QueueJob;

#[derive(Clone, Copy, Debug)]
#[allow(missing_docs)]
pub struct Configured;

#[derive(Clone, Copy, Debug)]
#[allow(missing_docs)]
pub struct Unconfigured;

type EntryKind = String;

/// The `EntryCleaner` spawns a task in charge of pruning terminal queue
/// entries of given kinds, keeping the audit trail bounded.
/// Uses typestate to ensure you cannot start a cleaner that will do nothing.
#[derive(Debug)]
pub struct EntryCleaner<State = Unconfigured> {
    configurations: HashMap<EntryKind, CleanupConfiguration>,
    _state: PhantomData<State>,
}

/// How to clean up terminal entries
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CleanupPolicy {
    /// Keep all entries finalized later than `now - Duration`
    MaxAge(chrono::Duration),
    /// Keep at most n entries
    MaxCount(usize),
    /// Discard entries older than the `max_age` _and_ keep at most `max_count`
    Mixed {
        /// Maximum age of an entry to keep
        max_age: chrono::Duration,
        /// Maximum number of entries to keep
        max_count: usize,
    },
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::MaxAge(chrono::Duration::days(7))
    }
}

/// Configuration for cleaning up terminal entries
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CleanupConfiguration {
    /// Interval at which to run
    pub cleanup_every: Duration,
    /// How to go about cleaning the terminal entries
    pub policy: CleanupPolicy,
}

impl Default for CleanupConfiguration {
    fn default() -> Self {
        Self {
            cleanup_every: Duration::from_secs(3600),
            policy: Default::default(),
        }
    }
}

impl EntryCleaner {
    /// Create a new, unconfigured, `EntryCleaner`
    pub fn new() -> EntryCleaner<Unconfigured> {
        Self {
            configurations: HashMap::new(),
            _state: PhantomData,
        }
    }

    async fn spawn_cleaner(kind: EntryKind, config: CleanupConfiguration, pool: PgPool) {
        let mut ticker = tokio::time::interval(config.cleanup_every);

        loop {
            ticker.tick().await;

            let result = match config.policy {
                CleanupPolicy::MaxAge(max_age) => sqlx::query(
                    r"DELETE FROM queue_entries
                      WHERE kind = $1 AND status <> 'available' AND finalized_at < $2",
                )
                .bind(&kind)
                .bind(Utc::now() - max_age)
                .execute(&pool)
                .await,
                CleanupPolicy::MaxCount(count) => {
                    sqlx::query(&format!(
                        r"DELETE FROM queue_entries
                          WHERE kind = $1 AND status <> 'available'
                          AND finalized_at < (SELECT finalized_at FROM queue_entries
                                              WHERE kind = $1 AND status <> 'available'
                                              ORDER BY finalized_at DESC OFFSET {offset} LIMIT 1)",
                        offset = count.saturating_sub(1)
                    ))
                    .bind(&kind)
                    .execute(&pool)
                    .await
                }
                CleanupPolicy::Mixed { max_age, max_count } => {
                    sqlx::query(&format!(
                        r"DELETE FROM queue_entries
                          WHERE kind = $1 AND status <> 'available' AND
                          (finalized_at < $2 OR
                           finalized_at < (SELECT finalized_at FROM queue_entries
                                           WHERE kind = $1 AND status <> 'available'
                                           ORDER BY finalized_at DESC OFFSET {offset} LIMIT 1))",
                        offset = max_count.saturating_sub(1)
                    ))
                    .bind(&kind)
                    .bind(Utc::now() - max_age)
                    .execute(&pool)
                    .await
                }
            };

            if let Err(e) = result {
                error!("Failed to clean terminal queue entries for {}: {}", kind, e);
                break;
            }
        }
    }
}

impl<State> EntryCleaner<State> {
    /// Configure the cleaner for a specific entry kind
    pub fn configure<J: QueueJob>(
        mut self,
        configuration: CleanupConfiguration,
    ) -> EntryCleaner<Configured> {
        self.configurations.insert(J::KIND.to_owned(), configuration);

        EntryCleaner {
            configurations: self.configurations,
            _state: PhantomData,
        }
    }
}

impl EntryCleaner<Configured> {
    /// Start the cleaner, spawning a task for each configured entry kind.
    /// Returns a `JoinSet` containing all spawned tasks for easy cancellation
    pub fn run(self, pool: &PgPool) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for (kind, config) in self.configurations {
            set.spawn(EntryCleaner::spawn_cleaner(kind, config, pool.clone()));
        }
        set
    }
}
