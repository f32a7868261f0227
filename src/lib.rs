#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod db;
pub mod handlers;
pub mod http;
pub mod models;
pub mod queue;
pub mod recovery;
pub mod schedule;
pub mod store;

/// Runtime configuration, built once from the environment.
pub use self::config::Config;
/// Pool construction and idempotent schema setup.
pub use self::db::{connect, setup_database};
/// The durable work queue: job trait, runner, and entry cleaner.
pub use self::queue::{DEFAULT_QUEUE, EntryCleaner, QueueJob, Runner};
/// Boot-time and periodic reconciliation of interrupted work.
pub use self::recovery::RecoveryController;
/// Durable job and task records.
pub use self::store::{JobStore, StoreError, TaskStore};
