//! Database-backed work queue.
//!
//! Entries are durable rows; workers claim them with `FOR UPDATE SKIP
//! LOCKED` and hold the row lock while the handler runs, so a crashed
//! worker releases its entry for the next poll. Terminal entries are
//! retained for audit and pruned by the [`EntryCleaner`].

mod cleaner;
mod entry;
mod registry;
mod runner;
/// Queue entry row definitions.
pub mod schema;
pub(crate) mod storage;
mod worker;

pub use self::cleaner::{CleanupConfiguration, CleanupPolicy, EntryCleaner};
pub use self::entry::{CancelJob, DEFAULT_QUEUE, EnqueueError, QueueJob, UniquePolicy};
pub use self::runner::{Queue, RunHandle, Runner};

pub(crate) use self::registry::JobRegistry;
