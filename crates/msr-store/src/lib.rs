//! SQLite-backed implementations of the core collaborator ports.
//!
//! One database file holds bars, signals, streaks and processing
//! checkpoints. Every write is an upsert so backfill, replay and live
//! ingestion stay idempotent.

mod bars;
mod checkpoints;
mod pool;
mod signals;
mod streaks;

pub use bars::SqliteBarStore;
pub use checkpoints::SqliteCheckpointStore;
pub use pool::{open_memory_pool, open_pool, DbPool};
pub use signals::SqliteSignalStore;
pub use streaks::SqliteStreakStore;

use msr_core::error::CoreError;

/// Map any rusqlite/r2d2 failure into the core's store error kind.
pub(crate) fn store_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::Store(e.to_string())
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
pub(crate) fn test_pool() -> DbPool {
    pool::open_memory_pool().expect("memory pool")
}
