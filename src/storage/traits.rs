//! Storage traits and error types
//!
//! This module defines the trait interface for the crawl-state backend and
//! the error type shared by every durable write in the crate.

use crate::output::CrawlStats;
use crate::state::RequestState;
use crate::storage::{RequestRecord, RunRecord, RunStatus};
use thiserror::Error;

/// Errors that can occur during storage operations
///
/// Any of these halts a run: records are never produced without a place to
/// persist them.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Dataset error: {0}")]
    Dataset(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for crawl-state backends
pub trait Storage: Send {
    // ===== Run Management =====

    /// Creates a new crawl run and returns its ID
    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Updates the status of a run
    fn update_run_status(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    /// Records the terminal status, finish time and counters of a run
    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        stats: &CrawlStats,
    ) -> StorageResult<()>;

    // ===== Frontier Journal =====

    /// Records a newly enqueued request; existing URLs are left untouched
    fn record_request(
        &mut self,
        url: &str,
        depth: u32,
        enqueued_at: &str,
        run_id: i64,
    ) -> StorageResult<()>;

    /// Updates the state of a journaled request
    fn update_request_state(
        &mut self,
        url: &str,
        state: RequestState,
        error_message: Option<&str>,
    ) -> StorageResult<()>;

    /// Loads every journaled request in enqueue order
    fn load_requests(&self) -> StorageResult<Vec<RequestRecord>>;

    /// Removes every journaled request
    fn clear_requests(&mut self) -> StorageResult<()>;

    // ===== Statistics =====

    /// Counts requests in a given state
    fn count_requests_by_state(&self, state: RequestState) -> StorageResult<u64>;

    /// Counts every journaled request
    fn count_total_requests(&self) -> StorageResult<u64>;
}
