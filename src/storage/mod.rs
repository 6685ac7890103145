//! Storage module for persisting crawl state
//!
//! This module handles the SQLite journal that makes crawls resumable:
//! - Database initialization and schema management
//! - Run tracking (status, config hash, final counters)
//! - Frontier entries and their request states

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::state::RequestState;
use std::path::Path;

/// Opens (or creates) a crawl-state database
pub fn open_storage(path: &Path) -> StorageResult<SqliteStorage> {
    SqliteStorage::new(path)
}

/// A frontier entry as persisted in the journal
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub url: String,
    pub depth: u32,
    pub state: RequestState,
    pub enqueued_at: String,
    pub updated_at: Option<String>,
    pub error_message: Option<String>,
    pub run_id: i64,
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
    pub pages_visited: u64,
    pub records_extracted: u64,
    pub pages_failed: u64,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    LimitReached,
    Interrupted,
    Failed,
}

impl RunStatus {
    /// Returns true if a later invocation should pick this run back up
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Running | Self::LimitReached | Self::Interrupted)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::LimitReached => "limit_reached",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "limit_reached" => Some(Self::LimitReached),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
