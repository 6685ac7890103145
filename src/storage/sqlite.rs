//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::output::CrawlStats;
use crate::state::RequestState;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{RequestRecord, RunRecord, RunStatus};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

const RUN_COLUMNS: &str = "id, started_at, finished_at, config_hash, status, \
                           pages_visited, records_extracted, pages_failed";

impl SqliteStorage {
    /// Opens or creates the database at `path`
    pub fn new(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Each journal write is its own transaction; WAL keeps them cheap
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(RunStatus::Failed),
        pages_visited: row.get::<_, i64>(5)? as u64,
        records_extracted: row.get::<_, i64>(6)? as u64,
        pages_failed: row.get::<_, i64>(7)? as u64,
    })
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                run_from_row,
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                &format!("SELECT {} FROM runs ORDER BY id DESC LIMIT 1", RUN_COLUMNS),
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn update_run_status(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1 WHERE id = ?2",
            params![status.to_db_string(), run_id],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        stats: &CrawlStats,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, pages_visited = ?3,
             records_extracted = ?4, pages_failed = ?5 WHERE id = ?6",
            params![
                status.to_db_string(),
                now,
                stats.pages_visited as i64,
                stats.records_extracted as i64,
                stats.pages_failed as i64,
                run_id
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    // ===== Frontier Journal =====

    fn record_request(
        &mut self,
        url: &str,
        depth: u32,
        enqueued_at: &str,
        run_id: i64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO requests (url, depth, state, enqueued_at, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                url,
                depth,
                RequestState::Pending.to_db_string(),
                enqueued_at,
                run_id
            ],
        )?;
        Ok(())
    }

    fn update_request_state(
        &mut self,
        url: &str,
        state: RequestState,
        error_message: Option<&str>,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE requests SET state = ?1, updated_at = ?2, error_message = ?3 WHERE url = ?4",
            params![state.to_db_string(), now, error_message, url],
        )?;
        Ok(())
    }

    fn load_requests(&self) -> StorageResult<Vec<RequestRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT url, depth, state, enqueued_at, updated_at, error_message, run_id
             FROM requests ORDER BY seq ASC",
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(RequestRecord {
                    url: row.get(0)?,
                    depth: row.get(1)?,
                    state: RequestState::from_db_string(&row.get::<_, String>(2)?)
                        .unwrap_or(RequestState::Pending),
                    enqueued_at: row.get(3)?,
                    updated_at: row.get(4)?,
                    error_message: row.get(5)?,
                    run_id: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn clear_requests(&mut self) -> StorageResult<()> {
        self.conn.execute("DELETE FROM requests", [])?;
        Ok(())
    }

    // ===== Statistics =====

    fn count_requests_by_state(&self, state: RequestState) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM requests WHERE state = ?1",
            params![state.to_db_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_total_requests(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
