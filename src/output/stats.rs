//! Crawl statistics
//!
//! `CrawlStats` is the live counter set of a run; `StoredStatistics` is what
//! the crawl-state database knows about the latest run.

use crate::state::RequestState;
use crate::storage::{RunRecord, Storage, StorageResult};
use serde::Serialize;

/// Counters maintained by the run controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlStats {
    /// Pages fetched and handed to extraction
    pub pages_visited: u64,

    /// Records appended to the dataset
    pub records_extracted: u64,

    /// Requests that exhausted every fetch attempt
    pub pages_failed: u64,

    /// Requests dequeued from the frontier
    pub requests_issued: u64,

    /// Fetch attempts beyond the first
    pub retries: u64,

    /// Failed attempts caused by the network or a non-success status
    pub network_errors: u64,

    /// Failed attempts caused by an unparsable document
    pub parse_errors: u64,

    /// Extraction warnings of any kind
    pub extraction_warnings: u64,

    /// Entries skipped for missing a required field
    pub malformed_entries: u64,

    /// Pages on which the record selector matched nothing
    pub empty_pages: u64,
}

/// Statistics of the latest run as recorded in the crawl-state database
#[derive(Debug, Clone)]
pub struct StoredStatistics {
    pub run: Option<RunRecord>,
    pub total_requests: u64,
    pub pending: u64,
    pub in_flight: u64,
    pub done: u64,
    pub failed: u64,
}

/// Loads statistics from storage
pub fn load_statistics(storage: &dyn Storage) -> StorageResult<StoredStatistics> {
    Ok(StoredStatistics {
        run: storage.get_latest_run()?,
        total_requests: storage.count_total_requests()?,
        pending: storage.count_requests_by_state(RequestState::Pending)?,
        in_flight: storage.count_requests_by_state(RequestState::InFlight)?,
        done: storage.count_requests_by_state(RequestState::Done)?,
        failed: storage.count_requests_by_state(RequestState::Failed)?,
    })
}

/// Prints stored statistics to stdout
pub fn print_statistics(stats: &StoredStatistics) {
    println!("=== Crawl Statistics ===\n");

    match &stats.run {
        Some(run) => {
            println!("Latest run: #{}", run.id);
            println!("  Status: {}", run.status.to_db_string());
            println!("  Started: {}", run.started_at);
            if let Some(finished) = &run.finished_at {
                println!("  Finished: {}", finished);
            }
            println!("  Pages visited: {}", run.pages_visited);
            println!("  Records extracted: {}", run.records_extracted);
            println!("  Pages failed: {}", run.pages_failed);
            if run.status.is_resumable() {
                println!("  (resumable)");
            }
        }
        None => println!("No crawl runs recorded"),
    }
    println!();

    println!("Frontier ({} URLs seen):", stats.total_requests);
    println!("  Pending: {}", stats.pending);
    println!("  In flight: {}", stats.in_flight);
    println!("  Done: {}", stats.done);
    println!("  Failed: {}", stats.failed);
}
