use crate::crawler::{AbortReason, RunState};
use crate::output::CrawlStats;
use std::time::Duration;

/// Final report of a run, produced in every terminal state
#[derive(Debug, Clone)]
pub struct CrawlReport {
    /// Journal run ID, when the run is backed by a crawl-state database
    pub run_id: Option<i64>,

    /// Terminal state of the run
    pub state: RunState,

    /// Counters at the moment the run ended
    pub stats: CrawlStats,

    /// Wall-clock duration of the running phase
    pub elapsed: Duration,
}

impl CrawlReport {
    /// One-line description of how the run ended
    pub fn headline(&self) -> String {
        match &self.state {
            RunState::Completed => "completed cleanly".to_string(),
            RunState::LimitReached => "hit configured request limit".to_string(),
            RunState::Aborted(AbortReason::Cancelled) => "aborted by request".to_string(),
            RunState::Aborted(AbortReason::StorageFailure(error)) => {
                format!("aborted due to error: {}", error)
            }
            other => format!("ended in unexpected state {:?}", other),
        }
    }

    /// Returns true when the run stopped because of a fatal error
    pub fn is_failure(&self) -> bool {
        matches!(self.state, RunState::Aborted(AbortReason::StorageFailure(_)))
    }
}

/// Prints the final report of a run to stdout
pub fn print_report(report: &CrawlReport) {
    let stats = &report.stats;

    println!("=== Crawl Report ===\n");
    if let Some(run_id) = report.run_id {
        println!("Run #{}: {}", run_id, report.headline());
    } else {
        println!("Run {}", report.headline());
    }
    println!("Elapsed: {:.1}s\n", report.elapsed.as_secs_f64());

    println!("Pages visited: {}", stats.pages_visited);
    println!("Records extracted: {}", stats.records_extracted);
    println!("Pages failed: {}", stats.pages_failed);
    println!();

    println!("Requests issued: {} ({} retries)", stats.requests_issued, stats.retries);
    println!("Failures by kind:");
    println!("  Network errors: {}", stats.network_errors);
    println!("  Parse errors: {}", stats.parse_errors);
    println!(
        "  Extraction warnings: {} ({} malformed entries, {} empty pages)",
        stats.extraction_warnings, stats.malformed_entries, stats.empty_pages
    );
}
