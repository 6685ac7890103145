//! Output module for crawl statistics and reports
//!
//! This module handles:
//! - The in-run `CrawlStats` counters and the terminal `CrawlReport`
//! - Printing the final report of a run
//! - Loading statistics of past runs from the crawl-state database

mod report;
pub mod stats;

pub use report::{print_report, CrawlReport};
pub use stats::{load_statistics, print_statistics, CrawlStats, StoredStatistics};
