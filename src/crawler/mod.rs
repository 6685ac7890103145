//! Crawler module for web page fetching and processing
//!
//! This module contains the core crawling logic, including:
//! - The deduplicating frontier shared by all workers
//! - Per-host politeness scheduling
//! - HTTP fetching with retry logic
//! - HTML parsing, record extraction and link discovery
//! - Overall crawl coordination

mod coordinator;
mod extractor;
mod fetcher;
mod frontier;
mod parser;
mod scheduler;

pub use coordinator::{AbortHandle, AbortReason, Coordinator, CoordinatorBuilder, RunState};
pub use extractor::{Extraction, ExtractionWarning, FollowPolicy, PageHandler, SelectorExtractor};
pub use fetcher::{
    build_http_client, decode_page, fetch_with_retry, FailureKind, FetchError, FetchResult,
    FetchStatus, FetchedDocument, FetchedPage, HttpTransport, RetryPolicy, Transport,
};
pub use frontier::{
    Dequeued, EnqueueOutcome, FetchRequest, Frontier, FrontierJournal, RejectReason,
};
pub use parser::{parse_document, select_links};
pub use scheduler::{HostLimiter, HostPermit};

pub use crate::output::CrawlReport;

use crate::config::Config;
use crate::QuarryError;

/// Runs a complete crawl operation
///
/// This is the main entry point for starting a crawl. It will:
/// 1. Validate the configuration
/// 2. Open the crawl-state database and resume or create a run
/// 3. Seed the frontier
/// 4. Fetch pages, extract records and follow links
/// 5. Return the final report
///
/// # Arguments
///
/// * `config` - The crawler configuration
/// * `fresh` - Whether to discard resumable state
///
/// # Returns
///
/// * `Ok(CrawlReport)` - The run reached a terminal state
/// * `Err(QuarryError)` - The crawl could not start
pub async fn crawl(config: Config, fresh: bool) -> Result<CrawlReport, QuarryError> {
    Coordinator::new(config, fresh)?.run().await
}
