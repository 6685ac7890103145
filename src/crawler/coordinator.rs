//! Crawler coordinator - main crawl orchestration logic
//!
//! This module contains the run controller that coordinates all aspects of
//! the crawling process, including:
//! - Initializing storage and resuming interrupted runs
//! - Seeding the frontier
//! - Running the worker pool (fetch, extract, append, enqueue follow-ups)
//! - Handling aborts and storage failures
//! - Producing the final report
//!
//! Workers never touch the statistics: each finished request is reported to
//! the controller over a channel, and only the controller updates counters.

use super::extractor::{ExtractionWarning, FollowPolicy, PageHandler, SelectorExtractor};
use super::fetcher::{
    fetch_with_retry, FailureKind, FetchError, FetchResult, FetchStatus, HttpTransport,
    RetryPolicy, Transport,
};
use super::frontier::{Dequeued, EnqueueOutcome, FetchRequest, Frontier, FrontierJournal};
use super::parser::parse_document;
use super::scheduler::HostLimiter;
use crate::config::{validate, Config};
use crate::dataset::{DatasetBackend, DatasetSink, JsonLinesBackend};
use crate::output::{CrawlReport, CrawlStats};
use crate::state::RequestState;
use crate::storage::{
    open_storage, RunRecord, RunStatus, SqliteStorage, Storage, StorageError, StorageResult,
};
use crate::QuarryError;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

/// Lifecycle of a run
///
/// `Idle -> Seeding -> Running -> {Completed | LimitReached | Aborted}`;
/// seeding may also end in `Aborted` when the journal cannot be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Seeding,
    Running,
    /// The frontier drained
    Completed,
    /// The request budget ran out with work still pending
    LimitReached,
    Aborted(AbortReason),
}

/// Why a run was aborted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// An external abort was requested
    Cancelled,
    /// Records or crawl state could not be persisted
    StorageFailure(String),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::LimitReached | Self::Aborted(_))
    }

    fn can_transition_to(&self, next: &RunState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Seeding)
                | (Self::Seeding, Self::Running)
                | (Self::Seeding, Self::Aborted(_))
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::LimitReached)
                | (Self::Running, Self::Aborted(_))
        )
    }

    /// Status recorded in the crawl-state database for a terminal state
    fn run_status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Completed,
            Self::LimitReached => RunStatus::LimitReached,
            Self::Aborted(AbortReason::Cancelled) => RunStatus::Interrupted,
            Self::Aborted(AbortReason::StorageFailure(_)) => RunStatus::Failed,
            Self::Idle | Self::Seeding | Self::Running => RunStatus::Running,
        }
    }
}

/// Requests an orderly stop of a running crawl
///
/// Aborting closes the frontier, so workers pick up no new requests; requests
/// already in flight get the configured grace period to finish.
#[derive(Clone)]
pub struct AbortHandle {
    requested: Arc<watch::Sender<bool>>,
    frontier: Arc<Frontier>,
}

impl AbortHandle {
    fn new(frontier: Arc<Frontier>) -> Self {
        let (requested, _) = watch::channel(false);
        Self {
            requested: Arc::new(requested),
            frontier,
        }
    }

    pub fn abort(&self) {
        self.requested.send_replace(true);
        self.frontier.close();
    }

    pub fn is_aborted(&self) -> bool {
        *self.requested.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.requested.subscribe()
    }
}

/// Shared, read-only view of the run handed to every worker
struct WorkerContext {
    frontier: Arc<Frontier>,
    limiter: Arc<HostLimiter>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn PageHandler>,
    sink: Arc<DatasetSink>,
    retry: RetryPolicy,
    follow: FollowPolicy,
}

#[derive(Debug)]
enum PageResult {
    Visited {
        records: usize,
        warnings: Vec<ExtractionWarning>,
        discovered: usize,
    },
    Failed(FetchError),
    /// The page handler or transport panicked
    Panicked(String),
}

#[derive(Debug)]
struct PageOutcome {
    url: Url,
    attempts: u32,
    errors: Vec<FetchError>,
    result: PageResult,
}

enum WorkerEvent {
    Page(PageOutcome),
    Fatal(StorageError),
}

/// Configures and creates a [`Coordinator`]
///
/// Every component not supplied explicitly is built from the configuration:
/// an HTTP transport, a selector-driven extractor, a JSON Lines dataset and,
/// when `state-path` is set, a SQLite crawl-state database.
pub struct CoordinatorBuilder {
    config: Config,
    fresh: bool,
    config_hash: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    handler: Option<Arc<dyn PageHandler>>,
    dataset: Option<Box<dyn DatasetBackend>>,
    storage: Option<SqliteStorage>,
}

impl CoordinatorBuilder {
    /// Discards any resumable run instead of continuing it
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    /// Hash of the configuration file, recorded with new runs
    pub fn config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn PageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn dataset(mut self, backend: impl DatasetBackend + 'static) -> Self {
        self.dataset = Some(Box::new(backend));
        self
    }

    pub fn storage(mut self, storage: SqliteStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validates the configuration and prepares the run
    ///
    /// Configuration errors surface here, before any request is made.
    pub fn build(self) -> Result<Coordinator, QuarryError> {
        let config = self.config;
        validate(&config)?;

        let handler: Arc<dyn PageHandler> = match self.handler {
            Some(handler) => handler,
            None => Arc::new(SelectorExtractor::from_config(&config.extract)?),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::from_config(&config.user_agent)?),
        };

        let mut storage = match self.storage {
            Some(storage) => Some(storage),
            None => config
                .output
                .state_path
                .as_deref()
                .map(|path| open_storage(Path::new(path)))
                .transpose()?,
        };

        let config_hash = self.config_hash.unwrap_or_default();
        let mut config_changed = false;
        let mut run_id = None;
        let mut resumed_from = None;
        let mut journaled = Vec::new();

        if let Some(storage) = storage.as_mut() {
            match storage.get_latest_run()? {
                Some(run) if !self.fresh && run.status.is_resumable() => {
                    tracing::info!(
                        "Resuming {} run {}",
                        run.status.to_db_string(),
                        run.id
                    );
                    if !config_hash.is_empty()
                        && !run.config_hash.is_empty()
                        && run.config_hash != config_hash
                    {
                        tracing::warn!(
                            "Configuration changed since run {} started; resuming with the new rules",
                            run.id
                        );
                        config_changed = true;
                    }
                    storage.update_run_status(run.id, RunStatus::Running)?;
                    journaled = storage.load_requests()?;
                    run_id = Some(run.id);
                    resumed_from = Some(run);
                }
                previous => {
                    if self.fresh && previous.is_some() {
                        tracing::info!("Discarding previous crawl state");
                    }
                    storage.clear_requests()?;
                    let id = storage.create_run(&config_hash)?;
                    tracing::info!("Starting new run {}", id);
                    run_id = Some(id);
                }
            }
        }

        let dataset = match self.dataset {
            Some(dataset) => dataset,
            None => Box::new(JsonLinesBackend::open(
                Path::new(&config.output.dataset_path),
                resumed_from.is_none(),
            )?),
        };
        tracing::info!("Writing records to {}", dataset.describe());

        let storage = storage.map(|s| Arc::new(Mutex::new(s)));
        let journal = match (&storage, run_id) {
            (Some(storage), Some(id)) => Some(FrontierJournal::new(storage.clone(), id)),
            _ => None,
        };

        let frontier = Arc::new(Frontier::new(config.crawler.max_requests, journal));
        if !journaled.is_empty() {
            let requeued = frontier.restore(journaled);
            tracing::info!(
                "Restored {} seen URLs, {} requests still to fetch",
                frontier.seen_len(),
                requeued
            );
        }

        Ok(Coordinator {
            limiter: Arc::new(HostLimiter::from_config(&config.crawler)),
            abort: AbortHandle::new(frontier.clone()),
            frontier,
            transport,
            handler,
            sink: Arc::new(DatasetSink::from_boxed(dataset)),
            storage,
            run_id,
            resumed_from,
            config_changed,
            state: RunState::Idle,
            stats: CrawlStats::default(),
            config: Arc::new(config),
        })
    }
}

/// Main crawler coordinator structure
pub struct Coordinator {
    config: Arc<Config>,
    frontier: Arc<Frontier>,
    limiter: Arc<HostLimiter>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn PageHandler>,
    sink: Arc<DatasetSink>,
    storage: Option<Arc<Mutex<SqliteStorage>>>,
    run_id: Option<i64>,
    resumed_from: Option<RunRecord>,
    config_changed: bool,
    state: RunState,
    stats: CrawlStats,
    abort: AbortHandle,
}

impl Coordinator {
    /// Creates a new coordinator instance
    ///
    /// # Arguments
    ///
    /// * `config` - The crawler configuration
    /// * `fresh` - Whether to start a fresh crawl (discards resumable state)
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Successfully created coordinator
    /// * `Err(QuarryError)` - Invalid configuration or unusable storage
    pub fn new(config: Config, fresh: bool) -> Result<Self, QuarryError> {
        Self::builder(config).fresh(fresh).build()
    }

    pub fn builder(config: Config) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            fresh: false,
            config_hash: None,
            transport: None,
            handler: None,
            dataset: None,
            storage: None,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn stats(&self) -> &CrawlStats {
        &self.stats
    }

    pub fn run_id(&self) -> Option<i64> {
        self.run_id
    }

    /// Returns true if this coordinator continues an earlier run
    pub fn is_resumed(&self) -> bool {
        self.resumed_from.is_some()
    }

    /// Returns true if a resumed run was started with a different configuration
    pub fn config_changed(&self) -> bool {
        self.config_changed
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    /// Handle that stops this run from another task
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn transition(&mut self, next: RunState) -> Result<(), QuarryError> {
        if !self.state.can_transition_to(&next) {
            return Err(QuarryError::InvalidTransition {
                from: self.state.clone(),
                to: next,
            });
        }
        tracing::debug!("Run state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Runs the crawl to a terminal state
    ///
    /// Per-request failures and storage failures are reported through the
    /// returned `CrawlReport`; `Err` means the coordinator was misused (for
    /// example, run twice).
    pub async fn run(&mut self) -> Result<CrawlReport, QuarryError> {
        self.transition(RunState::Seeding)?;
        let started = Instant::now();

        if let Err(error) = self.seed() {
            tracing::error!("Failed to journal seed URLs: {}", error);
            let state = RunState::Aborted(AbortReason::StorageFailure(error.to_string()));
            return self.finish(state, started);
        }

        self.transition(RunState::Running)?;
        tracing::info!(
            "Crawling with {} workers ({} pending)",
            self.config.crawler.max_concurrency,
            self.frontier.pending_len()
        );

        let state = match self.drive(started).await {
            Some(reason) => RunState::Aborted(reason),
            None if self.frontier.limit_reached() && self.frontier.pending_len() > 0 => {
                RunState::LimitReached
            }
            None => RunState::Completed,
        };

        self.finish(state, started)
    }

    /// Enqueues the configured seeds at depth 0
    ///
    /// On resume most seeds are already seen and are silently skipped.
    fn seed(&mut self) -> StorageResult<()> {
        let mut accepted = 0;

        for seed in &self.config.crawler.seed_urls {
            match self.frontier.enqueue(seed, 0) {
                Ok(EnqueueOutcome::Accepted) => accepted += 1,
                Ok(EnqueueOutcome::Rejected(_)) => {
                    tracing::debug!("Seed {} already seen", seed);
                }
                Err(QuarryError::Storage(error)) => return Err(error),
                Err(error) => tracing::warn!("Skipping seed {}: {}", seed, error),
            }
        }

        tracing::info!("Seeded {} URL(s)", accepted);
        Ok(())
    }

    /// Runs the worker pool until it stops, returning the abort reason if any
    async fn drive(&mut self, started: Instant) -> Option<AbortReason> {
        let context = Arc::new(WorkerContext {
            frontier: self.frontier.clone(),
            limiter: self.limiter.clone(),
            transport: self.transport.clone(),
            handler: self.handler.clone(),
            sink: self.sink.clone(),
            retry: RetryPolicy::from_config(&self.config.crawler),
            follow: FollowPolicy {
                strategy: self.config.crawler.enqueue_strategy,
                max_depth: self.config.crawler.max_depth,
            },
        });

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let workers: Vec<JoinHandle<()>> = (0..self.config.crawler.max_concurrency as usize)
            .map(|id| tokio::spawn(run_worker(id, context.clone(), events_tx.clone())))
            .collect();
        drop(events_tx);

        let grace = Duration::from_millis(self.config.crawler.abort_grace_ms);
        let mut abort_requested = self.abort.subscribe();
        let mut abort_reason = None;
        let mut deadline = None;
        let mut forced = false;

        if *abort_requested.borrow_and_update() {
            abort_reason = Some(AbortReason::Cancelled);
            deadline = Some(tokio::time::Instant::now() + grace);
        }

        loop {
            let grace_expired = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = events.recv() => match event {
                    Some(WorkerEvent::Page(outcome)) => self.record_outcome(outcome, started),
                    Some(WorkerEvent::Fatal(error)) => {
                        tracing::error!("Storage failure, stopping crawl: {}", error);
                        if abort_reason.is_none() {
                            abort_reason = Some(AbortReason::StorageFailure(error.to_string()));
                            deadline = Some(tokio::time::Instant::now() + grace);
                        }
                        self.frontier.close();
                    }
                    None => break,
                },
                changed = abort_requested.changed(), if abort_reason.is_none() => {
                    if changed.is_ok() && *abort_requested.borrow() {
                        tracing::warn!(
                            "Abort requested, waiting up to {:?} for {} in-flight request(s)",
                            grace,
                            self.frontier.in_flight_len()
                        );
                        abort_reason = Some(AbortReason::Cancelled);
                        deadline = Some(tokio::time::Instant::now() + grace);
                    }
                }
                _ = grace_expired => {
                    tracing::warn!(
                        "Grace period elapsed, cancelling {} in-flight request(s)",
                        self.frontier.in_flight_len()
                    );
                    forced = true;
                    break;
                }
            }
        }

        for worker in &workers {
            if forced {
                worker.abort();
            }
        }
        for worker in workers {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    tracing::error!("Worker task failed: {}", e);
                }
            }
        }

        // Outcomes reported just before a forced stop
        while let Ok(event) = events.try_recv() {
            if let WorkerEvent::Page(outcome) = event {
                self.record_outcome(outcome, started);
            }
        }

        abort_reason.or_else(|| self.late_abort())
    }

    /// An abort noticed only after the pool stopped counts if work was left
    fn late_abort(&self) -> Option<AbortReason> {
        let unfinished = self.frontier.pending_len() + self.frontier.in_flight_len();
        (self.abort.is_aborted() && unfinished > 0).then_some(AbortReason::Cancelled)
    }

    fn record_outcome(&mut self, outcome: PageOutcome, started: Instant) {
        let stats = &mut self.stats;
        stats.retries += u64::from(outcome.attempts.saturating_sub(1));
        for error in &outcome.errors {
            match error.kind() {
                FailureKind::Network => stats.network_errors += 1,
                FailureKind::Parse => stats.parse_errors += 1,
            }
        }

        match outcome.result {
            PageResult::Visited {
                records,
                warnings,
                discovered,
            } => {
                stats.pages_visited += 1;
                stats.records_extracted += records as u64;
                for warning in &warnings {
                    stats.extraction_warnings += 1;
                    match warning {
                        ExtractionWarning::NoRecords => stats.empty_pages += 1,
                        ExtractionWarning::MalformedEntry { .. } => stats.malformed_entries += 1,
                    }
                }
                tracing::debug!(
                    "Visited {}: {} records, {} new links",
                    outcome.url,
                    records,
                    discovered
                );
            }
            PageResult::Failed(error) => {
                stats.pages_failed += 1;
                tracing::debug!("Failed {}: {}", outcome.url, error);
            }
            PageResult::Panicked(message) => {
                stats.pages_failed += 1;
                tracing::debug!("Failed {}: panic: {}", outcome.url, message);
            }
        }

        let finished = stats.pages_visited + stats.pages_failed;
        if finished % 10 == 0 {
            let rate = finished as f64 / started.elapsed().as_secs_f64().max(f64::EPSILON);
            tracing::info!(
                "Progress: {} pages visited, {} failed, {} records, {} pending, {:.2} pages/sec",
                stats.pages_visited,
                stats.pages_failed,
                stats.records_extracted,
                self.frontier.pending_len(),
                rate
            );
        }
    }

    /// Counters of this invocation plus those of the run it resumed
    fn cumulative_stats(&self) -> CrawlStats {
        let mut totals = self.stats.clone();
        if let Some(previous) = &self.resumed_from {
            totals.pages_visited += previous.pages_visited;
            totals.records_extracted += previous.records_extracted;
            totals.pages_failed += previous.pages_failed;
        }
        totals
    }

    fn finish(&mut self, state: RunState, started: Instant) -> Result<CrawlReport, QuarryError> {
        self.transition(state.clone())?;
        self.stats.requests_issued = self.frontier.requests_issued();

        if let (Some(storage), Some(run_id)) = (&self.storage, self.run_id) {
            let totals = self.cumulative_stats();
            let recorded = storage
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .finish_run(run_id, state.run_status(), &totals);
            if let Err(e) = recorded {
                tracing::error!("Failed to record outcome of run {}: {}", run_id, e);
            }
        }

        let report = CrawlReport {
            run_id: self.run_id,
            state,
            stats: self.stats.clone(),
            elapsed: started.elapsed(),
        };

        tracing::info!(
            "Crawl {}: {} pages visited, {} records in {:?}",
            report.headline(),
            report.stats.pages_visited,
            report.stats.records_extracted,
            report.elapsed
        );

        Ok(report)
    }
}

async fn run_worker(
    id: usize,
    context: Arc<WorkerContext>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    loop {
        let request = match context.frontier.dequeue().await {
            Ok(Dequeued::Request(request)) => request,
            Ok(other) => {
                tracing::debug!("Worker {} stopping: {:?}", id, other);
                break;
            }
            Err(error) => {
                let _ = events.send(WorkerEvent::Fatal(error));
                break;
            }
        };

        let processed = AssertUnwindSafe(process_request(&context, request.clone()))
            .catch_unwind()
            .await;

        let event = match processed {
            Ok(Ok(outcome)) => WorkerEvent::Page(outcome),
            Ok(Err(error)) => WorkerEvent::Fatal(error),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("Worker {} panicked on {}: {}", id, request.url, message);
                match context
                    .frontier
                    .mark_done(&request, RequestState::Failed, Some(&message))
                {
                    Ok(()) => WorkerEvent::Page(PageOutcome {
                        url: request.url,
                        attempts: 0,
                        errors: Vec::new(),
                        result: PageResult::Panicked(message),
                    }),
                    Err(error) => WorkerEvent::Fatal(error),
                }
            }
        };

        let fatal = matches!(event, WorkerEvent::Fatal(_));
        if events.send(event).is_err() || fatal {
            break;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fetches, extracts, persists and expands a single request
///
/// A storage error leaves the request in flight in the journal, so a resumed
/// run fetches it again.
async fn process_request(
    context: &WorkerContext,
    request: FetchRequest,
) -> StorageResult<PageOutcome> {
    let FetchResult {
        request,
        status,
        attempts,
        errors,
    } = fetch_with_retry(
        context.transport.as_ref(),
        &context.limiter,
        request,
        &context.retry,
    )
    .await;

    let result = match status {
        FetchStatus::Success(document) => {
            let extraction = {
                let html = parse_document(&document);
                context.handler.extract(&html, &document.url)
            };
            for warning in &extraction.warnings {
                tracing::warn!("{}: {}", request.url, warning);
            }

            context.sink.append(&extraction.records).await?;
            let discovered =
                enqueue_follow_ups(context, &request, &document.url, extraction.follow_ups)?;
            context.frontier.mark_done(&request, RequestState::Done, None)?;

            PageResult::Visited {
                records: extraction.records.len(),
                warnings: extraction.warnings,
                discovered,
            }
        }
        FetchStatus::Failure(error) => {
            tracing::warn!(
                "Giving up on {} after {} attempt(s): {}",
                request.url,
                attempts,
                error
            );
            let message = error.to_string();
            context
                .frontier
                .mark_done(&request, RequestState::Failed, Some(&message))?;
            PageResult::Failed(error)
        }
    };

    Ok(PageOutcome {
        url: request.url,
        attempts,
        errors,
        result,
    })
}

fn enqueue_follow_ups(
    context: &WorkerContext,
    request: &FetchRequest,
    source: &Url,
    links: Vec<Url>,
) -> StorageResult<usize> {
    let mut accepted = 0;

    for link in links {
        if !context.follow.admits(&link, source, request.depth) {
            tracing::trace!("Not following {} from {}", link, source);
            continue;
        }

        match context.frontier.enqueue_url(link, request.depth + 1) {
            Ok(EnqueueOutcome::Accepted) => accepted += 1,
            Ok(EnqueueOutcome::Rejected(_)) => {}
            Err(QuarryError::Storage(error)) => return Err(error),
            Err(error) => tracing::debug!("Skipping link found on {}: {}", source, error),
        }
    }

    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CrawlerConfig, EnqueueStrategy, ExtractConfig, FieldConfig, FieldKind, OutputConfig,
        UserAgentConfig,
    };
    use crate::crawler::extractor::Extraction;
    use crate::dataset::{ExtractedRecord, FieldValue, MemoryBackend};
    use async_trait::async_trait;
    use crate::crawler::fetcher::FetchedPage;
    use std::collections::HashMap;
    use tempfile::TempDir;

    type PageFn = dyn Fn(&Url) -> Option<String> + Send + Sync;

    /// In-process site: pages come from a closure, every fetch start is logged
    struct MockSite {
        page: Box<PageFn>,
        latency: Duration,
        flaky: Mutex<HashMap<String, u32>>,
        fetches: Mutex<Vec<(String, Instant)>>,
    }

    impl MockSite {
        fn new(page: impl Fn(&Url) -> Option<String> + Send + Sync + 'static) -> Arc<Self> {
            Self::with_latency(Duration::ZERO, page)
        }

        fn with_latency(
            latency: Duration,
            page: impl Fn(&Url) -> Option<String> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                page: Box::new(page),
                latency,
                flaky: Mutex::new(HashMap::new()),
                fetches: Mutex::new(Vec::new()),
            })
        }

        /// Makes the next `times` fetches of `url` time out
        fn fail(&self, url: &str, times: u32) {
            self.flaky.lock().unwrap().insert(url.to_string(), times);
        }

        fn fetched(&self) -> Vec<String> {
            self.fetches.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
        }

        fn fetch_counts(&self) -> HashMap<String, usize> {
            let mut counts = HashMap::new();
            for url in self.fetched() {
                *counts.entry(url).or_insert(0) += 1;
            }
            counts
        }

        fn start_times(&self) -> Vec<Instant> {
            self.fetches.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }
    }

    #[async_trait]
    impl Transport for MockSite {
        async fn fetch(&self, url: &Url, _timeout: Duration) -> Result<FetchedPage, FetchError> {
            self.fetches
                .lock()
                .unwrap()
                .push((url.to_string(), Instant::now()));

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            if let Some(remaining) = self.flaky.lock().unwrap().get_mut(url.as_str()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Timeout);
                }
            }

            let (status_code, body) = match (self.page)(url) {
                Some(body) => (200, body),
                None => (404, String::new()),
            };
            Ok(FetchedPage {
                url: url.clone(),
                status_code,
                content_type: Some("text/html; charset=utf-8".to_string()),
                body: body.into_bytes(),
            })
        }
    }

    fn page_with_links(links: &[String]) -> String {
        let anchors: String = links
            .iter()
            .map(|l| format!(r#"<a class="next" href="{}">next</a>"#, l))
            .collect();
        format!(
            r#"<html><body><div class="quote"><span class="text">q</span><small class="author">a</small></div>{}</body></html>"#,
            anchors
        )
    }

    /// Infinite binary tree: /n links to /2n and /2n+1
    fn tree_site(latency: Duration) -> Arc<MockSite> {
        MockSite::with_latency(latency, |url| {
            let n: u64 = url.path().trim_start_matches('/').parse().ok()?;
            Some(page_with_links(&[format!("/{}", 2 * n), format!("/{}", 2 * n + 1)]))
        })
    }

    /// Chain /1 -> /2 -> ... -> /len
    fn chain_site(len: u64) -> Arc<MockSite> {
        MockSite::new(move |url| {
            let n: u64 = url.path().trim_start_matches('/').parse().ok()?;
            if n > len {
                return None;
            }
            let next: Vec<String> = if n < len {
                vec![format!("/{}", n + 1)]
            } else {
                vec![]
            };
            Some(page_with_links(&next))
        })
    }

    fn test_config(seeds: &[&str]) -> Config {
        Config {
            crawler: CrawlerConfig {
                retry_backoff_ms: 1,
                abort_grace_ms: 2_000,
                ..CrawlerConfig::with_seeds(seeds.iter().map(|s| s.to_string()).collect())
            },
            user_agent: UserAgentConfig {
                crawler_name: "TestCrawler".to_string(),
                crawler_version: "1.0".to_string(),
                contact_url: "https://example.com/about".to_string(),
                contact_email: "admin@example.com".to_string(),
            },
            output: OutputConfig {
                dataset_path: "unused.jsonl".to_string(),
                state_path: None,
            },
            extract: ExtractConfig {
                record_selector: "div.quote".to_string(),
                follow_link_selector: Some("a.next".to_string()),
                fields: vec![
                    FieldConfig {
                        name: "text".to_string(),
                        selector: "span.text".to_string(),
                        kind: FieldKind::Text,
                        attribute: None,
                        required: true,
                    },
                    FieldConfig {
                        name: "author".to_string(),
                        selector: "small.author".to_string(),
                        kind: FieldKind::Text,
                        attribute: None,
                        required: true,
                    },
                ],
            },
        }
    }

    fn coordinator(config: Config, site: &Arc<MockSite>, dataset: &MemoryBackend) -> Coordinator {
        Coordinator::builder(config)
            .transport(site.clone())
            .dataset(dataset.clone())
            .build()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_request_limit_is_exact() {
        let site = tree_site(Duration::from_millis(5));
        let mut config = test_config(&["http://tree.test/1"]);
        config.crawler.max_requests = Some(10);
        config.crawler.max_concurrency = 4;
        config.crawler.per_host_concurrency = 4;

        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        let report = crawler.run().await.unwrap();

        assert_eq!(report.state, RunState::LimitReached);
        assert_eq!(site.fetched().len(), 10);
        assert_eq!(report.stats.requests_issued, 10);
        assert_eq!(report.stats.pages_visited, 10);
        assert!(crawler.frontier().pending_len() > 0);
        assert_eq!(crawler.frontier().in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_limit_matching_graph_size_completes() {
        let site = chain_site(3);
        let mut config = test_config(&["http://chain.test/1"]);
        config.crawler.max_requests = Some(3);

        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        let report = crawler.run().await.unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.stats.pages_visited, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_loss_no_duplication() {
        let seeds: Vec<String> = (0..40)
            .map(|i| format!("http://host{}.test/page{}", i % 5, i))
            .collect();
        let seed_refs: Vec<&str> = seeds.iter().map(String::as_str).collect();

        for workers in [1, 4, 16] {
            let site = MockSite::new(|_| Some(page_with_links(&[])));
            let dataset = MemoryBackend::new();
            let mut config = test_config(&seed_refs);
            config.crawler.max_concurrency = workers;
            config.crawler.per_host_concurrency = 2;

            let mut crawler = coordinator(config, &site, &dataset);
            let report = crawler.run().await.unwrap();

            assert_eq!(report.state, RunState::Completed, "workers = {}", workers);
            let counts = site.fetch_counts();
            assert_eq!(counts.len(), seeds.len(), "workers = {}", workers);
            assert!(counts.values().all(|&c| c == 1), "workers = {}", workers);
            assert_eq!(report.stats.pages_visited, seeds.len() as u64);
            assert_eq!(dataset.len(), seeds.len());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_politeness_delay_per_host() {
        let delay = Duration::from_millis(500);
        let site = MockSite::new(|_| Some(page_with_links(&[])));
        let mut config = test_config(&[
            "http://polite.test/a",
            "http://polite.test/b",
            "http://polite.test/c",
            "http://polite.test/d",
        ]);
        config.crawler.max_concurrency = 4;
        config.crawler.per_host_concurrency = 1;
        config.crawler.per_host_delay_ms = delay.as_millis() as u64;

        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        crawler.run().await.unwrap();

        let mut starts = site.start_times();
        starts.sort();
        assert_eq!(starts.len(), 4);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= delay, "gap {:?}", pair[1] - pair[0]);
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let site = chain_site(1);
        site.fail("http://chain.test/1", 2);
        let config = test_config(&["http://chain.test/1"]);

        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        let report = crawler.run().await.unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.stats.pages_visited, 1);
        assert_eq!(report.stats.pages_failed, 0);
        assert_eq!(report.stats.retries, 2);
        assert_eq!(report.stats.network_errors, 2);
        assert_eq!(report.stats.requests_issued, 1);
    }

    #[tokio::test]
    async fn test_failed_pages_do_not_stall_the_run() {
        let site = MockSite::new(|url| {
            (url.path() != "/broken").then(|| page_with_links(&[]))
        });
        site.fail("http://mixed.test/slow", 10);
        let config = test_config(&[
            "http://mixed.test/ok",
            "http://mixed.test/broken",
            "http://mixed.test/slow",
        ]);

        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        let report = crawler.run().await.unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.stats.pages_visited, 1);
        assert_eq!(report.stats.pages_failed, 2);
        // 404 is final, the timeout is retried twice
        assert_eq!(site.fetch_counts()["http://mixed.test/broken"], 1);
        assert_eq!(site.fetch_counts()["http://mixed.test/slow"], 3);
        assert_eq!(crawler.frontier().in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_extraction_warnings_are_counted() {
        let site = MockSite::new(|url| match url.path() {
            "/1" => Some(
                r#"<div class="quote"><span class="text">a</span><small class="author">x</small></div>
                   <div class="quote"><span class="text">b</span></div>
                   <a class="next" href="/2">next</a>"#
                    .to_string(),
            ),
            "/2" => Some("<p>nothing</p>".to_string()),
            _ => None,
        });
        let dataset = MemoryBackend::new();

        let mut crawler = coordinator(test_config(&["http://warn.test/1"]), &site, &dataset);
        let report = crawler.run().await.unwrap();

        assert_eq!(report.stats.records_extracted, 1);
        assert_eq!(report.stats.extraction_warnings, 2);
        assert_eq!(report.stats.malformed_entries, 1);
        assert_eq!(report.stats.empty_pages, 1);
        assert_eq!(
            dataset.records()[0].get("text"),
            Some(&FieldValue::Text("a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_same_host_strategy_and_depth() {
        let site = MockSite::new(|url| match (url.host_str(), url.path()) {
            (Some("home.test"), "/") => Some(page_with_links(&[
                "http://away.test/".to_string(),
                "/deeper".to_string(),
            ])),
            (_, "/deeper") => Some(page_with_links(&["/deepest".to_string()])),
            _ => Some(page_with_links(&[])),
        });
        let mut config = test_config(&["http://home.test/"]);
        config.crawler.max_depth = Some(1);

        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        crawler.run().await.unwrap();

        let mut fetched = site.fetched();
        fetched.sort();
        assert_eq!(fetched, vec!["http://home.test/", "http://home.test/deeper"]);
    }

    #[tokio::test]
    async fn test_all_strategy_leaves_host() {
        let site = MockSite::new(|url| match url.host_str() {
            Some("home.test") => Some(page_with_links(&["http://away.test/".to_string()])),
            _ => Some(page_with_links(&[])),
        });
        let mut config = test_config(&["http://home.test/"]);
        config.crawler.enqueue_strategy = EnqueueStrategy::All;

        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        crawler.run().await.unwrap();

        assert_eq!(site.fetched().len(), 2);
    }

    #[tokio::test]
    async fn test_custom_handler() {
        let site = chain_site(3);
        let handler = |_: &scraper::Html, url: &Url| Extraction {
            records: vec![ExtractedRecord::new().with("url", FieldValue::Text(url.to_string()))],
            ..Default::default()
        };
        let dataset = MemoryBackend::new();

        let mut crawler = Coordinator::builder(test_config(&["http://chain.test/1"]))
            .transport(site.clone())
            .handler(Arc::new(handler))
            .dataset(dataset.clone())
            .build()
            .unwrap();
        let report = crawler.run().await.unwrap();

        // The handler discovers nothing, so only the seed is visited
        assert_eq!(report.stats.pages_visited, 1);
        assert_eq!(dataset.len(), 1);
    }

    struct BrokenDisk;

    impl DatasetBackend for BrokenDisk {
        fn append_batch(&mut self, _records: &[ExtractedRecord]) -> StorageResult<()> {
            Err(StorageError::Dataset("disk full".to_string()))
        }

        fn describe(&self) -> String {
            "broken disk".to_string()
        }
    }

    #[tokio::test]
    async fn test_storage_failure_aborts_run() {
        let site = tree_site(Duration::ZERO);
        let mut crawler = Coordinator::builder(test_config(&["http://tree.test/1"]))
            .transport(site.clone())
            .dataset(BrokenDisk)
            .build()
            .unwrap();

        let report = crawler.run().await.unwrap();

        assert!(report.is_failure());
        assert!(matches!(
            report.state,
            RunState::Aborted(AbortReason::StorageFailure(ref msg)) if msg.contains("disk full")
        ));
        assert_eq!(report.stats.records_extracted, 0);
        assert!(site.fetched().len() <= crawler.config.crawler.max_concurrency as usize);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_lets_in_flight_requests_finish() {
        let site = tree_site(Duration::from_millis(100));
        let mut config = test_config(&["http://tree.test/1"]);
        config.crawler.max_concurrency = 4;
        config.crawler.per_host_concurrency = 4;

        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        let abort = crawler.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            abort.abort();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), crawler.run())
            .await
            .expect("aborted run should stop")
            .unwrap();

        assert_eq!(report.state, RunState::Aborted(AbortReason::Cancelled));
        assert!(report.stats.pages_visited > 0);
        assert_eq!(report.stats.pages_visited as usize, site.fetched().len());
        assert_eq!(crawler.frontier().in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_grace_period_cancels_stragglers() {
        let site = tree_site(Duration::from_secs(30));
        let mut config = test_config(&["http://tree.test/1"]);
        config.crawler.abort_grace_ms = 100;

        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        let abort = crawler.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort.abort();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), crawler.run())
            .await
            .expect("grace period should bound the abort")
            .unwrap();

        assert_eq!(report.state, RunState::Aborted(AbortReason::Cancelled));
        assert_eq!(report.stats.pages_visited, 0);
    }

    #[tokio::test]
    async fn test_abort_before_run() {
        let site = chain_site(3);
        let config = test_config(&["http://chain.test/1"]);
        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        crawler.abort_handle().abort();

        let report = crawler.run().await.unwrap();

        assert_eq!(report.state, RunState::Aborted(AbortReason::Cancelled));
        assert!(site.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let site = chain_site(1);
        let config = test_config(&["http://chain.test/1"]);
        let mut crawler = coordinator(config, &site, &MemoryBackend::new());

        crawler.run().await.unwrap();
        assert!(matches!(
            crawler.run().await,
            Err(QuarryError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_fetching() {
        let site = chain_site(1);
        let mut config = test_config(&[]);
        config.crawler.seed_urls.clear();

        let result = Coordinator::builder(config).transport(site.clone()).build();

        assert!(matches!(result, Err(QuarryError::Config(_))));
        assert!(site.fetched().is_empty());
    }

    fn state_config(dir: &TempDir, max_requests: Option<u64>) -> Config {
        let mut config = test_config(&["http://chain.test/1"]);
        config.crawler.max_requests = max_requests;
        config.output.state_path = Some(dir.path().join("state.db").display().to_string());
        config
    }

    #[tokio::test]
    async fn test_resume_continues_where_limit_stopped() {
        let dir = TempDir::new().unwrap();
        let site = chain_site(5);
        let dataset = MemoryBackend::new();

        let mut first = coordinator(state_config(&dir, Some(2)), &site, &dataset);
        let first_report = first.run().await.unwrap();
        assert_eq!(first_report.state, RunState::LimitReached);
        drop(first);

        let mut second = coordinator(state_config(&dir, None), &site, &dataset);
        assert!(second.is_resumed());
        let second_report = second.run().await.unwrap();

        assert_eq!(second_report.state, RunState::Completed);
        assert_eq!(second_report.run_id, first_report.run_id);
        assert_eq!(second_report.stats.pages_visited, 3);

        let counts = site.fetch_counts();
        assert_eq!(counts.len(), 5);
        assert!(counts.values().all(|&c| c == 1));
        assert_eq!(dataset.len(), 5);

        let storage = open_storage(&dir.path().join("state.db")).unwrap();
        let run = storage.get_run(second_report.run_id.unwrap()).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.pages_visited, 5);
    }

    #[tokio::test]
    async fn test_fresh_discards_previous_state() {
        let dir = TempDir::new().unwrap();
        let site = chain_site(5);

        let mut first = coordinator(state_config(&dir, Some(2)), &site, &MemoryBackend::new());
        let first_report = first.run().await.unwrap();
        drop(first);

        let mut second = Coordinator::builder(state_config(&dir, None))
            .fresh(true)
            .transport(site.clone())
            .dataset(MemoryBackend::new())
            .build()
            .unwrap();
        assert!(!second.is_resumed());
        let second_report = second.run().await.unwrap();

        assert_ne!(second_report.run_id, first_report.run_id);
        assert_eq!(second_report.stats.pages_visited, 5);
        assert_eq!(site.fetch_counts()["http://chain.test/1"], 2);
    }

    #[tokio::test]
    async fn test_completed_run_is_not_resumed() {
        let dir = TempDir::new().unwrap();
        let site = chain_site(2);

        let mut first = coordinator(state_config(&dir, None), &site, &MemoryBackend::new());
        first.run().await.unwrap();
        drop(first);

        let second = coordinator(state_config(&dir, None), &site, &MemoryBackend::new());
        assert!(!second.is_resumed());
    }

    #[tokio::test]
    async fn test_changed_config_is_noticed_on_resume() {
        let dir = TempDir::new().unwrap();
        let site = chain_site(5);

        let mut first = Coordinator::builder(state_config(&dir, Some(2)))
            .config_hash("original")
            .transport(site.clone())
            .dataset(MemoryBackend::new())
            .build()
            .unwrap();
        first.run().await.unwrap();
        assert!(!first.config_changed());
        drop(first);

        let same = Coordinator::builder(state_config(&dir, Some(1)))
            .config_hash("original")
            .transport(site.clone())
            .dataset(MemoryBackend::new())
            .build()
            .unwrap();
        assert!(same.is_resumed());
        assert!(!same.config_changed());
        drop(same);

        let edited = Coordinator::builder(state_config(&dir, None))
            .config_hash("edited")
            .transport(site.clone())
            .dataset(MemoryBackend::new())
            .build()
            .unwrap();
        assert!(edited.is_resumed());
        assert!(edited.config_changed());
    }

    fn panicking_handler(_: &scraper::Html, url: &Url) -> Extraction {
        if url.path() == "/1" {
            panic!("handler bug on {}", url);
        }
        Extraction {
            records: vec![ExtractedRecord::new().with("url", FieldValue::Text(url.to_string()))],
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handler_panic_fails_only_its_page() {
        let site = MockSite::new(|_| Some(page_with_links(&[])));
        let dataset = MemoryBackend::new();
        let mut config = test_config(&["http://site.test/1", "http://site.test/2"]);
        config.crawler.max_concurrency = 2;
        config.crawler.per_host_concurrency = 2;

        let mut crawler = Coordinator::builder(config)
            .transport(site.clone())
            .handler(Arc::new(panicking_handler))
            .dataset(dataset.clone())
            .build()
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), crawler.run())
            .await
            .expect("run stalled after a handler panic")
            .unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.stats.pages_visited, 1);
        assert_eq!(report.stats.pages_failed, 1);
        assert_eq!(dataset.len(), 1);
        assert_eq!(crawler.frontier().in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_is_journaled_as_failed() {
        let dir = TempDir::new().unwrap();
        let site = MockSite::new(|_| Some(page_with_links(&[])));
        let mut config = state_config(&dir, None);
        config.crawler.seed_urls = vec!["http://site.test/1".to_string()];

        let mut crawler = Coordinator::builder(config)
            .transport(site.clone())
            .handler(Arc::new(panicking_handler))
            .dataset(MemoryBackend::new())
            .build()
            .unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), crawler.run())
            .await
            .expect("run stalled after a handler panic")
            .unwrap();
        assert_eq!(report.state, RunState::Completed);
        drop(crawler);

        let storage = open_storage(&dir.path().join("state.db")).unwrap();
        let requests = storage.load_requests().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].state, RequestState::Failed);
        assert!(requests[0]
            .error_message
            .as_deref()
            .unwrap_or("")
            .contains("handler bug"));
    }

    #[tokio::test]
    async fn test_abort_after_drain_keeps_completed() {
        let site = chain_site(2);
        let config = test_config(&["http://chain.test/1"]);
        let mut crawler = coordinator(config, &site, &MemoryBackend::new());
        let report = crawler.run().await.unwrap();
        assert_eq!(report.state, RunState::Completed);

        crawler.abort_handle().abort();
        assert_eq!(crawler.late_abort(), None);
    }

    #[tokio::test]
    async fn test_abort_with_pending_work_is_cancelled() {
        let site = chain_site(2);
        let config = test_config(&["http://chain.test/1"]);
        let crawler = coordinator(config, &site, &MemoryBackend::new());
        crawler.frontier().enqueue("http://chain.test/1", 0).unwrap();

        assert_eq!(crawler.late_abort(), None);
        crawler.abort_handle().abort();
        assert_eq!(crawler.late_abort(), Some(AbortReason::Cancelled));
    }
}
