//! Deduplicating crawl frontier
//!
//! The frontier owns the seen set, the FIFO queue of pending requests and the
//! set of requests currently in flight. All three live behind one mutex, so
//! "check seen, then insert" and "pop, then mark in flight" are each a single
//! indivisible step no matter how many workers share the frontier.

use crate::state::RequestState;
use crate::storage::{RequestRecord, SqliteStorage, Storage, StorageResult};
use crate::url::{host_key, normalize_parsed, normalize_url};
use crate::QuarryError;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use url::Url;

/// A request waiting for, or undergoing, a fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Normalized absolute URL; its string form is the request identity
    pub url: Url,

    /// Link distance from the seed set
    pub depth: u32,

    /// When the request entered the frontier
    pub enqueued_at: DateTime<Utc>,
}

impl FetchRequest {
    /// Identity used by the seen set
    pub fn key(&self) -> &str {
        self.url.as_str()
    }

    /// Politeness key of the request's host
    pub fn host(&self) -> String {
        host_key(&self.url).unwrap_or_default()
    }
}

/// Result of offering a URL to the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    Rejected(RejectReason),
}

/// Why a URL was not enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The normalized URL was enqueued before (it may be pending, in flight or done)
    AlreadySeen,
}

/// Result of asking the frontier for work
#[derive(Debug)]
pub enum Dequeued {
    /// A request, now in flight
    Request(FetchRequest),

    /// The request budget is spent; no new requests will be issued
    Exhausted,

    /// Nothing pending and nothing in flight
    Drained,

    /// The frontier was closed
    Closed,
}

/// Journal of frontier mutations in the crawl-state database
#[derive(Clone)]
pub struct FrontierJournal {
    storage: Arc<Mutex<SqliteStorage>>,
    run_id: i64,
}

impl FrontierJournal {
    pub fn new(storage: Arc<Mutex<SqliteStorage>>, run_id: i64) -> Self {
        Self { storage, run_id }
    }

    fn storage(&self) -> MutexGuard<'_, SqliteStorage> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_enqueued(&self, request: &FetchRequest) -> StorageResult<()> {
        self.storage().record_request(
            request.key(),
            request.depth,
            &request.enqueued_at.to_rfc3339(),
            self.run_id,
        )
    }

    fn record_state(
        &self,
        url: &str,
        state: RequestState,
        error_message: Option<&str>,
    ) -> StorageResult<()> {
        self.storage().update_request_state(url, state, error_message)
    }
}

#[derive(Default)]
struct FrontierInner {
    seen: HashSet<String>,
    pending: VecDeque<FetchRequest>,
    in_flight: HashSet<String>,
    issued: u64,
    closed: bool,
}

/// Shared frontier of a single run
pub struct Frontier {
    inner: Mutex<FrontierInner>,
    changed: Notify,
    max_requests: Option<u64>,
    journal: Option<FrontierJournal>,
}

impl Frontier {
    /// Creates an empty frontier
    ///
    /// # Arguments
    ///
    /// * `max_requests` - Cap on the number of requests `dequeue` will issue
    /// * `journal` - Optional durable record of every mutation
    pub fn new(max_requests: Option<u64>, journal: Option<FrontierJournal>) -> Self {
        Self {
            inner: Mutex::new(FrontierInner::default()),
            changed: Notify::new(),
            max_requests,
            journal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FrontierInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebuilds the frontier state of an interrupted run
    ///
    /// Every journaled URL joins the seen set; requests that never reached a
    /// terminal state are queued again in their original order.
    pub fn restore(&self, records: Vec<RequestRecord>) -> usize {
        let mut inner = self.lock();
        let mut requeued = 0;

        for record in records {
            let Ok(url) = normalize_url(&record.url) else {
                tracing::warn!("Skipping unparsable journal entry {}", record.url);
                continue;
            };
            if !inner.seen.insert(url.as_str().to_string()) {
                continue;
            }
            if record.state.is_resumable() {
                let enqueued_at = DateTime::parse_from_rfc3339(&record.enqueued_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                inner.pending.push_back(FetchRequest {
                    url,
                    depth: record.depth,
                    enqueued_at,
                });
                requeued += 1;
            }
        }

        drop(inner);
        self.changed.notify_waiters();
        requeued
    }

    /// Offers a URL string to the frontier
    pub fn enqueue(&self, url: &str, depth: u32) -> Result<EnqueueOutcome, QuarryError> {
        let url = normalize_url(url)?;
        self.insert(url, depth)
    }

    /// Offers a parsed URL to the frontier
    pub fn enqueue_url(&self, url: Url, depth: u32) -> Result<EnqueueOutcome, QuarryError> {
        let url = normalize_parsed(url)?;
        self.insert(url, depth)
    }

    fn insert(&self, url: Url, depth: u32) -> Result<EnqueueOutcome, QuarryError> {
        let mut inner = self.lock();

        if inner.seen.contains(url.as_str()) {
            tracing::trace!("Already seen: {}", url);
            return Ok(EnqueueOutcome::Rejected(RejectReason::AlreadySeen));
        }

        let request = FetchRequest {
            url,
            depth,
            enqueued_at: Utc::now(),
        };

        // Journal first: a URL is only seen once it is durable
        if let Some(journal) = &self.journal {
            journal.record_enqueued(&request)?;
        }

        inner.seen.insert(request.key().to_string());
        tracing::debug!("Enqueued {} (depth {})", request.url, request.depth);
        inner.pending.push_back(request);

        drop(inner);
        self.changed.notify_waiters();
        Ok(EnqueueOutcome::Accepted)
    }

    /// Takes the oldest pending request, waiting while others are in flight
    ///
    /// Suspends (without polling) when nothing is pending but some request is
    /// still in flight, since that request may discover more work.
    pub async fn dequeue(&self) -> StorageResult<Dequeued> {
        loop {
            // Registered before inspecting state so no wake-up is missed
            let changed = self.changed.notified();

            {
                let mut inner = self.lock();

                if inner.closed {
                    return Ok(Dequeued::Closed);
                }
                if inner.pending.is_empty() && inner.in_flight.is_empty() {
                    return Ok(Dequeued::Drained);
                }
                if self.budget_spent(&inner) {
                    return Ok(Dequeued::Exhausted);
                }

                if let Some(request) = inner.pending.pop_front() {
                    if let Some(journal) = &self.journal {
                        if let Err(e) =
                            journal.record_state(request.key(), RequestState::InFlight, None)
                        {
                            inner.pending.push_front(request);
                            return Err(e);
                        }
                    }

                    inner.in_flight.insert(request.key().to_string());
                    inner.issued += 1;
                    return Ok(Dequeued::Request(request));
                }
            }

            changed.await;
        }
    }

    /// Moves an in-flight request to a terminal state
    ///
    /// The request leaves the in-flight set even if the journal write fails,
    /// so waiting workers are never stranded.
    pub fn mark_done(
        &self,
        request: &FetchRequest,
        state: RequestState,
        error_message: Option<&str>,
    ) -> StorageResult<()> {
        let mut inner = self.lock();
        inner.in_flight.remove(request.key());

        let journaled = match &self.journal {
            Some(journal) => journal.record_state(request.key(), state, error_message),
            None => Ok(()),
        };

        drop(inner);
        self.changed.notify_waiters();
        journaled
    }

    /// Stops issuing requests; pending requests stay queued (and journaled)
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    fn budget_spent(&self, inner: &FrontierInner) -> bool {
        self.max_requests
            .map(|max| inner.issued >= max)
            .unwrap_or(false)
    }

    /// Returns true once `dequeue` has issued `max_requests` requests
    pub fn limit_reached(&self) -> bool {
        self.budget_spent(&self.lock())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn seen_len(&self) -> usize {
        self.lock().seen.len()
    }

    /// Requests handed out by `dequeue` so far
    pub fn requests_issued(&self) -> u64 {
        self.lock().issued
    }
}
