//! Per-host politeness scheduling
//!
//! This module handles:
//! - Per-host concurrency limiting
//! - Respecting the minimum delay between request starts on the same host
//!
//! Global concurrency is bounded by the number of workers; the limiter only
//! decides when a worker may start a fetch against a particular host.

use crate::config::CrawlerConfig;
use crate::state::HostState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Admission control for fetches, keyed by host
pub struct HostLimiter {
    /// Per-host state tracking
    hosts: Mutex<HashMap<String, HostState>>,

    /// Signalled whenever a permit is released
    released: Notify,

    max_in_flight: u32,
    min_delay: Duration,
}

/// Permission to run one fetch against a host; released on drop
pub struct HostPermit {
    limiter: Arc<HostLimiter>,
    host: String,
}

impl HostPermit {
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for HostPermit {
    fn drop(&mut self) {
        self.limiter.release(&self.host);
    }
}

impl HostLimiter {
    /// Creates a new limiter
    ///
    /// # Arguments
    ///
    /// * `max_in_flight` - Maximum concurrent fetches per host (at least 1)
    /// * `min_delay` - Minimum time between fetch starts on the same host
    pub fn new(max_in_flight: u32, min_delay: Duration) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            released: Notify::new(),
            max_in_flight: max_in_flight.max(1),
            min_delay,
        }
    }

    /// Creates a limiter from the crawler configuration
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self::new(
            config.per_host_concurrency,
            Duration::from_millis(config.per_host_delay_ms),
        )
    }

    fn hosts(&self) -> MutexGuard<'_, HashMap<String, HostState>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until a fetch against `host` may start
    ///
    /// The start is recorded at the moment the permit is granted, so the delay
    /// between two grants on one host is never shorter than `min_delay`.
    pub async fn acquire(self: &Arc<Self>, host: &str) -> HostPermit {
        loop {
            let released = self.released.notified();

            let wait = {
                let mut hosts = self.hosts();
                let state = hosts.entry(host.to_string()).or_default();
                let now = Instant::now();

                if state.in_flight >= self.max_in_flight {
                    None
                } else {
                    match state.time_until_next_request(self.min_delay, now) {
                        None => {
                            state.record_request(now);
                            tracing::trace!(
                                "Granted fetch on {} ({} in flight)",
                                host,
                                state.in_flight
                            );
                            return HostPermit {
                                limiter: Arc::clone(self),
                                host: host.to_string(),
                            };
                        }
                        Some(remaining) => Some(remaining),
                    }
                }
            };

            match wait {
                Some(remaining) => {
                    tracing::trace!("Host {} cooling down for {:?}", host, remaining);
                    tokio::time::sleep(remaining).await;
                }
                None => released.await,
            }
        }
    }

    fn release(&self, host: &str) {
        if let Some(state) = self.hosts().get_mut(host) {
            state.release();
        }
        self.released.notify_waiters();
    }

    /// Returns the number of fetches currently holding a permit for `host`
    pub fn in_flight(&self, host: &str) -> u32 {
        self.hosts().get(host).map(|s| s.in_flight).unwrap_or(0)
    }

    /// Returns the number of fetches ever granted for `host`
    pub fn request_count(&self, host: &str) -> u64 {
        self.hosts().get(host).map(|s| s.request_count).unwrap_or(0)
    }
}
