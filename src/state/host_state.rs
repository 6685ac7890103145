use std::time::{Duration, Instant};

/// Tracks the politeness state of a single host during crawling
#[derive(Debug, Clone, Default)]
pub struct HostState {
    /// Requests to this host currently holding a permit
    pub in_flight: u32,

    /// When the most recent request to this host started
    pub last_request_time: Option<Instant>,

    /// Total requests started against this host
    pub request_count: u64,
}

impl HostState {
    /// Creates a new HostState with nothing in flight
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks if a request may start on this host now
    ///
    /// This method enforces:
    /// - The per-host concurrency limit
    /// - The minimum delay between request starts on the same host
    pub fn can_request(&self, max_in_flight: u32, min_delay: Duration, now: Instant) -> bool {
        if self.in_flight >= max_in_flight {
            return false;
        }

        self.time_until_next_request(min_delay, now).is_none()
    }

    /// Records that a request started on this host
    pub fn record_request(&mut self, now: Instant) {
        self.in_flight += 1;
        self.request_count += 1;
        self.last_request_time = Some(now);
    }

    /// Records that a request on this host finished
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Calculates how long until the minimum delay has elapsed
    ///
    /// Returns None if the delay has already passed.
    pub fn time_until_next_request(&self, min_delay: Duration, now: Instant) -> Option<Duration> {
        let last = self.last_request_time?;
        let elapsed = now.saturating_duration_since(last);
        if elapsed < min_delay {
            Some(min_delay - elapsed)
        } else {
            None
        }
    }
}
