/// Request state definitions for tracking crawl progress
use std::fmt;

/// Represents where a fetch request is in its lifecycle
///
/// Requests move `Pending -> InFlight -> {Done | Failed}` and are never
/// re-created once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Waiting in the frontier queue
    Pending,

    /// Handed to a worker and being fetched
    InFlight,

    /// Fetched and extracted (zero records still counts as done)
    Done,

    /// Every fetch attempt failed
    Failed,
}

impl RequestState {
    /// Returns true if no further processing will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns true if the request should be re-queued when a run resumes
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Pending | Self::InFlight)
    }

    /// Converts the state to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parses a state from its database string representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}
