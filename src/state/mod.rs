//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `RequestState`: Lifecycle of a single fetch request (pending, in flight, done, failed)
//! - `HostState`: Per-host bookkeeping for politeness (in-flight count, last request start)

mod host_state;
mod request_state;

pub use host_state::HostState;
pub use request_state::RequestState;
