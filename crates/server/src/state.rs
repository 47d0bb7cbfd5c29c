// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use casework_jobs::Scheduler;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// Per-case job scheduler. Producers elsewhere in the process enqueue
    /// into this same instance.
    pub jobs: Scheduler,
}

impl AppState {
    /// Create a new application state wrapped in an Arc for sharing.
    pub fn new(jobs: Scheduler) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            jobs,
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
