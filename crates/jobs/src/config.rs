// crates/jobs/src/config.rs
//! Scheduler configuration.

use std::time::Duration;

/// How long a finished job stays queryable before it is purged.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Buffered updates per broadcast subscriber before it starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Largest accepted broadcast capacity; slots are allocated up front.
pub const MAX_EVENT_CAPACITY: usize = 65_536;

const RETENTION_ENV: &str = "CASEWORK_JOB_RETENTION_SECS";
const EVENT_CAPACITY_ENV: &str = "CASEWORK_EVENT_CAPACITY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub retention: Duration,
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Read overrides from the environment, falling back to defaults.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup(RETENTION_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => config.retention = Duration::from_secs(secs),
                Err(e) => tracing::warn!(key = RETENTION_ENV, value = %raw, error = %e, "Ignoring invalid retention"),
            }
        }
        if let Some(raw) = lookup(EVENT_CAPACITY_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(n) if (1..=MAX_EVENT_CAPACITY).contains(&n) => config.event_capacity = n,
                _ => tracing::warn!(key = EVENT_CAPACITY_ENV, value = %raw, "Ignoring invalid event capacity"),
            }
        }
        config
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}
