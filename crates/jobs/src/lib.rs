// crates/jobs/src/lib.rs
//! Per-case background job scheduler.
//!
//! Provides:
//! - `Scheduler` - accepts units of work and runs them one at a time per entity
//! - `JobContext` - what a running unit of work sees; registers cancel handles
//! - `EventPublisher` - fan-out of lifecycle updates to listeners and SSE streams
//! - `SchedulerConfig` - retention window and broadcast capacity
//!
//! State lives in memory only. Nothing is retried automatically: a producer
//! that wants a retry enqueues again.

pub mod config;
pub mod error;
pub mod publisher;
pub mod queue;
mod record;
mod retention;
pub mod scheduler;
pub mod types;

pub use config::SchedulerConfig;
pub use error::{JobError, JobResult};
pub use publisher::{EventPublisher, ListenerId};
pub use scheduler::{JobContext, Scheduler};
pub use types::{CancelHandle, Job, JobFilter, JobId, JobState, JobUpdate};
