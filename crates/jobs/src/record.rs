// crates/jobs/src/record.rs
//! Mutable record for a single job, owned by the scheduler's table.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::types::{CancelHandle, Job, JobState};

pub(crate) type WorkFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub(crate) type Work = Box<dyn FnOnce(crate::JobContext) -> WorkFuture + Send>;

#[derive(Default)]
struct SlotInner {
    handle: Option<Arc<dyn CancelHandle>>,
    requested: bool,
}

/// Where a running unit of work parks its cancel handle.
///
/// Shared between the table entry and the job's [`crate::JobContext`], so
/// registering a handle never touches the scheduler lock.
#[derive(Clone, Default)]
pub(crate) struct CancelSlot(Arc<Mutex<SlotInner>>);

impl CancelSlot {
    /// Store a handle. If cancellation was already requested, fire it now.
    pub(crate) fn set(&self, handle: Arc<dyn CancelHandle>) {
        let fire = match self.0.lock() {
            Ok(mut slot) => {
                if slot.requested {
                    true
                } else {
                    slot.handle = Some(Arc::clone(&handle));
                    false
                }
            }
            Err(e) => {
                tracing::error!("Mutex poisoned writing cancel slot: {e}");
                false
            }
        };
        if fire {
            handle.cancel();
        }
    }

    /// Take the handle for a cancellation request, if one is registered.
    pub(crate) fn take_for_cancel(&self) -> Option<Arc<dyn CancelHandle>> {
        let Ok(mut slot) = self.0.lock() else {
            tracing::error!("Mutex poisoned reading cancel slot");
            return None;
        };
        let handle = slot.handle.take()?;
        slot.requested = true;
        Some(handle)
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut slot) = self.0.lock() {
            slot.handle = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_set(&self) -> bool {
        self.0.lock().map(|s| s.handle.is_some()).unwrap_or(false)
    }
}

pub(crate) struct JobEntry {
    pub(crate) job: Job,
    /// Present while queued; taken on admission.
    pub(crate) work: Option<Work>,
    pub(crate) cancel: CancelSlot,
    started: Option<Instant>,
    finished: Option<Instant>,
    purge_timer: Option<AbortHandle>,
}

impl JobEntry {
    pub(crate) fn new(job: Job, work: Work) -> Self {
        Self {
            job,
            work: Some(work),
            cancel: CancelSlot::default(),
            started: None,
            finished: None,
            purge_timer: None,
        }
    }

    /// Move along one edge of the lifecycle graph, stamping timestamps.
    ///
    /// Returns false (and changes nothing) for an edge the graph does not have.
    pub(crate) fn transition(&mut self, next: JobState, error: Option<String>) -> bool {
        let current = self.job.state;
        if !current.can_transition_to(next) {
            tracing::warn!(
                job_id = self.job.id,
                from = %current,
                to = %next,
                "Rejected invalid job transition"
            );
            return false;
        }

        self.job.state = next;
        match next {
            JobState::Running => {
                self.job.started_at = Some(Utc::now());
                self.started = Some(Instant::now());
            }
            _ => {
                self.job.finished_at = Some(Utc::now());
                self.finished = Some(Instant::now());
                self.job.error = error;
                self.work = None;
                self.cancel.clear();
                if let Some(started) = self.started {
                    metrics::histogram!("scheduler_job_run_seconds", "job_type" => self.job.job_type.clone())
                        .record(started.elapsed().as_secs_f64());
                }
            }
        }
        metrics::counter!("scheduler_job_transitions_total", "state" => next.as_str()).increment(1);
        true
    }

    pub(crate) fn finished(&self) -> Option<Instant> {
        self.finished
    }

    pub(crate) fn set_purge_timer(&mut self, timer: AbortHandle) {
        if let Some(stale) = self.purge_timer.replace(timer) {
            stale.abort();
        }
    }

    /// Abort any pending purge timer; used when the record is purged early.
    pub(crate) fn cancel_purge_timer(&mut self) {
        if let Some(timer) = self.purge_timer.take() {
            timer.abort();
        }
    }
}
