// crates/jobs/src/scheduler.rs
//! Per-entity job scheduler.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{JobError, JobResult};
use crate::publisher::{EventPublisher, ListenerId};
use crate::queue::EntityQueues;
use crate::record::{CancelSlot, JobEntry, Work, WorkFuture};
use crate::retention;
use crate::types::{CancelHandle, Job, JobFilter, JobId, JobState, JobUpdate};

/// What a unit of work receives when its job starts running.
pub struct JobContext {
    job: Job,
    cancel: CancelSlot,
}

impl JobContext {
    /// The job record as of admission (state `running`).
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Make this job abortable through [`Scheduler::cancel`].
    ///
    /// Register before the first `.await` so a cancel issued right after
    /// admission can reach it.
    pub fn set_cancel_handle(&self, handle: impl CancelHandle + 'static) {
        self.cancel.set(Arc::new(handle));
    }

    /// Create a token, register it as this job's cancel handle, and return it.
    pub fn cancellation_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        self.set_cancel_handle(token.clone());
        token
    }
}

enum Outcome {
    Complete,
    Failed(String),
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, JobEntry>,
    queues: EntityQueues,
}

struct Inner {
    config: SchedulerConfig,
    runtime: Handle,
    next_id: AtomicU64,
    tables: Mutex<Tables>,
    publisher: EventPublisher,
    /// Purge timers that actually fired.
    #[cfg(test)]
    purge_runs: AtomicU64,
}

/// Runs asynchronous units of work, at most one at a time per entity.
///
/// Cheap to clone; clones share the same tables. All tables sit behind one
/// mutex that is never held across an `.await` or while producer code runs.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_runtime(config, Handle::current())
    }

    /// Create a scheduler that spawns work and timers on `runtime`.
    pub fn with_runtime(config: SchedulerConfig, runtime: Handle) -> Self {
        let publisher = EventPublisher::new(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                next_id: AtomicU64::new(1),
                tables: Mutex::new(Tables::default()),
                publisher,
                #[cfg(test)]
                purge_runs: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `work` for `entity_id`. See [`enqueue_with_aux`](Self::enqueue_with_aux).
    pub fn enqueue<F, Fut>(
        &self,
        entity_id: impl Into<String>,
        job_type: impl Into<String>,
        work: F,
    ) -> JobResult<JobId>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.enqueue_inner(entity_id.into(), job_type.into(), None, work)
    }

    /// Queue `work` for `entity_id`, tagged with a sub-resource key.
    ///
    /// Returns as soon as the job is recorded. If the entity is idle the job
    /// is admitted before this returns: the closure body runs synchronously on
    /// this thread and the future it returns is spawned.
    pub fn enqueue_with_aux<F, Fut>(
        &self,
        entity_id: impl Into<String>,
        job_type: impl Into<String>,
        aux_key: impl Into<String>,
        work: F,
    ) -> JobResult<JobId>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.enqueue_inner(entity_id.into(), job_type.into(), Some(aux_key.into()), work)
    }

    fn enqueue_inner<F, Fut>(
        &self,
        entity_id: String,
        job_type: String,
        aux_key: Option<String>,
        work: F,
    ) -> JobResult<JobId>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if entity_id.trim().is_empty() {
            return Err(JobError::invalid_argument("entity_id must not be empty"));
        }
        if job_type.trim().is_empty() {
            return Err(JobError::invalid_argument("job_type must not be empty"));
        }
        if aux_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(JobError::invalid_argument("aux_key must not be empty when given"));
        }

        let work: Work = Box::new(move |ctx| -> WorkFuture { Box::pin(work(ctx)) });
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            id,
            entity_id: entity_id.clone(),
            job_type,
            aux_key,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };

        {
            let mut tables = self.inner.lock();
            tables.queues.enqueue(&entity_id, id);
            self.inner.publisher.emit(job.clone());
            tables.jobs.insert(id, JobEntry::new(job, work));
        }
        metrics::counter!("scheduler_jobs_enqueued_total").increment(1);
        tracing::debug!(job_id = id, entity_id = %entity_id, "Job queued");

        self.inner.advance(&entity_id);
        self.inner.publisher.flush();
        Ok(id)
    }

    /// Cancel one job.
    ///
    /// A queued job is removed and marked `canceled`. A running job is
    /// canceled only if its unit of work registered a cancel handle; without
    /// one this returns false and the job is left to finish on its own.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let (canceled, handle) = {
            let mut tables = self.inner.lock();
            let Tables { jobs, queues } = &mut *tables;
            let Some(entry) = jobs.get_mut(&job_id) else {
                return false;
            };
            match entry.job.state {
                JobState::Queued => {
                    queues.remove_queued(&entry.job.entity_id, job_id);
                    self.inner.finish_locked(entry, JobState::Canceled, None);
                    (true, None)
                }
                JobState::Running => match entry.cancel.take_for_cancel() {
                    Some(handle) => {
                        let entity_id = entry.job.entity_id.clone();
                        self.inner.finish_locked(entry, JobState::Canceled, None);
                        queues.clear_active(&entity_id, job_id);
                        (true, Some((handle, entity_id)))
                    }
                    None => {
                        tracing::debug!(job_id, "Running job has no cancel handle; leaving it to finish");
                        (false, None)
                    }
                },
                _ => (false, None),
            }
        };

        if let Some((handle, entity_id)) = handle {
            handle.cancel();
            self.inner.advance(&entity_id);
        }
        if canceled {
            tracing::debug!(job_id, "Job canceled");
        }
        self.inner.publisher.flush();
        canceled
    }

    /// Cancel still-queued jobs for `entity_id` tagged with `aux_key`.
    ///
    /// Used when a newer request for the same sub-resource supersedes an
    /// older one that has not started. Running jobs are untouched.
    pub fn cancel_queued_by_aux(&self, entity_id: &str, aux_key: &str) -> bool {
        let count = {
            let mut tables = self.inner.lock();
            let Tables { jobs, queues } = &mut *tables;
            let mut count = 0;
            for id in queues.pending(entity_id) {
                let Some(entry) = jobs.get_mut(&id) else {
                    continue;
                };
                if entry.job.aux_key.as_deref() != Some(aux_key) {
                    continue;
                }
                queues.remove_queued(entity_id, id);
                self.inner.finish_locked(entry, JobState::Canceled, None);
                count += 1;
            }
            count
        };

        if count > 0 {
            tracing::debug!(entity_id, aux_key, count, "Superseded queued jobs");
        }
        self.inner.publisher.flush();
        count > 0
    }

    /// True if a job is queued or running for `entity_id`.
    pub fn is_entity_busy(&self, entity_id: &str) -> bool {
        let mut tables = self.inner.lock();
        self.inner.sweep_locked(&mut tables);
        tables.queues.is_busy(entity_id)
    }

    /// Snapshot of all retained jobs matching `filter`, oldest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let mut tables = self.inner.lock();
        self.inner.sweep_locked(&mut tables);
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|entry| filter.matches(&entry.job))
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// Snapshot of one job, if it is still retained.
    pub fn get_job(&self, job_id: JobId) -> Option<Job> {
        let mut tables = self.inner.lock();
        self.inner.sweep_locked(&mut tables);
        tables.jobs.get(&job_id).map(|entry| entry.job.clone())
    }

    /// Number of retained job records, after a lazy sweep.
    pub fn retained_count(&self) -> usize {
        let mut tables = self.inner.lock();
        self.inner.sweep_locked(&mut tables);
        tables.jobs.len()
    }

    /// Purge every finished job older than the retention window now.
    /// Returns how many records were removed.
    pub fn sweep(&self) -> usize {
        let mut tables = self.inner.lock();
        self.inner.sweep_locked(&mut tables)
    }

    /// Register a synchronous listener for every job update.
    pub fn on_update<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&JobUpdate) + Send + Sync + 'static,
    {
        self.inner.publisher.on_update(listener)
    }

    pub fn off_update(&self, id: ListenerId) -> bool {
        self.inner.publisher.off_update(id)
    }

    /// Subscribe to every job update as an async stream (for SSE).
    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.inner.publisher.subscribe()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Scheduler table mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Admit the next queued job for `entity_id`, if the entity is idle.
    fn advance(self: &Arc<Self>, entity_id: &str) {
        let admitted = {
            let mut tables = self.lock();
            let Tables { jobs, queues } = &mut *tables;
            loop {
                let Some(id) = queues.pop_next(entity_id) else {
                    break None;
                };
                let Some(entry) = jobs.get_mut(&id) else {
                    tracing::error!(job_id = id, entity_id, "Queued job missing from table");
                    queues.clear_active(entity_id, id);
                    continue;
                };
                let Some(work) = entry.work.take() else {
                    tracing::error!(job_id = id, entity_id, "Queued job has no unit of work");
                    queues.clear_active(entity_id, id);
                    continue;
                };
                entry.transition(JobState::Running, None);
                self.publisher.emit(entry.job.clone());
                let ctx = JobContext {
                    job: entry.job.clone(),
                    cancel: entry.cancel.clone(),
                };
                break Some((id, work, ctx));
            }
        };

        if let Some((id, work, ctx)) = admitted {
            tracing::debug!(job_id = id, entity_id, job_type = %ctx.job.job_type, "Job running");
            self.launch(id, entity_id.to_string(), work, ctx);
        }
    }

    /// Run the producer closure, then drive its future to a terminal state.
    fn launch(self: &Arc<Self>, id: JobId, entity_id: String, work: Work, ctx: JobContext) {
        let future = match catch_unwind(AssertUnwindSafe(|| work(ctx))) {
            Ok(future) => future,
            Err(_) => {
                self.settle(id, &entity_id, Outcome::Failed("unit of work panicked".to_string()));
                return;
            }
        };
        let run = self.runtime.spawn(future);
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let outcome = match run.await {
                Ok(Ok(())) => Outcome::Complete,
                Ok(Err(e)) => Outcome::Failed(format!("{e:#}")),
                Err(e) if e.is_panic() => Outcome::Failed("unit of work panicked".to_string()),
                Err(e) => Outcome::Failed(format!("unit of work aborted: {e}")),
            };
            inner.settle(id, &entity_id, outcome);
        });
    }

    /// Record the unit of work's result, release the slot, and start the next job.
    fn settle(self: &Arc<Self>, id: JobId, entity_id: &str, outcome: Outcome) {
        {
            let mut tables = self.lock();
            let Tables { jobs, queues } = &mut *tables;
            if let Some(entry) = jobs.get_mut(&id) {
                if entry.job.state == JobState::Running {
                    match outcome {
                        Outcome::Complete => {
                            tracing::debug!(job_id = id, entity_id, "Job complete");
                            self.finish_locked(entry, JobState::Complete, None);
                        }
                        Outcome::Failed(error) => {
                            tracing::warn!(job_id = id, entity_id, error = %error, "Job failed");
                            self.finish_locked(entry, JobState::Failed, Some(error));
                        }
                    }
                } else {
                    // Canceled while running; the work has now wound down.
                    tracing::debug!(job_id = id, state = %entry.job.state, "Late result ignored");
                }
            }
            queues.clear_active(entity_id, id);
        }

        self.advance(entity_id);
        self.publisher.flush();
    }

    /// Terminal transition: stamp, emit, arm the retention timer.
    fn finish_locked(self: &Arc<Self>, entry: &mut JobEntry, state: JobState, error: Option<String>) {
        if !entry.transition(state, error) {
            return;
        }
        self.publisher.emit(entry.job.clone());

        let id = entry.job.id;
        let weak: Weak<Inner> = Arc::downgrade(self);
        let timer = retention::spawn_purge(&self.runtime, self.config.retention, move || {
            if let Some(inner) = weak.upgrade() {
                inner.purge(id);
            }
        });
        entry.set_purge_timer(timer);
    }

    fn purge(&self, id: JobId) {
        #[cfg(test)]
        self.purge_runs.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.lock();
        let terminal = tables
            .jobs
            .get(&id)
            .is_some_and(|entry| entry.job.state.is_terminal());
        if terminal {
            tables.jobs.remove(&id);
            tracing::debug!(job_id = id, "Purged retained job");
        }
    }

    fn sweep_locked(&self, tables: &mut Tables) -> usize {
        let now = Instant::now();
        let retention = self.config.retention;
        let expired: Vec<JobId> = tables
            .jobs
            .iter()
            .filter(|(_, entry)| {
                entry
                    .finished()
                    .is_some_and(|finished| retention::is_expired(finished, retention, now))
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(mut entry) = tables.jobs.remove(id) {
                entry.cancel_purge_timer();
            }
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Swept expired jobs");
        }
        expired.len()
    }
}
