// crates/jobs/src/publisher.rs
//! Fan-out of job lifecycle updates.
//!
//! Two kinds of consumers:
//! - async subscribers via [`EventPublisher::subscribe`] (SSE streams), fed
//!   through a `tokio::sync::broadcast` channel
//! - synchronous listeners via [`EventPublisher::on_update`], called in
//!   emission order by whichever thread drains the outbox
//!
//! The scheduler calls `emit` while holding its table lock (so sequence
//! numbers follow transition order) and `flush` after releasing it (so
//! listeners may call back into the scheduler).

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;

use crate::config::MAX_EVENT_CAPACITY;
use crate::types::{Job, JobUpdate};

/// Identifies a registered listener for [`EventPublisher::off_update`].
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&JobUpdate) + Send + Sync>;

#[derive(Default)]
struct Outbox {
    pending: VecDeque<JobUpdate>,
    draining: bool,
}

pub struct EventPublisher {
    next_seq: AtomicU64,
    next_listener_id: AtomicU64,
    tx: broadcast::Sender<JobUpdate>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    outbox: Mutex<Outbox>,
}

impl EventPublisher {
    /// Create a publisher whose async subscribers buffer up to `capacity` updates,
    /// clamped to `1..=MAX_EVENT_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.clamp(1, MAX_EVENT_CAPACITY));
        Self {
            next_seq: AtomicU64::new(1),
            next_listener_id: AtomicU64::new(1),
            tx,
            listeners: RwLock::new(Vec::new()),
            outbox: Mutex::new(Outbox::default()),
        }
    }

    /// Subscribe to all updates as an async stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.tx.subscribe()
    }

    /// Register a synchronous listener.
    pub fn on_update<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&JobUpdate) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        match self.listeners.write() {
            Ok(mut guard) => guard.push((id, Arc::new(listener))),
            Err(e) => tracing::error!("RwLock poisoned writing listeners: {e}"),
        }
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off_update(&self, id: ListenerId) -> bool {
        match self.listeners.write() {
            Ok(mut guard) => {
                let before = guard.len();
                guard.retain(|(lid, _)| *lid != id);
                guard.len() != before
            }
            Err(e) => {
                tracing::error!("RwLock poisoned writing listeners: {e}");
                false
            }
        }
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|g| g.len()).unwrap_or(0)
    }

    /// Record one update. Broadcast subscribers see it immediately; listeners
    /// see it on the next [`flush`](Self::flush).
    pub fn emit(&self, job: Job) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let update = JobUpdate { seq, job };
        // No subscribers is fine.
        let _ = self.tx.send(update.clone());
        match self.outbox.lock() {
            Ok(mut outbox) => outbox.pending.push_back(update),
            Err(e) => tracing::error!("Mutex poisoned writing outbox: {e}"),
        }
        seq
    }

    /// Deliver queued updates to listeners, in order.
    ///
    /// Only one thread drains at a time; a reentrant or concurrent call
    /// returns immediately and the active drainer picks up its updates.
    pub fn flush(&self) {
        loop {
            let update = {
                let Ok(mut outbox) = self.outbox.lock() else {
                    tracing::error!("Mutex poisoned reading outbox");
                    return;
                };
                if outbox.draining {
                    return;
                }
                match outbox.pending.pop_front() {
                    Some(update) => {
                        outbox.draining = true;
                        update
                    }
                    None => return,
                }
            };

            self.deliver(&update);

            match self.outbox.lock() {
                Ok(mut outbox) => outbox.draining = false,
                Err(e) => {
                    tracing::error!("Mutex poisoned releasing outbox: {e}");
                    return;
                }
            }
        }
    }

    fn deliver(&self, update: &JobUpdate) {
        let listeners: Vec<(ListenerId, Listener)> = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading listeners: {e}");
                return;
            }
        };
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(update))).is_err() {
                tracing::warn!(
                    listener_id = id,
                    job_id = update.job.id,
                    state = %update.job.state,
                    "Job update listener panicked"
                );
            }
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobState;
    use chrono::Utc;

    fn job(id: u64, state: JobState) -> Job {
        Job {
            id,
            entity_id: "case-1".into(),
            job_type: "test".into(),
            aux_key: None,
            state,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    #[test]
    fn test_listeners_receive_in_order() {
        let publisher = EventPublisher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        publisher.on_update(move |u| sink.lock().unwrap().push((u.seq, u.job.state)));

        publisher.emit(job(1, JobState::Queued));
        publisher.emit(job(1, JobState::Running));
        assert!(seen.lock().unwrap().is_empty());

        publisher.flush();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, JobState::Queued), (2, JobState::Running)]
        );
    }

    #[test]
    fn test_off_update() {
        let publisher = EventPublisher::default();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = publisher.on_update(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(publisher.listener_count(), 1);

        publisher.emit(job(1, JobState::Queued));
        publisher.flush();
        assert!(publisher.off_update(id));
        assert!(!publisher.off_update(id));

        publisher.emit(job(1, JobState::Canceled));
        publisher.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let publisher = EventPublisher::default();
        let count = Arc::new(AtomicU64::new(0));
        publisher.on_update(|_| panic!("listener bug"));
        let c = Arc::clone(&count);
        publisher.on_update(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        publisher.emit(job(1, JobState::Queued));
        publisher.emit(job(2, JobState::Queued));
        publisher.flush();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reentrant_emit_is_delivered_after_current() {
        let publisher = Arc::new(EventPublisher::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner = Arc::clone(&publisher);
        let sink = Arc::clone(&seen);
        publisher.on_update(move |u| {
            sink.lock().unwrap().push(u.job.id);
            if u.job.id == 1 {
                inner.emit(job(2, JobState::Queued));
                inner.flush();
            }
        });

        publisher.emit(job(1, JobState::Queued));
        publisher.flush();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_capacity_is_clamped() {
        let publisher = EventPublisher::new(usize::MAX);
        publisher.emit(job(1, JobState::Queued));

        let publisher = EventPublisher::new(0);
        publisher.emit(job(1, JobState::Queued));
    }

    #[tokio::test]
    async fn test_subscribe() {
        let publisher = EventPublisher::default();
        let mut rx = publisher.subscribe();

        publisher.emit(job(3, JobState::Running));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.job.id, 3);
        assert_eq!(update.job.state, JobState::Running);
        assert_eq!(update.seq, 1);
    }
}
