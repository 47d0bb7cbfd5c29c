// crates/jobs/src/queue.rs
//! Per-entity FIFO queues with a single active slot.
//!
//! `pop_next` is the only place a job is admitted, which is what keeps at
//! most one job running per entity.

use std::collections::{HashMap, VecDeque};

use crate::types::JobId;

#[derive(Debug, Default)]
struct EntityQueue {
    pending: VecDeque<JobId>,
    active: Option<JobId>,
}

impl EntityQueue {
    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.active.is_none()
    }
}

/// Pending lists and active slots, keyed by entity id.
#[derive(Debug, Default)]
pub struct EntityQueues {
    queues: HashMap<String, EntityQueue>,
}

impl EntityQueues {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job to the entity's pending list.
    pub fn enqueue(&mut self, entity_id: &str, job_id: JobId) {
        self.queues
            .entry(entity_id.to_string())
            .or_default()
            .pending
            .push_back(job_id);
    }

    /// Admit the head of the pending list, unless a job is already active.
    pub fn pop_next(&mut self, entity_id: &str) -> Option<JobId> {
        let queue = self.queues.get_mut(entity_id)?;
        if queue.active.is_some() {
            return None;
        }
        let next = queue.pending.pop_front();
        queue.active = next;
        if queue.is_empty() {
            self.queues.remove(entity_id);
        }
        next
    }

    /// Remove a job that has not been admitted yet.
    pub fn remove_queued(&mut self, entity_id: &str, job_id: JobId) -> bool {
        let Some(queue) = self.queues.get_mut(entity_id) else {
            return false;
        };
        let before = queue.pending.len();
        queue.pending.retain(|id| *id != job_id);
        let removed = queue.pending.len() != before;
        if queue.is_empty() {
            self.queues.remove(entity_id);
        }
        removed
    }

    /// Release the active slot if `job_id` holds it.
    pub fn clear_active(&mut self, entity_id: &str, job_id: JobId) -> bool {
        let Some(queue) = self.queues.get_mut(entity_id) else {
            return false;
        };
        if queue.active != Some(job_id) {
            return false;
        }
        queue.active = None;
        if queue.is_empty() {
            self.queues.remove(entity_id);
        }
        true
    }

    #[cfg(test)]
    pub fn active(&self, entity_id: &str) -> Option<JobId> {
        self.queues.get(entity_id).and_then(|q| q.active)
    }

    pub fn pending(&self, entity_id: &str) -> Vec<JobId> {
        self.queues
            .get(entity_id)
            .map(|q| q.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    /// True if the entity has a queued or active job.
    pub fn is_busy(&self, entity_id: &str) -> bool {
        self.queues.get(entity_id).is_some_and(|q| !q.is_empty())
    }

    /// Number of entities with any queued or active work.
    #[cfg(test)]
    pub fn entity_count(&self) -> usize {
        self.queues.len()
    }
}
