// crates/jobs/src/types.rs
//! Types for the per-case job scheduler.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Unique identifier for a scheduled job.
pub type JobId = u64;

/// Lifecycle state of a job.
///
/// `Queued` and `Running` are the only non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Complete,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Canceled)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Canceled)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Canceled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one job record, as handed to listeners and API consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub entity_id: String,
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_key: Option<String>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message, set only when `state == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One lifecycle transition, as published to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    /// Publisher-wide sequence number, strictly increasing in emission order.
    pub seq: u64,
    pub job: Job,
}

/// Optional filters for [`crate::Scheduler::list_jobs`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    pub job_type: Option<String>,
    pub entity_id: Option<String>,
}

impl JobFilter {
    pub fn job_type(job_type: impl Into<String>) -> Self {
        Self {
            job_type: Some(job_type.into()),
            entity_id: None,
        }
    }

    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            job_type: None,
            entity_id: Some(entity_id.into()),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.job_type.as_deref().map_or(true, |t| t == job.job_type)
            && self.entity_id.as_deref().map_or(true, |e| e == job.entity_id)
    }
}

/// Capability to abort a running unit of work.
///
/// Attached to a running job through [`crate::JobContext::set_cancel_handle`].
/// `cancel` must not block; it only signals.
pub trait CancelHandle: Send + Sync {
    fn cancel(&self);
}

impl CancelHandle for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self);
    }
}

impl<F> CancelHandle for F
where
    F: Fn() + Send + Sync,
{
    fn cancel(&self) {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_strings() {
        assert_eq!(JobState::Queued.as_str(), "queued");
        assert_eq!(JobState::Running.as_str(), "running");
        assert_eq!(JobState::Complete.as_str(), "complete");
        assert_eq!(JobState::Failed.as_str(), "failed");
        assert_eq!(JobState::Canceled.to_string(), "canceled");
    }

    #[test]
    fn test_lifecycle_edges() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Canceled));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(!JobState::Queued.can_transition_to(JobState::Complete));
        assert!(!JobState::Running.can_transition_to(JobState::Queued));
        assert!(!JobState::Complete.can_transition_to(JobState::Canceled));
        assert!(!JobState::Canceled.can_transition_to(JobState::Canceled));
    }

    #[test]
    fn test_filter_matches() {
        let job = Job {
            id: 7,
            entity_id: "case-1".into(),
            job_type: "violation-analysis".into(),
            aux_key: None,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::entity("case-1").matches(&job));
        assert!(!JobFilter::entity("case-2").matches(&job));
        assert!(JobFilter::job_type("violation-analysis").matches(&job));
        assert!(!JobFilter::job_type("image-analysis").matches(&job));
    }

    #[test]
    fn test_job_serialize() {
        let job = Job {
            id: 1,
            entity_id: "case-1".into(),
            job_type: "image-analysis".into(),
            aux_key: Some("photoA".into()),
            state: JobState::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
            error: None,
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"entityId\":\"case-1\""));
        assert!(json.contains("\"auxKey\":\"photoA\""));
        assert!(json.contains("\"state\":\"running\""));
        assert!(!json.contains("finishedAt"));
    }

    #[test]
    fn test_closure_cancel_handle() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        let handle: Arc<dyn CancelHandle> = Arc::new(move || flag.store(true, Ordering::SeqCst));
        handle.cancel();
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_token_cancel_handle() {
        let token = CancellationToken::new();
        let handle: Box<dyn CancelHandle> = Box::new(token.clone());
        handle.cancel();
        assert!(token.is_cancelled());
    }
}
