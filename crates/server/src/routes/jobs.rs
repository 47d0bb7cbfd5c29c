// crates/server/src/routes/jobs.rs
//! API routes for background job management.
//!
//! - GET  /jobs                 - List retained jobs (filter: `jobType`, `entityId`)
//! - GET  /jobs/stream          - SSE stream of job updates (same filters)
//! - GET  /jobs/{id}            - One job
//! - POST /jobs/{id}/cancel     - Cancel a queued or cancelable running job
//! - GET  /cases/{id}/busy      - Whether a case has queued or running work
//! - POST /cases/{id}/supersede/{aux} - Drop queued work for one sub-resource

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use casework_jobs::{Job, JobFilter, JobId};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Interval between SSE keep-alive comments.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct CancelResponse {
    pub job_id: JobId,
    pub canceled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct BusyResponse {
    pub entity_id: String,
    pub busy: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct SupersedeResponse {
    pub entity_id: String,
    pub aux_key: String,
    pub canceled: bool,
}

/// GET /api/jobs - List retained jobs.
async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<JobFilter>,
) -> Json<Vec<Job>> {
    Json(state.jobs.list_jobs(&filter))
}

/// GET /api/jobs/{id} - One job, or 404 once purged.
async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<JobId>) -> ApiResult<Json<Job>> {
    state.jobs.get_job(id).map(Json).ok_or(ApiError::JobNotFound(id))
}

/// POST /api/jobs/{id}/cancel - `canceled: false` means the job had already
/// finished, or is running without a cancel handle.
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<CancelResponse>> {
    if state.jobs.get_job(id).is_none() {
        return Err(ApiError::JobNotFound(id));
    }
    let canceled = state.jobs.cancel(id);
    tracing::info!(job_id = id, canceled, "Cancel requested over HTTP");
    Ok(Json(CancelResponse { job_id: id, canceled }))
}

/// GET /api/cases/{id}/busy
async fn entity_busy(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Json<BusyResponse> {
    let busy = state.jobs.is_entity_busy(&entity_id);
    Json(BusyResponse { entity_id, busy })
}

/// POST /api/cases/{id}/supersede/{aux}
async fn supersede_queued(
    State(state): State<Arc<AppState>>,
    Path((entity_id, aux_key)): Path<(String, String)>,
) -> Json<SupersedeResponse> {
    let canceled = state.jobs.cancel_queued_by_aux(&entity_id, &aux_key);
    Json(SupersedeResponse {
        entity_id,
        aux_key,
        canceled,
    })
}

fn listing_event(jobs: &[Job]) -> Event {
    Event::default()
        .event("jobs")
        .data(serde_json::to_string(jobs).unwrap_or_default())
}

/// GET /api/jobs/stream - SSE stream of job updates.
///
/// # Events
///
/// | Event name | When emitted                                  |
/// |------------|-----------------------------------------------|
/// | `jobs`     | On connect, and when the client lags behind   |
/// | `update`   | Every lifecycle transition matching the filter |
///
/// Keep-alive comments go out every 15 seconds. The stream ends when the
/// client disconnects.
async fn stream_jobs(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<JobFilter>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before the snapshot so no transition falls between them.
    let mut rx = state.jobs.subscribe();
    let jobs = state.jobs.clone();

    let stream = async_stream::stream! {
        yield Ok(listing_event(&jobs.list_jobs(&filter)));

        loop {
            match rx.recv().await {
                Ok(update) => {
                    if !filter.matches(&update.job) {
                        continue;
                    }
                    let data = serde_json::to_string(&update.job).unwrap_or_default();
                    yield Ok(Event::default()
                        .event("update")
                        .id(update.seq.to_string())
                        .data(data));
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Job SSE client lagged by {} updates, re-sending listing", n);
                    yield Ok(listing_event(&jobs.list_jobs(&filter)));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

/// Build the jobs router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/stream", get(stream_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/cases/{id}/busy", get(entity_busy))
        .route("/cases/{id}/supersede/{aux}", post(supersede_queued))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use casework_jobs::{JobState, Scheduler, SchedulerConfig};
    use tower::ServiceExt;

    fn test_app() -> (Router, Scheduler) {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let app = router().with_state(AppState::new(scheduler.clone()));
        (app, scheduler)
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_list_jobs_empty() {
        let (app, _) = test_app();
        let (status, json) = send(app, "GET", "/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_jobs_filters() {
        let (app, scheduler) = test_app();
        scheduler
            .enqueue("case-1", "image-analysis", |_ctx| async { Ok(()) })
            .unwrap();
        scheduler
            .enqueue("case-2", "violation-analysis", |_ctx| async { Ok(()) })
            .unwrap();

        let (status, json) = send(app.clone(), "GET", "/jobs?entityId=case-2").await;
        assert_eq!(status, StatusCode::OK);
        let jobs = json.as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["entityId"], "case-2");

        let (_, json) = send(app, "GET", "/jobs?jobType=image-analysis").await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["jobType"], "image-analysis");
    }

    #[tokio::test]
    async fn test_get_job_not_found() {
        let (app, _) = test_app();
        let (status, json) = send(app, "GET", "/jobs/99").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "Job not found");
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let (app, scheduler) = test_app();
        let (_release, release_rx) = tokio::sync::oneshot::channel::<()>();
        scheduler
            .enqueue("case-1", "image-analysis", move |_ctx| async move {
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();
        let queued = scheduler
            .enqueue("case-1", "image-analysis", |_ctx| async { Ok(()) })
            .unwrap();

        let (status, json) = send(app.clone(), "POST", &format!("/jobs/{queued}/cancel")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["canceled"], true);
        assert_eq!(scheduler.get_job(queued).unwrap().state, JobState::Canceled);

        let (_, json) = send(app, "POST", &format!("/jobs/{queued}/cancel")).await;
        assert_eq!(json["canceled"], false);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let (app, _) = test_app();
        let (status, _) = send(app, "POST", "/jobs/7/cancel").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_busy_and_supersede() {
        let (app, scheduler) = test_app();
        let (_release, release_rx) = tokio::sync::oneshot::channel::<()>();
        scheduler
            .enqueue("case-1", "image-analysis", move |_ctx| async move {
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();
        let stale = scheduler
            .enqueue_with_aux("case-1", "image-analysis", "photoA", |_ctx| async { Ok(()) })
            .unwrap();

        let (_, json) = send(app.clone(), "GET", "/cases/case-1/busy").await;
        assert_eq!(json["busy"], true);
        let (_, json) = send(app.clone(), "GET", "/cases/case-9/busy").await;
        assert_eq!(json["busy"], false);

        let (status, json) = send(app, "POST", "/cases/case-1/supersede/photoA").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["canceled"], true);
        assert_eq!(scheduler.get_job(stale).unwrap().state, JobState::Canceled);
    }
}
