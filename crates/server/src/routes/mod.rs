//! API route handlers for the casework server.

pub mod health;
pub mod jobs;
pub mod metrics;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined router. Everything except `/metrics` lives under `/api`.
///
/// Routes:
/// - GET  /api/health - Health check
/// - GET  /api/jobs - List retained jobs (`jobType`, `entityId` filters)
/// - GET  /api/jobs/stream - SSE stream of job updates
/// - GET  /api/jobs/{id} - One job
/// - POST /api/jobs/{id}/cancel - Cancel a job
/// - GET  /api/cases/{id}/busy - Whether a case has queued or running work
/// - POST /api/cases/{id}/supersede/{aux} - Drop queued work for a sub-resource
/// - GET  /metrics - Prometheus metrics
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", jobs::router())
        .merge(metrics::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use casework_jobs::{Scheduler, SchedulerConfig};

    #[tokio::test]
    async fn test_api_routes_creation() {
        let state = AppState::new(Scheduler::new(SchedulerConfig::default()));
        let _router = api_routes(state);
    }
}
