// crates/server/src/lib.rs
//! Casework server library.
//!
//! Axum HTTP adapter over [`casework_jobs::Scheduler`]: JSON listing and
//! cancellation endpoints, an SSE stream of job updates, and Prometheus
//! metrics.

pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::*;
pub use metrics::{init_metrics, render_metrics};
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the Axum application with all routes and middleware.
///
/// This sets up:
/// - API routes (health, jobs, metrics)
/// - CORS for development (allows any origin)
/// - Request tracing
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
