//! Application metrics for Prometheus monitoring.
//!
//! The scheduler records its counters and histograms through the `metrics`
//! facade; this module installs the Prometheus recorder that collects them
//! and renders the `/metrics` payload.

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Call once at startup, before the scheduler records anything.
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("Failed to set global metrics recorder (already set)");
        return false;
    }

    if PROMETHEUS_HANDLE.set(handle).is_err() {
        tracing::warn!("Failed to store Prometheus handle (already set)");
    }

    describe_metrics();

    tracing::info!("Prometheus metrics initialized");
    true
}

/// Describe the scheduler metrics for Prometheus.
fn describe_metrics() {
    describe_counter!(
        "scheduler_jobs_enqueued_total",
        "Total number of jobs accepted by the scheduler"
    );
    describe_counter!(
        "scheduler_job_transitions_total",
        "Job lifecycle transitions, by target state"
    );
    describe_histogram!(
        "scheduler_job_run_seconds",
        "Time from admission to a terminal state, by job type"
    );
}

/// Render current metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}
