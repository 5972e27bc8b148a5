//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Recording still works; the
/// macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

/// Router serving the Prometheus text format on `/metrics`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}

fn describe() {
    // -- Swaps --
    describe_counter!(
        "zoomux_swap_total",
        "Swap attempts by outcome (success or error code)"
    );
    describe_histogram!(
        "zoomux_swap_duration_seconds",
        "Wall-clock duration of swap attempts (check + terminate + cooldown + launch + verify)"
    );
    describe_counter!(
        "zoomux_backend_exits_total",
        "Active backends that exited without being asked to"
    );
    describe_gauge!(
        "zoomux_active_model",
        "1 for the model whose backend is currently active, 0 otherwise"
    );

    // -- Requests --
    describe_counter!(
        "zoomux_requests_total",
        "Requests passed through the gate, by outcome"
    );
    describe_histogram!(
        "zoomux_request_wait_seconds",
        "Time a request waited for its model to become active"
    );
}
