//! Prometheus metrics endpoint handler.
//!
//! # Security
//!
//! This endpoint is not behind the auth gate so Prometheus can scrape it.
//! Metric labels are bounded and carry no identity or token data.

use axum::{extract::State, response::IntoResponse};
use metrics_exporter_prometheus::PrometheusHandle;

/// Handler for GET /-/metrics
///
/// Returns Prometheus-formatted metrics for scraping:
/// ```text
/// # TYPE auth_proxy_gate_outcomes_total counter
/// auth_proxy_gate_outcomes_total{outcome="proceed"} 42
/// ```
#[tracing::instrument(skip_all, name = "proxy.metrics.scrape")]
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}
