//! Metrics definitions for the auth proxy.
//!
//! All metrics follow Prometheus naming conventions:
//! - `auth_proxy_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `method`: HTTP methods seen by the proxy (unknown methods collapse to "OTHER")
//! - `status`: 3 values (success, error, timeout)
//! - `outcome`: 3 values (redirect, forbidden, proceed)
//! - `result`: "success" or an `AuthError` kind
//!
//! Claim values, key identifiers and paths are never used as labels.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Proxied requests include backend latency, so the tail reaches the backend timeout
        .set_buckets_for_metric(
            Matcher::Prefix("auth_proxy_http_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
                30.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("auth_proxy_keyset_fetch".to_string()),
            &[0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000],
        )
        .map_err(|e| format!("Failed to set keyset fetch buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion
///
/// Metric: `auth_proxy_http_requests_total`, `auth_proxy_http_request_duration_seconds`
/// Labels: `method`, `status_code` / `status`
pub fn record_http_request(method: &str, status_code: u16, duration: Duration) {
    let method = normalize_method(method);
    let status = categorize_status_code(status_code);

    histogram!("auth_proxy_http_request_duration_seconds",
        "method" => method,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("auth_proxy_http_requests_total",
        "method" => method,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

/// Categorize HTTP status code into success/error/timeout.
///
/// The gate's redirect counts as success; it is the expected answer for an
/// unauthenticated browser.
fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=399 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Proxied traffic can carry arbitrary extension methods.
fn normalize_method(method: &str) -> &'static str {
    match method {
        "GET" => "GET",
        "HEAD" => "HEAD",
        "POST" => "POST",
        "PUT" => "PUT",
        "PATCH" => "PATCH",
        "DELETE" => "DELETE",
        "OPTIONS" => "OPTIONS",
        _ => "OTHER",
    }
}

// ============================================================================
// Auth Metrics
// ============================================================================

/// Record the auth gate's decision for one request.
///
/// Metric: `auth_proxy_gate_outcomes_total`
/// Labels: `outcome` (redirect, forbidden, proceed)
pub fn record_gate_outcome(outcome: &'static str) {
    counter!("auth_proxy_gate_outcomes_total", "outcome" => outcome).increment(1);
}

/// Record a token verification result.
///
/// Metric: `auth_proxy_token_verifications_total`
/// Labels: `result` ("success" or the failure kind)
pub fn record_token_verification(result: &'static str) {
    counter!("auth_proxy_token_verifications_total", "result" => result).increment(1);
}

/// Record a keyset fetch attempt.
///
/// Metric: `auth_proxy_keyset_refreshes_total`, `auth_proxy_keyset_fetch_duration_seconds`
/// Labels: `status` (success, error)
pub fn record_keyset_refresh(status: &'static str, duration: Duration) {
    histogram!("auth_proxy_keyset_fetch_duration_seconds", "status" => status)
        .record(duration.as_secs_f64());
    counter!("auth_proxy_keyset_refreshes_total", "status" => status).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests execute the recording functions against the global no-op
    // recorder; they exercise the code paths without asserting on values.

    #[test]
    fn test_record_http_request() {
        record_http_request("GET", 200, Duration::from_millis(5));
        record_http_request("POST", 302, Duration::from_millis(2));
        record_http_request("GET", 403, Duration::from_millis(1));
        record_http_request("PROPFIND", 502, Duration::from_millis(40));
        record_http_request("GET", 504, Duration::from_secs(30));
    }

    #[test]
    fn test_categorize_status_code() {
        assert_eq!(categorize_status_code(200), "success");
        assert_eq!(categorize_status_code(204), "success");
        assert_eq!(categorize_status_code(302), "success");
        assert_eq!(categorize_status_code(304), "success");
        assert_eq!(categorize_status_code(403), "error");
        assert_eq!(categorize_status_code(502), "error");
        assert_eq!(categorize_status_code(408), "timeout");
        assert_eq!(categorize_status_code(504), "timeout");
    }

    #[test]
    fn test_normalize_method() {
        assert_eq!(normalize_method("GET"), "GET");
        assert_eq!(normalize_method("DELETE"), "DELETE");
        assert_eq!(normalize_method("PROPFIND"), "OTHER");
        assert_eq!(normalize_method("get"), "OTHER");
    }

    #[test]
    fn test_record_auth_metrics() {
        record_gate_outcome("redirect");
        record_gate_outcome("forbidden");
        record_gate_outcome("proceed");
        record_token_verification("success");
        record_token_verification("unknown_key");
        record_keyset_refresh("success", Duration::from_millis(30));
        record_keyset_refresh("error", Duration::from_secs(10));
    }
}
