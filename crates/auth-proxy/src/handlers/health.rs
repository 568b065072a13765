//! Health check handlers.
//!
//! Both probes live under the operational prefix and bypass the auth gate.

use crate::auth::KeysetCache;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

/// Liveness probe handler.
///
/// Returns 200 OK as long as the process can serve requests. Does not touch
/// the identity provider, so a keyset outage never restarts the proxy.
pub async fn health_check() -> &'static str {
    "OK"
}

/// Readiness probe response.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// "ready" or "not_ready".
    pub status: &'static str,

    /// Keyset availability ("available" or "unavailable").
    pub keyset: &'static str,

    /// Number of usable keys when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<usize>,

    /// Generic error message, without provider details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Readiness probe handler.
///
/// The proxy can only admit requests once it holds a keyset, so readiness
/// obtains one through the cache. A cold cache triggers the first fetch.
///
/// # Response
///
/// - 200 OK when a keyset is cached or was just fetched
/// - 503 Service Unavailable when the keyset cannot be obtained
#[tracing::instrument(skip_all, name = "proxy.health.ready")]
pub async fn readiness_check(
    State(keyset): State<Arc<KeysetCache>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    match keyset.get_keyset().await {
        Ok(keys) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                keyset: "available",
                keys: Some(keys.len()),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(target: "proxy.auth.keyset", error_kind = e.kind(), "Readiness check failed: keyset unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    status: "not_ready",
                    keyset: "unavailable",
                    keys: None,
                    error: Some("Identity provider keys unavailable".to_string()),
                }),
            )
        }
    }
}
