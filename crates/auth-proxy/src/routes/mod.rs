//! HTTP routes for the auth proxy.
//!
//! Wires the configured pipeline (keyset cache, verifier, gate, forwarder)
//! into an Axum router.

use crate::auth::{AuthGate, HttpKeysetSource, KeysetCache, KeysetSource, TokenVerifier};
use crate::config::{Config, OPS_PATH_PREFIX};
use crate::handlers;
use crate::middleware::{http_metrics_middleware, require_identity, AuthState};
use crate::services::Forwarder;
use axum::{
    middleware,
    routing::{any, get},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// Identity provider keys, shared by the verifier and the readiness probe.
    pub keyset: Arc<KeysetCache>,

    pub gate: Arc<AuthGate>,

    pub forwarder: Arc<Forwarder>,
}

impl AppState {
    /// Build the pipeline with an HTTP keyset source on `config.jwks_url`.
    ///
    /// # Errors
    ///
    /// Returns the client build error if the backend HTTP client cannot be
    /// created.
    pub fn from_config(config: Config) -> Result<Self, reqwest::Error> {
        let source = Arc::new(HttpKeysetSource::new(
            config.jwks_url.to_string(),
            Duration::from_secs(config.keyset_fetch_timeout_seconds),
        ));
        Self::with_keyset_source(config, source)
    }

    /// Build the pipeline around an arbitrary keyset source.
    ///
    /// # Errors
    ///
    /// Returns the client build error if the backend HTTP client cannot be
    /// created.
    pub fn with_keyset_source(
        config: Config,
        source: Arc<dyn KeysetSource>,
    ) -> Result<Self, reqwest::Error> {
        let keyset = Arc::new(
            KeysetCache::new(source)
                .with_max_age(config.keyset_max_age_seconds.map(Duration::from_secs)),
        );
        let verifier = Arc::new(TokenVerifier::new(
            keyset.clone(),
            config.jwt_clock_skew_seconds,
        ));
        let gate = Arc::new(AuthGate::new(
            verifier,
            config.claims.clone(),
            config.login_redirect_path.clone(),
            config.verify_failure_policy,
        ));
        let forwarder = Arc::new(Forwarder::new(
            config.proxy_target.clone(),
            Duration::from_secs(config.backend_timeout_seconds),
        )?);

        Ok(Self {
            config,
            keyset,
            gate,
            forwarder,
        })
    }
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/-/health` - Liveness probe (simple "OK") - public
/// - `/-/ready` - Readiness probe (keyset available) - public
/// - `/-/metrics` - Prometheus metrics endpoint - public
/// - `{base}` and everything below it - gated, then forwarded to the backend
/// - TraceLayer for request logging
/// - HTTP metrics middleware
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let auth_state = Arc::new(AuthState {
        gate: state.gate.clone(),
        cookie_name: state.config.cookie_name.clone(),
        headers: state.config.trusted_headers.clone(),
    });

    let health_routes = Router::new()
        .route(&ops_path("health"), get(handlers::health_check))
        .route(&ops_path("ready"), get(handlers::readiness_check))
        .with_state(state.keyset.clone());

    let metrics_routes = Router::new()
        .route(&ops_path("metrics"), get(handlers::metrics_handler))
        .with_state(metrics_handle);

    let mut proxied_routes = Router::new();
    for path in proxied_paths(&state.config.base_path) {
        proxied_routes = proxied_routes.route(&path, any(handlers::proxy_handler));
    }
    let proxied_routes = proxied_routes
        .route_layer(middleware::from_fn_with_state(auth_state, require_identity))
        .with_state(state.forwarder.clone());

    // Layer order (bottom-to-top execution):
    // 1. TraceLayer - Log request details
    // 2. http_metrics_middleware - Record ALL responses (outermost)
    health_routes
        .merge(metrics_routes)
        .merge(proxied_routes)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(http_metrics_middleware))
}

fn ops_path(name: &str) -> String {
    format!("{OPS_PATH_PREFIX}{name}")
}

/// Route patterns covering `base` and every path below it.
fn proxied_paths(base: &str) -> Vec<String> {
    if base == "/" {
        vec!["/".to_string(), "/*rest".to_string()]
    } else {
        vec![
            base.to_string(),
            format!("{base}/"),
            format!("{base}/*rest"),
        ]
    }
}
