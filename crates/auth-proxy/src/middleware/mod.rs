//! Middleware for the auth proxy.
//!
//! # Components
//!
//! - `auth` - Auth gate middleware for proxied routes
//! - `http_metrics` - Request metrics for every response

pub mod auth;
pub mod http_metrics;

pub use auth::{require_identity, AuthState, TrustedHeaders};
pub use http_metrics::http_metrics_middleware;
