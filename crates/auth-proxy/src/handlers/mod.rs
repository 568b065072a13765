//! HTTP request handlers for the auth proxy.

pub mod health;
pub mod metrics;
pub mod proxy;

pub use health::{health_check, readiness_check, ReadinessResponse};
pub use metrics::metrics_handler;
pub use proxy::proxy_handler;
