//! Auth Proxy Library
//!
//! An authenticating reverse proxy. Requests carry an access token in a
//! cookie; the proxy verifies it against the identity provider's published
//! keys, maps claims to trusted identity headers and forwards the request to
//! a single backend.
//!
//! # Architecture
//!
//! ```text
//! cookie -> KeysetCache -> TokenVerifier -> extract -> AuthGate -> Forwarder
//! ```
//!
//! # Modules
//!
//! - `auth` - Keyset cache, token verification, claim extraction, auth gate
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP request handlers
//! - `middleware` - Auth gate and HTTP metrics middleware
//! - `observability` - Metrics definitions
//! - `routes` - Axum router setup
//! - `services` - Backend forwarding

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod routes;
pub mod services;
