//! Observability module for the auth proxy.
//!
//! Provides metrics definitions and recording helpers.

pub mod metrics;
