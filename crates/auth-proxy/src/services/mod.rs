//! Outbound services.
//!
//! - `forwarder` - Streams authenticated requests to the backend

pub mod forwarder;

pub use forwarder::Forwarder;
