//! # Auth Proxy Test Utilities
//!
//! Shared test utilities for the auth proxy.
//!
//! This crate provides:
//! - Crypto fixtures (Ed25519 from a seed, a fixed RSA key, generated ECDSA keys)
//! - Test data builders (TestTokenBuilder)
//! - A mock identity provider serving a JWKS document
//! - Server test harness (TestProxyServer with an echoing backend)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use auth_proxy_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let key = ed25519_signing_key("key-1", 1)?;
//!     let idp = MockIdentityProvider::start(jwks_document(&[&key])).await;
//!     let server = TestProxyServer::spawn(&idp).await?;
//!
//!     let token = key.sign(&TestTokenBuilder::new().for_user("a@b.com").build())?;
//!     let response = server
//!         .client()
//!         .get(server.url("/"))
//!         .header("cookie", format!("access_token={token}"))
//!         .send()
//!         .await?;
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod crypto_fixtures;
pub mod server_harness;
pub mod token_builders;

// Re-export commonly used items
pub use crypto_fixtures::*;
pub use server_harness::*;
pub use token_builders::*;
