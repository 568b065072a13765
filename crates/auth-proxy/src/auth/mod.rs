//! Credential validation pipeline.
//!
//! # Components
//!
//! - `jwks` - Keyset cache for the identity provider's public keys
//! - `jwt` - Token verification against cached keys
//! - `claims` - Claim set model and claim path extraction
//! - `gate` - Access decision combining verification and extraction

pub mod claims;
pub mod gate;
pub mod jwks;
pub mod jwt;

pub use claims::{extract, ClaimPath, ClaimSet, ClaimValue};
pub use gate::{AuthContext, AuthGate, ClaimMapping, GateOutcome, VerifyFailurePolicy};
pub use jwks::{HttpKeysetSource, Keyset, KeysetCache, KeysetSource, VerificationKey};
pub use jwt::TokenVerifier;
