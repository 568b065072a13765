//! Auth proxy error types.
//!
//! Three layers of errors live here:
//!
//! - [`AuthError`] - keyset and token verification failures
//! - [`ClaimError`] - claim extraction failures, split into "absent" and
//!   "present but unextractable" so callers can choose a fallback policy
//! - [`ProxyError`] - the HTTP-visible failures, mapped to responses via
//!   `IntoResponse`
//!
//! Verification and extraction errors never reach the client verbatim. They are
//! logged at the auth gate and turned into a redirect or a generic denial.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Keyset retrieval and token verification failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The keyset endpoint was unreachable, timed out, returned a non-success
    /// status or a body that is not a JWKS document.
    #[error("Keyset fetch failed: {0}")]
    KeysetFetch(String),

    /// The keyset document contained no usable verification keys.
    #[error("Keyset parse failed: {0}")]
    KeysetParse(String),

    /// The token's key identifier is not in the keyset, even after a refresh.
    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    /// The token is not a well-formed compact JWS.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Signature mismatch, or an algorithm the resolved key cannot verify.
    #[error("Invalid token signature: {0}")]
    InvalidSignature(String),

    /// The `exp` claim lies in the past (beyond clock skew).
    #[error("Token expired at {0}")]
    TokenExpired(i64),

    /// The `nbf` claim lies in the future (beyond clock skew).
    #[error("Token not valid before {0}")]
    TokenNotYetValid(i64),
}

impl AuthError {
    /// Short, bounded label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::KeysetFetch(_) => "keyset_fetch",
            AuthError::KeysetParse(_) => "keyset_parse",
            AuthError::UnknownKey(_) => "unknown_key",
            AuthError::MalformedToken(_) => "malformed_token",
            AuthError::InvalidSignature(_) => "invalid_signature",
            AuthError::TokenExpired(_) => "token_expired",
            AuthError::TokenNotYetValid(_) => "token_not_yet_valid",
        }
    }
}

/// Claim extraction failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// A path segment does not exist in the claim set.
    #[error("Claim '{path}' not found")]
    NotFound { path: String },

    /// The claim exists but cannot be rendered as a string (or an
    /// intermediate segment is not a mapping).
    #[error("Claim '{path}' has unsupported type {found}")]
    TypeMismatch { path: String, found: &'static str },
}

impl ClaimError {
    pub fn kind(&self) -> &'static str {
        match self {
            ClaimError::NotFound { .. } => "claim_not_found",
            ClaimError::TypeMismatch { .. } => "claim_type_mismatch",
        }
    }
}

/// HTTP-visible proxy failures.
///
/// Maps to:
/// - Unauthenticated: 302 Found to the login path
/// - Forbidden: 403 Forbidden with a generic body
/// - BadGateway: 502 Bad Gateway
/// - GatewayTimeout: 504 Gateway Timeout
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Unauthenticated, redirecting to {0}")]
    Unauthenticated(String),

    #[error("Access denied")]
    Forbidden,

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Gateway timeout")]
    GatewayTimeout,
}

impl ProxyError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Unauthenticated(_) => 302,
            ProxyError::Forbidden => 403,
            ProxyError::BadGateway(_) => 502,
            ProxyError::GatewayTimeout => 504,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Unauthenticated(location) => {
                let mut response = StatusCode::FOUND.into_response();
                match HeaderValue::from_str(&location) {
                    Ok(value) => {
                        response.headers_mut().insert(header::LOCATION, value);
                    }
                    Err(e) => {
                        tracing::error!(target: "proxy.errors", error = %e, "Login redirect path is not a valid header value");
                    }
                }
                response
            }
            ProxyError::Forbidden => (StatusCode::FORBIDDEN, "Access denied").into_response(),
            ProxyError::BadGateway(reason) => {
                // Log actual reason server-side, return generic message to client
                tracing::warn!(target: "proxy.errors", reason = %reason, "Backend unavailable");
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
            ProxyError::GatewayTimeout => {
                (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response()
            }
        }
    }
}
