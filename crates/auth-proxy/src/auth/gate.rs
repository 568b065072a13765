//! Auth gate: turns an access-token cookie into an access decision.
//!
//! The gate is the only place where verification and extraction failures are
//! interpreted. A missing cookie sends the caller to the login path, a missing
//! primary identity denies the request, and the secondary identity claims are
//! best-effort.

use crate::auth::claims::{extract, ClaimPath, ClaimSet};
use crate::auth::jwt::TokenVerifier;
use crate::observability::metrics;
use axum::http::HeaderValue;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

/// What to do when a presented token fails verification.
///
/// Set with `VERIFY_FAILURE_MODE`. The default redirects to login. Answering
/// an invalid signature with 403 Forbidden requires opting in with
/// `permissive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyFailurePolicy {
    /// Redirect to the login path so the caller can re-authenticate.
    #[default]
    Strict,

    /// Continue with an empty claim set, which ends in `Forbidden`.
    Permissive,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown verify failure mode '{0}' (expected 'strict' or 'permissive')")]
pub struct UnknownPolicy(String);

impl FromStr for VerifyFailurePolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(VerifyFailurePolicy::Strict),
            "permissive" => Ok(VerifyFailurePolicy::Permissive),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for VerifyFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyFailurePolicy::Strict => f.write_str("strict"),
            VerifyFailurePolicy::Permissive => f.write_str("permissive"),
        }
    }
}

/// Claim locations for the three identity values.
#[derive(Debug, Clone)]
pub struct ClaimMapping {
    /// Login (or email) identifier. Required.
    pub login: ClaimPath,
    pub email: ClaimPath,
    pub name: ClaimPath,
}

/// Identity extracted for one request.
///
/// Values are never printed by `Debug`.
#[derive(Clone)]
pub struct AuthContext {
    pub login: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub claims: ClaimSet,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("login", &"[REDACTED]")
            .field("email", &self.email.as_ref().map(|_| "[REDACTED]"))
            .field("name", &self.name.as_ref().map(|_| "[REDACTED]"))
            .field("claims", &self.claims)
            .finish()
    }
}

/// The gate's decision for one request.
#[derive(Debug)]
pub enum GateOutcome {
    Redirect(String),
    Forbidden,
    Proceed(AuthContext),
}

impl GateOutcome {
    /// Bounded label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            GateOutcome::Redirect(_) => "redirect",
            GateOutcome::Forbidden => "forbidden",
            GateOutcome::Proceed(_) => "proceed",
        }
    }
}

/// Orchestrates verification and extraction for incoming requests.
pub struct AuthGate {
    verifier: Arc<TokenVerifier>,
    mapping: ClaimMapping,
    login_path: String,
    failure_policy: VerifyFailurePolicy,
}

impl AuthGate {
    pub fn new(
        verifier: Arc<TokenVerifier>,
        mapping: ClaimMapping,
        login_path: String,
        failure_policy: VerifyFailurePolicy,
    ) -> Self {
        Self {
            verifier,
            mapping,
            login_path,
            failure_policy,
        }
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    pub fn failure_policy(&self) -> VerifyFailurePolicy {
        self.failure_policy
    }

    /// Decide what happens to a request carrying `cookie_value`.
    #[instrument(skip_all, fields(outcome))]
    pub async fn evaluate(&self, cookie_value: Option<&str>) -> GateOutcome {
        let outcome = self.decide(cookie_value).await;
        tracing::Span::current().record("outcome", outcome.label());
        metrics::record_gate_outcome(outcome.label());
        outcome
    }

    async fn decide(&self, cookie_value: Option<&str>) -> GateOutcome {
        let token = match cookie_value.map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => {
                tracing::debug!(target: "proxy.gate", "No access token cookie, redirecting to login");
                return GateOutcome::Redirect(self.login_path.clone());
            }
        };

        let claims = match self.verifier.verify(token).await {
            Ok(claims) => claims,
            Err(e) => {
                tracing::info!(
                    target: "proxy.gate",
                    error_kind = e.kind(),
                    error = %e,
                    policy = %self.failure_policy,
                    "Access token verification failed"
                );
                match self.failure_policy {
                    VerifyFailurePolicy::Strict => {
                        return GateOutcome::Redirect(self.login_path.clone())
                    }
                    VerifyFailurePolicy::Permissive => ClaimSet::empty(),
                }
            }
        };

        let login = match extract(&claims, &self.mapping.login) {
            Ok(login) if !login.is_empty() => login,
            Ok(_) => {
                tracing::info!(
                    target: "proxy.gate",
                    claim = %self.mapping.login,
                    "Primary identity claim is empty, denying access"
                );
                return GateOutcome::Forbidden;
            }
            Err(e) => {
                tracing::info!(
                    target: "proxy.gate",
                    claim = %self.mapping.login,
                    error_kind = e.kind(),
                    "Primary identity claim unavailable, denying access"
                );
                return GateOutcome::Forbidden;
            }
        };

        if !is_header_safe(&login) {
            tracing::info!(
                target: "proxy.gate",
                claim = %self.mapping.login,
                "Primary identity claim is not a valid header value, denying access"
            );
            return GateOutcome::Forbidden;
        }

        let email = self.optional_claim(&claims, &self.mapping.email);
        let name = self.optional_claim(&claims, &self.mapping.name);

        GateOutcome::Proceed(AuthContext {
            login,
            email,
            name,
            claims,
        })
    }

    /// Best-effort extraction; failures are logged and yield `None`.
    fn optional_claim(&self, claims: &ClaimSet, path: &ClaimPath) -> Option<String> {
        match extract(claims, path) {
            Ok(value) if value.is_empty() => None,
            Ok(value) if !is_header_safe(&value) => {
                tracing::warn!(
                    target: "proxy.gate",
                    claim = %path,
                    "Identity claim is not a valid header value, omitting header"
                );
                None
            }
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    target: "proxy.gate",
                    claim = %path,
                    error_kind = e.kind(),
                    "Identity claim unavailable, omitting header"
                );
                None
            }
        }
    }
}

/// Control characters (including CR/LF) cannot be carried in a header.
fn is_header_safe(value: &str) -> bool {
    HeaderValue::from_bytes(value.as_bytes()).is_ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::jwks::{JwksDocument, KeysetCache, KeysetSource};
    use crate::errors::AuthError;
    use async_trait::async_trait;

    // Tokens in these tests never reach key resolution
    struct UnreachableSource;

    #[async_trait]
    impl KeysetSource for UnreachableSource {
        async fn fetch(&self) -> Result<JwksDocument, AuthError> {
            Err(AuthError::KeysetFetch("unreachable".to_string()))
        }
    }

    fn gate(policy: VerifyFailurePolicy) -> AuthGate {
        let cache = Arc::new(KeysetCache::new(Arc::new(UnreachableSource)));
        let verifier = Arc::new(TokenVerifier::new(cache, 5));
        AuthGate::new(
            verifier,
            ClaimMapping {
                login: "email".parse().unwrap(),
                email: "email".parse().unwrap(),
                name: "name".parse().unwrap(),
            },
            "/auth".to_string(),
            policy,
        )
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "strict".parse::<VerifyFailurePolicy>().unwrap(),
            VerifyFailurePolicy::Strict
        );
        assert_eq!(
            " Permissive ".parse::<VerifyFailurePolicy>().unwrap(),
            VerifyFailurePolicy::Permissive
        );
        assert!("lenient".parse::<VerifyFailurePolicy>().is_err());
        assert_eq!(VerifyFailurePolicy::default(), VerifyFailurePolicy::Strict);
        assert_eq!(VerifyFailurePolicy::Permissive.to_string(), "permissive");
    }

    #[tokio::test]
    async fn test_missing_cookie_redirects() {
        let outcome = gate(VerifyFailurePolicy::Strict).evaluate(None).await;
        assert!(matches!(outcome, GateOutcome::Redirect(path) if path == "/auth"));
    }

    #[tokio::test]
    async fn test_empty_cookie_redirects_in_either_mode() {
        for policy in [VerifyFailurePolicy::Strict, VerifyFailurePolicy::Permissive] {
            let outcome = gate(policy).evaluate(Some("  ")).await;
            assert!(matches!(outcome, GateOutcome::Redirect(_)), "{policy}");
        }
    }

    #[tokio::test]
    async fn test_verify_failure_strict_redirects() {
        let outcome = gate(VerifyFailurePolicy::Strict)
            .evaluate(Some("not-a-token"))
            .await;
        assert!(matches!(outcome, GateOutcome::Redirect(path) if path == "/auth"));
    }

    #[tokio::test]
    async fn test_verify_failure_permissive_is_forbidden() {
        let outcome = gate(VerifyFailurePolicy::Permissive)
            .evaluate(Some("not-a-token"))
            .await;
        assert!(matches!(outcome, GateOutcome::Forbidden));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(GateOutcome::Redirect("/auth".to_string()).label(), "redirect");
        assert_eq!(GateOutcome::Forbidden.label(), "forbidden");
    }

    #[test]
    fn test_header_safety() {
        assert!(is_header_safe("a@b.com"));
        assert!(is_header_safe("José Müller"));
        assert!(!is_header_safe("evil\r\nX-Injected: 1"));
        assert!(!is_header_safe("nul\u{0}byte"));
    }

    #[test]
    fn test_auth_context_debug_redacts_values() {
        let ctx = AuthContext {
            login: "secret@example.com".to_string(),
            email: Some("secret@example.com".to_string()),
            name: None,
            claims: ClaimSet::empty(),
        };
        let debug_str = format!("{:?}", ctx);
        assert!(!debug_str.contains("secret@example.com"));
        assert!(debug_str.contains("[REDACTED]"));
    }
}
