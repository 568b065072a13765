//! Auth gate middleware for proxied routes.
//!
//! Strips client-supplied identity headers, reads the access-token cookie,
//! runs the [`AuthGate`] and, when the gate lets the request through, sets the
//! trusted identity headers and stores the [`AuthContext`] in request
//! extensions.

use crate::auth::{AuthContext, AuthGate, GateOutcome};
use crate::errors::ProxyError;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;
use std::sync::Arc;
use tracing::instrument;

/// Header names used to assert identity to the backend.
#[derive(Debug, Clone)]
pub struct TrustedHeaders {
    pub user: HeaderName,
    pub email: HeaderName,
    pub name: HeaderName,
}

impl Default for TrustedHeaders {
    fn default() -> Self {
        Self {
            user: HeaderName::from_static("x-webauth-user"),
            email: HeaderName::from_static("x-webauth-email"),
            name: HeaderName::from_static("x-webauth-name"),
        }
    }
}

impl TrustedHeaders {
    /// Remove every copy of the trusted headers.
    pub fn strip(&self, headers: &mut HeaderMap) {
        for name in [&self.user, &self.email, &self.name] {
            if headers.remove(name).is_some() {
                tracing::debug!(target: "proxy.gate", header = %name, "Stripped client-supplied identity header");
            }
        }
    }

    /// Set the identity headers from `ctx`. Empty values are omitted.
    pub fn apply(&self, headers: &mut HeaderMap, ctx: &AuthContext) {
        set_header(headers, &self.user, Some(&ctx.login));
        set_header(headers, &self.email, ctx.email.as_deref());
        set_header(headers, &self.name, ctx.name.as_deref());
    }
}

fn set_header(headers: &mut HeaderMap, name: &HeaderName, value: Option<&str>) {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return;
    };
    // The gate only lets header-safe values through
    match HeaderValue::from_bytes(value.as_bytes()) {
        Ok(value) => {
            headers.insert(name.clone(), value);
        }
        Err(_) => {
            tracing::warn!(target: "proxy.gate", header = %name, "Dropping identity header with invalid value");
        }
    }
}

/// State for the auth gate middleware.
#[derive(Clone)]
pub struct AuthState {
    pub gate: Arc<AuthGate>,
    pub cookie_name: String,
    pub headers: TrustedHeaders,
}

/// Gate a request on its access-token cookie.
///
/// # Response
///
/// - 302 Found to the login path if the cookie is missing (or, in strict
///   mode, the token fails verification)
/// - 403 Forbidden if no primary identity can be extracted
/// - Otherwise continues with the identity headers set
#[instrument(skip_all, name = "proxy.middleware.auth")]
pub async fn require_identity(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    state.headers.strip(req.headers_mut());

    let token = jar.get(&state.cookie_name).map(|cookie| cookie.value());

    match state.gate.evaluate(token).await {
        GateOutcome::Redirect(location) => Err(ProxyError::Unauthenticated(location)),
        GateOutcome::Forbidden => Err(ProxyError::Forbidden),
        GateOutcome::Proceed(ctx) => {
            state.headers.apply(req.headers_mut(), &ctx);
            req.extensions_mut().insert(ctx);
            Ok(next.run(req).await)
        }
    }
}

/// Extension trait for reading the auth context from a request.
pub trait AuthContextExt {
    /// Returns `None` if the auth middleware was not applied to this request.
    fn auth_context(&self) -> Option<&AuthContext>;
}

impl<B> AuthContextExt for axum::http::Request<B> {
    fn auth_context(&self) -> Option<&AuthContext> {
        self.extensions().get::<AuthContext>()
    }
}
