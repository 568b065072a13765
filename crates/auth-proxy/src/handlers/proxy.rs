//! Catch-all handler that hands gated requests to the forwarder.

use crate::errors::ProxyError;
use crate::middleware::auth::AuthContextExt;
use crate::services::Forwarder;
use axum::{
    extract::{ConnectInfo, Request, State},
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Forward an authenticated request to the backend.
///
/// Runs behind [`crate::middleware::require_identity`], which has already
/// rewritten the identity headers.
#[tracing::instrument(skip_all, name = "proxy.forward.request")]
pub async fn proxy_handler(
    State(forwarder): State<Arc<Forwarder>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Result<Response, ProxyError> {
    if let Some(ctx) = req.auth_context() {
        tracing::debug!(
            target: "proxy.forward",
            claims = ?ctx.claims,
            has_email = ctx.email.is_some(),
            has_name = ctx.name.is_some(),
            "Forwarding authenticated request"
        );
    }

    forwarder.forward(req, peer.map(|ConnectInfo(addr)| addr)).await
}
