//! Backend forwarder.
//!
//! Rewrites an inbound request onto the configured backend and streams it
//! there, then streams the backend's response back to the caller.
//!
//! # Rewriting
//!
//! - Scheme and authority come from the target URL
//! - The target's path is joined with the full request path
//! - Target and request query strings are concatenated
//! - `Host` becomes the backend authority; the original goes to `X-Forwarded-Host`
//! - The peer address is appended to `X-Forwarded-For`
//! - Hop-by-hop headers are dropped in both directions

use crate::errors::ProxyError;
use axum::{
    body::{Body, BodyDataStream, Bytes},
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::Response,
};
use futures::Stream;
use reqwest::{redirect, Client, Url};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::instrument;

/// Headers that describe one connection and are never forwarded.
static HOP_BY_HOP_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Streams requests to a single backend.
pub struct Forwarder {
    client: Client,
    target: Url,
    timeout: Duration,
}

impl Forwarder {
    /// Create a forwarder for `target`.
    ///
    /// `timeout` bounds the wait for the backend's response headers; response
    /// bodies stream without a deadline.
    ///
    /// # Errors
    ///
    /// Returns the client build error if TLS initialisation fails.
    pub fn new(target: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            target,
            timeout,
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Forward `req` to the backend and return its response.
    ///
    /// # Errors
    ///
    /// - `ProxyError::GatewayTimeout` if no response arrives within the timeout
    /// - `ProxyError::BadGateway` if the backend cannot be reached
    #[instrument(skip_all, fields(method = %req.method()))]
    pub async fn forward(
        &self,
        req: Request,
        peer: Option<SocketAddr>,
    ) -> Result<Response, ProxyError> {
        let (parts, body) = req.into_parts();
        let url = self.target_url(parts.uri.path(), parts.uri.query());
        let has_body = request_has_body(&parts.headers);

        let mut headers = parts.headers;
        let original_host = headers.remove(header::HOST);
        strip_hop_by_hop(&mut headers);
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        if let Some(peer) = peer {
            append_forwarded_for(&mut headers, peer);
        }

        tracing::debug!(target: "proxy.forward", path = %parts.uri.path(), "Forwarding request");

        let mut outbound = self
            .client
            .request(parts.method, url)
            .headers(headers);
        if has_body {
            outbound = outbound.body(reqwest::Body::wrap_stream(SyncBodyStream::new(
                body.into_data_stream(),
            )));
        }

        let response = match tokio::time::timeout(self.timeout, outbound.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                tracing::warn!(target: "proxy.forward", error = %e, "Backend request timed out");
                return Err(ProxyError::GatewayTimeout);
            }
            Ok(Err(e)) => return Err(ProxyError::BadGateway(e.to_string())),
            Err(_) => {
                tracing::warn!(
                    target: "proxy.forward",
                    timeout_secs = self.timeout.as_secs(),
                    "Backend did not respond in time"
                );
                return Err(ProxyError::GatewayTimeout);
            }
        };

        let status = response.status();
        let mut response_headers = response.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        tracing::debug!(target: "proxy.forward", status = status.as_u16(), "Backend responded");

        let mut proxied = Response::new(Body::from_stream(response.bytes_stream()));
        *proxied.status_mut() = status;
        *proxied.headers_mut() = response_headers;
        Ok(proxied)
    }

    /// Backend URL for an inbound path and query.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.target.clone();
        url.set_path(&join_paths(self.target.path(), path));

        let query = match (self.target.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
            (Some(target), Some(request)) => Some(format!("{target}&{request}")),
            (Some(target), None) => Some(target.to_string()),
            (None, Some(request)) => Some(request.to_string()),
            (None, None) => None,
        };
        url.set_query(query.as_deref());
        url
    }
}

/// Inbound body stream usable where the client requires `Sync`.
///
/// Same approach as `sync_wrapper::SyncStream`, which is not a direct dependency.
/// The stream is only ever polled through `&mut self`, so the mutex is never
/// contended.
struct SyncBodyStream(Mutex<BodyDataStream>);

impl SyncBodyStream {
    fn new(stream: BodyDataStream) -> Self {
        Self(Mutex::new(stream))
    }
}

impl Stream for SyncBodyStream {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let stream = self
            .get_mut()
            .0
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        Pin::new(stream).poll_next(cx)
    }
}

/// Join two paths with exactly one slash between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, path.trim_start_matches('/')),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

/// A request without a positive length or chunked framing has no body.
fn request_has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .is_some_and(|len| len > 0)
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        ip
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn forwarder(target: &str) -> Forwarder {
        Forwarder::new(Url::parse(target).unwrap(), Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/dashboards"), "/dashboards");
        assert_eq!(join_paths("/prefix", "/dashboards"), "/prefix/dashboards");
        assert_eq!(join_paths("/prefix/", "/dashboards"), "/prefix/dashboards");
        assert_eq!(join_paths("/prefix", "dashboards"), "/prefix/dashboards");
        assert_eq!(join_paths("/prefix/", "dashboards"), "/prefix/dashboards");
    }

    #[test]
    fn test_target_url_keeps_request_path_and_query() {
        let fwd = forwarder("http://backend.internal:3000");

        let url = fwd.target_url("/grafana/d/abc", Some("orgId=1&from=now-1h"));

        assert_eq!(
            url.as_str(),
            "http://backend.internal:3000/grafana/d/abc?orgId=1&from=now-1h"
        );
    }

    #[test]
    fn test_target_url_joins_target_path_and_query() {
        let fwd = forwarder("https://backend.internal/base?tenant=7");

        assert_eq!(
            fwd.target_url("/api/health", None).as_str(),
            "https://backend.internal/base/api/health?tenant=7"
        );
        assert_eq!(
            fwd.target_url("/api/search", Some("q=cpu")).as_str(),
            "https://backend.internal/base/api/search?tenant=7&q=cpu"
        );
    }

    #[test]
    fn test_target_url_root() {
        let fwd = forwarder("http://backend.internal:3000/");
        assert_eq!(
            fwd.target_url("/", Some("")).as_str(),
            "http://backend.internal:3000/"
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::PROXY_AUTHORIZATION, HeaderValue::from_static("Basic eA=="));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        headers.insert(header::COOKIE, HeaderValue::from_static("access_token=t"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(header::ACCEPT));
        assert!(headers.contains_key(header::COOKIE));
    }

    #[test]
    fn test_append_forwarded_for() {
        let peer: SocketAddr = "10.1.2.3:54321".parse().unwrap();

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers.get(&X_FORWARDED_FOR).unwrap(), "10.1.2.3");

        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.9"));
        append_forwarded_for(&mut headers, peer);
        assert_eq!(
            headers.get(&X_FORWARDED_FOR).unwrap(),
            "203.0.113.9, 10.1.2.3"
        );
    }

    #[test]
    fn test_request_has_body() {
        let mut headers = HeaderMap::new();
        assert!(!request_has_body(&headers));

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!request_has_body(&headers));

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert!(request_has_body(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert!(request_has_body(&headers));
    }
}
