//! Test server harness for E2E testing
//!
//! Provides a mock identity provider serving a JWKS document and
//! `TestProxyServer` for spawning real proxy instances in front of a
//! wiremock backend.

use auth_proxy::config::Config;
use auth_proxy::observability::metrics::init_metrics_recorder;
use auth_proxy::routes::{self, AppState};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Path the mock identity provider serves its keyset on.
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// Global metrics handle for test servers
static TEST_METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics handle shared by every test server in the process.
///
/// Installs the global recorder on first use. If another recorder is already
/// installed, falls back to a standalone recorder that is never installed.
pub fn test_metrics_handle() -> PrometheusHandle {
    TEST_METRICS_HANDLE
        .get_or_init(|| {
            init_metrics_recorder()
                .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle())
        })
        .clone()
}

/// Wiremock identity provider that publishes a JWKS document.
pub struct MockIdentityProvider {
    server: MockServer,
}

impl MockIdentityProvider {
    /// Serve `jwks` on every fetch.
    pub async fn start(jwks: Value) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks))
            .mount(&server)
            .await;
        Self { server }
    }

    /// Serve `first` on the first fetch and `then` afterwards, simulating a
    /// key rotation.
    pub async fn start_rotating(first: Value, then: Value) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(first))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(then))
            .mount(&server)
            .await;
        Self { server }
    }

    /// Answer every fetch with `status` and an empty body.
    pub async fn start_failing(status: u16) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn jwks_url(&self) -> String {
        format!("{}{}", self.server.uri(), JWKS_PATH)
    }

    /// Number of keyset fetches received so far.
    pub async fn fetch_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| {
                requests
                    .iter()
                    .filter(|r| r.url.path() == JWKS_PATH)
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Backend response describing the request it received.
///
/// Body is `{"method", "path", "query", "headers": {name: [values]}, "body"}`.
pub fn echo_response(req: &Request) -> ResponseTemplate {
    let mut headers: Map<String, Value> = Map::new();
    for (name, value) in &req.headers {
        let entry = headers
            .entry(name.as_str().to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = entry {
            values.push(Value::from(String::from_utf8_lossy(value.as_bytes()).into_owned()));
        }
    }

    ResponseTemplate::new(200)
        .insert_header("x-backend", "echo")
        .set_body_json(json!({
            "method": req.method.as_str(),
            "path": req.url.path(),
            "query": req.url.query(),
            "headers": headers,
            "body": String::from_utf8_lossy(&req.body),
        }))
}

/// Wiremock backend that echoes every request.
pub async fn echo_backend() -> MockServer {
    let backend = MockServer::start().await;
    Mock::given(any())
        .respond_with(echo_response)
        .mount(&backend)
        .await;
    backend
}

/// Test harness for spawning the auth proxy in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health() -> Result<(), anyhow::Error> {
///     let idp = MockIdentityProvider::start(jwks_document(&[&key])).await;
///     let server = TestProxyServer::spawn(&idp).await?;
///
///     let response = server.client().get(server.url("/-/health")).send().await?;
///
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestProxyServer {
    addr: SocketAddr,
    backend: MockServer,
    config: Config,
    _handle: JoinHandle<()>,
}

impl TestProxyServer {
    /// Spawn a proxy in front of an echoing backend with default settings.
    pub async fn spawn(idp: &MockIdentityProvider) -> Result<Self, anyhow::Error> {
        Self::spawn_with(idp, &[]).await
    }

    /// Spawn a proxy in front of an echoing backend, overriding environment
    /// settings with `vars`.
    pub async fn spawn_with(
        idp: &MockIdentityProvider,
        vars: &[(&str, &str)],
    ) -> Result<Self, anyhow::Error> {
        Self::spawn_with_backend(idp, echo_backend().await, vars).await
    }

    /// Spawn a proxy in front of `backend`.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Target `backend` and fetch keys from `idp` unless `vars` override them
    /// - Start the HTTP server in the background
    pub async fn spawn_with_backend(
        idp: &MockIdentityProvider,
        backend: MockServer,
        vars: &[(&str, &str)],
    ) -> Result<Self, anyhow::Error> {
        let mut env = HashMap::from([
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("PROXY_TARGET".to_string(), backend.uri()),
            ("JWKS_URL".to_string(), idp.jwks_url()),
        ]);
        for (name, value) in vars {
            env.insert((*name).to_string(), (*value).to_string());
        }

        let config = Config::from_vars(&env)?;
        let state = Arc::new(AppState::from_config(config.clone())?);
        let app = routes::build_routes(state, test_metrics_handle());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            backend,
            config,
            _handle: handle,
        })
    }

    /// Absolute URL for `path` on the test server
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Get the socket address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get reference to the backend mock
    pub fn backend(&self) -> &MockServer {
        &self.backend
    }

    /// Get reference to the server configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// HTTP client that does not follow redirects, so 302s can be asserted.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    }
}

impl Drop for TestProxyServer {
    fn drop(&mut self) {
        // Explicitly abort the HTTP server task to ensure immediate cleanup
        // when the test completes.
        self._handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_identity_provider_counts_fetches() {
        let idp = MockIdentityProvider::start(json!({"keys": []})).await;
        assert_eq!(idp.fetch_count().await, 0);

        let body: Value = reqwest::get(idp.jwks_url()).await.unwrap().json().await.unwrap();

        assert_eq!(body, json!({"keys": []}));
        assert_eq!(idp.fetch_count().await, 1);
    }

    #[tokio::test]
    async fn test_echo_backend() {
        let backend = echo_backend().await;

        let body: Value = reqwest::Client::new()
            .post(format!("{}/some/path?x=1", backend.uri()))
            .header("x-test-header", "1")
            .body("hello")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["method"], "POST");
        assert_eq!(body["path"], "/some/path");
        assert_eq!(body["query"], "x=1");
        assert_eq!(body["headers"]["x-test-header"][0], "1");
        assert_eq!(body["body"], "hello");
    }
}
