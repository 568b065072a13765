//! Keyset cache for token verification keys.
//!
//! Fetches the identity provider's JWKS document, turns every usable entry into
//! a [`VerificationKey`] and caches the result as an immutable [`Keyset`].
//! Refreshes are reactive: a lookup for an unknown key identifier triggers at
//! most one refetch, and concurrent misses share a single in-flight fetch.
//!
//! # Security
//!
//! - Only public keys are cached; symmetric (`oct`) entries are skipped
//! - Keys marked for encryption (`use: enc`) are skipped
//! - A refresh replaces the whole keyset; readers never see a partial one

use crate::errors::AuthError;
use crate::observability::metrics;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

/// Default keyset fetch timeout in seconds.
pub const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 10;

/// Raw JWKS document. Entries stay untyped so one bad key cannot reject the
/// whole document.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<serde_json::Value>,
}

/// JSON Web Key as published by the identity provider.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type: "RSA", "EC" or "OKP".
    pub kty: String,

    #[serde(default)]
    pub kid: Option<String>,

    /// Algorithm the key is pinned to, if any.
    #[serde(default)]
    pub alg: Option<String>,

    #[serde(default, rename = "use")]
    pub key_use: Option<String>,

    /// RSA modulus (base64url).
    #[serde(default)]
    pub n: Option<String>,

    /// RSA public exponent (base64url).
    #[serde(default)]
    pub e: Option<String>,

    /// Curve name for EC and OKP keys.
    #[serde(default)]
    pub crv: Option<String>,

    #[serde(default)]
    pub x: Option<String>,

    #[serde(default)]
    pub y: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    P256,
    P384,
}

/// Family of a verification key; decides which algorithms it can verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec(EcCurve),
    Okp,
}

impl KeyFamily {
    pub fn accepts(&self, alg: Algorithm) -> bool {
        matches!(
            (self, alg),
            (
                KeyFamily::Rsa,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ) | (KeyFamily::Ec(EcCurve::P256), Algorithm::ES256)
                | (KeyFamily::Ec(EcCurve::P384), Algorithm::ES384)
                | (KeyFamily::Okp, Algorithm::EdDSA)
        )
    }
}

/// A decoded public key ready for signature verification.
#[derive(Clone)]
pub struct VerificationKey {
    kid: String,
    family: KeyFamily,
    pinned_alg: Option<Algorithm>,
    decoding_key: DecodingKey,
}

impl VerificationKey {
    /// Decode a JWK into key material.
    ///
    /// Returns a short reason when the entry is not a usable signature key.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, String> {
        if jwk.key_use.as_deref() == Some("enc") {
            return Err("key is marked for encryption".to_string());
        }

        let family = match jwk.kty.as_str() {
            "RSA" => KeyFamily::Rsa,
            "EC" => match jwk.crv.as_deref() {
                Some("P-256") => KeyFamily::Ec(EcCurve::P256),
                Some("P-384") => KeyFamily::Ec(EcCurve::P384),
                other => return Err(format!("unsupported EC curve {other:?}")),
            },
            "OKP" => match jwk.crv.as_deref() {
                Some("Ed25519") => KeyFamily::Okp,
                other => return Err(format!("unsupported OKP curve {other:?}")),
            },
            other => return Err(format!("unsupported key type {other}")),
        };

        let pinned_alg = match jwk.alg.as_deref() {
            None => None,
            Some(name) => {
                let alg = Algorithm::from_str(name)
                    .map_err(|_| format!("unsupported algorithm {name}"))?;
                if !family.accepts(alg) {
                    return Err(format!("algorithm {name} does not match key type"));
                }
                Some(alg)
            }
        };

        let decoding_key = match family {
            KeyFamily::Rsa => {
                let n = required_component(jwk.n.as_deref(), "n")?;
                let e = required_component(jwk.e.as_deref(), "e")?;
                DecodingKey::from_rsa_components(n, e)
            }
            KeyFamily::Ec(_) => {
                let x = required_component(jwk.x.as_deref(), "x")?;
                let y = required_component(jwk.y.as_deref(), "y")?;
                DecodingKey::from_ec_components(x, y)
            }
            KeyFamily::Okp => {
                let x = required_component(jwk.x.as_deref(), "x")?;
                DecodingKey::from_ed_components(x)
            }
        }
        .map_err(|e| format!("invalid key material: {e}"))?;

        Ok(Self {
            kid: jwk.kid.clone().unwrap_or_default(),
            family,
            pinned_alg,
            decoding_key,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn family(&self) -> KeyFamily {
        self.family
    }

    pub fn pinned_alg(&self) -> Option<Algorithm> {
        self.pinned_alg
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Whether a token signed with `alg` may be verified by this key.
    pub fn accepts(&self, alg: Algorithm) -> bool {
        self.family.accepts(alg) && self.pinned_alg.map_or(true, |pinned| pinned == alg)
    }
}

fn required_component<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("missing '{name}' component"))
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("pinned_alg", &self.pinned_alg)
            .finish_non_exhaustive()
    }
}

/// Immutable mapping of key identifier to verification key.
///
/// Keys published without a `kid` live under the empty identifier.
#[derive(Debug)]
pub struct Keyset {
    keys: HashMap<String, VerificationKey>,
    fetched_at: Instant,
}

impl Keyset {
    /// Build a keyset from a fetched document, skipping unusable entries.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::KeysetParse` if no entry yields a usable key.
    pub fn from_document(document: JwksDocument) -> Result<Self, AuthError> {
        let total = document.keys.len();
        let mut keys = HashMap::with_capacity(total);

        for raw in document.keys {
            let jwk: Jwk = match serde_json::from_value(raw) {
                Ok(jwk) => jwk,
                Err(e) => {
                    tracing::warn!(target: "proxy.auth.keyset", error = %e, "Skipping malformed JWK entry");
                    continue;
                }
            };

            match VerificationKey::from_jwk(&jwk) {
                Ok(key) => {
                    if keys.contains_key(key.kid()) {
                        tracing::warn!(target: "proxy.auth.keyset", kid = %key.kid(), "Duplicate key identifier, keeping first entry");
                        continue;
                    }
                    keys.insert(key.kid().to_string(), key);
                }
                Err(reason) => {
                    tracing::warn!(
                        target: "proxy.auth.keyset",
                        kid = ?jwk.kid,
                        kty = %jwk.kty,
                        reason = %reason,
                        "Skipping unusable JWK"
                    );
                }
            }
        }

        if keys.is_empty() {
            return Err(AuthError::KeysetParse(format!(
                "no usable verification keys among {total} entries"
            )));
        }

        Ok(Self {
            keys,
            fetched_at: Instant::now(),
        })
    }

    pub fn get(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key identifiers in sorted order.
    pub fn key_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// Where keyset documents come from.
#[async_trait]
pub trait KeysetSource: Send + Sync {
    /// Fetch the current keyset document.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::KeysetFetch` if the document cannot be retrieved.
    async fn fetch(&self) -> Result<JwksDocument, AuthError>;
}

/// Fetches the keyset document over HTTP.
pub struct HttpKeysetSource {
    jwks_url: String,
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpKeysetSource {
    /// Create a new HTTP keyset source.
    ///
    /// # Arguments
    ///
    /// * `jwks_url` - URL of the identity provider's JWKS endpoint
    /// * `timeout` - Total time allowed for one fetch
    pub fn new(jwks_url: String, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "proxy.auth.keyset", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self {
            jwks_url,
            http_client,
            timeout,
        }
    }

    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }

    fn fetch_error(&self, e: &reqwest::Error) -> AuthError {
        if e.is_timeout() {
            AuthError::KeysetFetch(format!("timed out after {:?}", self.timeout))
        } else {
            AuthError::KeysetFetch(format!("request failed: {e}"))
        }
    }
}

#[async_trait]
impl KeysetSource for HttpKeysetSource {
    #[instrument(skip(self), fields(url = %self.jwks_url))]
    async fn fetch(&self) -> Result<JwksDocument, AuthError> {
        tracing::debug!(target: "proxy.auth.keyset", "Fetching keyset document");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| self.fetch_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::KeysetFetch(format!(
                "endpoint returned {status}"
            )));
        }

        response.json::<JwksDocument>().await.map_err(|e| {
            if e.is_timeout() {
                self.fetch_error(&e)
            } else {
                AuthError::KeysetFetch(format!("response is not a JWKS document: {e}"))
            }
        })
    }
}

struct CacheState {
    keyset: Option<Arc<Keyset>>,

    /// Error from the latest refresh, cleared by a successful one.
    last_error: Option<AuthError>,

    /// Bumped on every refresh attempt or invalidation.
    generation: u64,
}

/// Cache of the current keyset with reactive, single-flight refresh.
pub struct KeysetCache {
    source: Arc<dyn KeysetSource>,
    state: RwLock<CacheState>,

    /// Serialises fetches so concurrent misses collapse into one.
    refresh_lock: Mutex<()>,

    /// Keysets older than this are refetched on the next lookup.
    max_age: Option<Duration>,
}

impl KeysetCache {
    /// Create an empty cache. Nothing is fetched until the first lookup.
    pub fn new(source: Arc<dyn KeysetSource>) -> Self {
        Self {
            source,
            state: RwLock::new(CacheState {
                keyset: None,
                last_error: None,
                generation: 0,
            }),
            refresh_lock: Mutex::new(()),
            max_age: None,
        }
    }

    /// Set the maximum keyset age. `None` keeps keysets until invalidated.
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// Return the cached keyset, fetching it if the cache is empty or expired.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::KeysetFetch` or `AuthError::KeysetParse` if a
    /// required fetch fails.
    #[instrument(skip(self))]
    pub async fn get_keyset(&self) -> Result<Arc<Keyset>, AuthError> {
        let (cached, generation) = self.snapshot().await;
        match cached {
            Some(keyset) => Ok(keyset),
            None => self.refresh_after(generation).await,
        }
    }

    /// Look up a key by identifier, refreshing at most once on a miss.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::UnknownKey` if the key is absent after the refresh,
    /// or the fetch error if the refresh itself fails.
    #[instrument(skip(self), fields(kid = %kid))]
    pub async fn resolve(&self, kid: &str) -> Result<VerificationKey, AuthError> {
        let (cached, generation) = self.snapshot().await;

        if let Some(keyset) = &cached {
            if let Some(key) = keyset.get(kid) {
                tracing::debug!(target: "proxy.auth.keyset", kid = %kid, "Keyset cache hit");
                return Ok(key.clone());
            }
            tracing::debug!(target: "proxy.auth.keyset", kid = %kid, "Key not found in cached keyset, refreshing");
        }

        let keyset = self.refresh_after(generation).await?;
        keyset.get(kid).cloned().ok_or_else(|| {
            tracing::warn!(target: "proxy.auth.keyset", kid = %kid, "Key not found in keyset after refresh");
            AuthError::UnknownKey(kid.to_string())
        })
    }

    /// Drop the cached keyset; the next lookup fetches a new one.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        state.keyset = None;
        state.last_error = None;
        state.generation = state.generation.wrapping_add(1);
        tracing::debug!(target: "proxy.auth.keyset", "Keyset cache invalidated");
    }

    /// Drop the cached keyset and fetch a new one immediately.
    ///
    /// On failure the cache is left empty.
    pub async fn invalidate_and_refetch(&self) -> Result<Arc<Keyset>, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        self.invalidate().await;
        self.fetch_and_store().await
    }

    /// Current usable keyset and the generation it was observed at.
    async fn snapshot(&self) -> (Option<Arc<Keyset>>, u64) {
        let state = self.state.read().await;
        let keyset = state
            .keyset
            .as_ref()
            .filter(|keyset| !self.is_expired(keyset))
            .cloned();
        (keyset, state.generation)
    }

    fn is_expired(&self, keyset: &Keyset) -> bool {
        self.max_age.is_some_and(|max_age| keyset.age() >= max_age)
    }

    /// Refresh unless someone else already did since `observed`.
    ///
    /// Callers that queued behind a failed refresh share its error.
    async fn refresh_after(&self, observed: u64) -> Result<Arc<Keyset>, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        {
            let state = self.state.read().await;
            if state.generation != observed {
                if let Some(e) = &state.last_error {
                    tracing::debug!(target: "proxy.auth.keyset", "Concurrent keyset refresh failed, not retrying");
                    return Err(e.clone());
                }
                if let Some(keyset) = state.keyset.as_ref().filter(|k| !self.is_expired(k)) {
                    tracing::debug!(target: "proxy.auth.keyset", "Keyset refreshed by concurrent request");
                    return Ok(Arc::clone(keyset));
                }
            }
        }

        self.fetch_and_store().await
    }

    /// Callers must hold `refresh_lock`.
    async fn fetch_and_store(&self) -> Result<Arc<Keyset>, AuthError> {
        let start = Instant::now();
        let result = match self.source.fetch().await {
            Ok(document) => Keyset::from_document(document),
            Err(e) => Err(e),
        };
        let duration = start.elapsed();

        let keyset = match result {
            Ok(keyset) => {
                metrics::record_keyset_refresh("success", duration);
                Arc::new(keyset)
            }
            Err(e) => {
                metrics::record_keyset_refresh("error", duration);
                tracing::error!(target: "proxy.auth.keyset", error = %e, "Keyset refresh failed");
                let mut state = self.state.write().await;
                state.last_error = Some(e.clone());
                state.generation = state.generation.wrapping_add(1);
                return Err(e);
            }
        };

        tracing::info!(
            target: "proxy.auth.keyset",
            key_count = keyset.len(),
            duration_ms = duration.as_millis() as u64,
            "Keyset cache refreshed"
        );

        let mut state = self.state.write().await;
        state.keyset = Some(Arc::clone(&keyset));
        state.last_error = None;
        state.generation = state.generation.wrapping_add(1);

        Ok(keyset)
    }
}
