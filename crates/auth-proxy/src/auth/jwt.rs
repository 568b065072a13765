//! Token verification.
//!
//! Verifies compact JWS tokens against keys from the [`KeysetCache`] and
//! returns the decoded payload as a [`ClaimSet`].
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - `none` and symmetric (`HS*`) algorithms are never accepted
//! - The header algorithm must match the resolved key's family and pinned `alg`
//! - `exp` and `nbf` are validated with clock skew tolerance when present

use crate::auth::claims::ClaimSet;
use crate::auth::jwks::KeysetCache;
use crate::errors::AuthError;
use crate::observability::metrics;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::instrument;

/// Maximum accepted token size in bytes.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default clock skew tolerance for `exp` and `nbf`.
pub const DEFAULT_CLOCK_SKEW_SECONDS: i64 = 5;

/// Upper bound for configurable clock skew.
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 600;

/// Verifies tokens using keys from a keyset cache.
pub struct TokenVerifier {
    keyset: Arc<KeysetCache>,

    /// Clock skew tolerance in seconds for exp/nbf validation.
    clock_skew_seconds: i64,
}

impl TokenVerifier {
    /// Create a new token verifier.
    ///
    /// # Arguments
    ///
    /// * `keyset` - Cache used to resolve signing keys
    /// * `clock_skew_seconds` - Tolerance applied to exp/nbf checks
    pub fn new(keyset: Arc<KeysetCache>, clock_skew_seconds: i64) -> Self {
        Self {
            keyset,
            clock_skew_seconds,
        }
    }

    pub fn keyset(&self) -> &Arc<KeysetCache> {
        &self.keyset
    }

    /// Verify a token and return its claims.
    ///
    /// # Security Checks
    ///
    /// 1. Size check - reject tokens > 8KB before parsing
    /// 2. Structure check - exactly three non-empty segments
    /// 3. Header decode - `kid` and a recognised asymmetric `alg`
    /// 4. Key resolution - one keyset refresh on an unknown `kid`
    /// 5. Algorithm/key compatibility
    /// 6. Signature verification
    /// 7. exp/nbf validation with clock skew tolerance
    ///
    /// # Errors
    ///
    /// Returns the `AuthError` variant describing the first failed check.
    #[instrument(skip_all)]
    pub async fn verify(&self, token: &str) -> Result<ClaimSet, AuthError> {
        let result = self.verify_inner(token).await;
        match &result {
            Ok(_) => {
                metrics::record_token_verification("success");
                tracing::debug!(target: "proxy.auth.verify", "Token verified successfully");
            }
            Err(e) => {
                metrics::record_token_verification(e.kind());
                tracing::debug!(target: "proxy.auth.verify", error = %e, "Token verification failed");
            }
        }
        result
    }

    async fn verify_inner(&self, token: &str) -> Result<ClaimSet, AuthError> {
        if token.len() > MAX_JWT_SIZE_BYTES {
            return Err(AuthError::MalformedToken(format!(
                "token exceeds {MAX_JWT_SIZE_BYTES} bytes"
            )));
        }

        let segments = token.split('.').count();
        if segments != 3 || token.split('.').any(str::is_empty) {
            return Err(AuthError::MalformedToken(
                "expected three non-empty segments".to_string(),
            ));
        }

        // Fails for undecodable headers and unrecognised algorithms, including "none"
        let header = decode_header(token)
            .map_err(|e| AuthError::MalformedToken(format!("invalid header: {e}")))?;
        let alg = header.alg;

        if matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(AuthError::InvalidSignature(format!(
                "symmetric algorithm {alg:?} is not accepted"
            )));
        }

        // Tokens without a kid can only match a key published without one
        let kid = header.kid.unwrap_or_default();
        let key = self.keyset.resolve(&kid).await?;

        if !key.accepts(alg) {
            return Err(AuthError::InvalidSignature(format!(
                "algorithm {alg:?} does not match key {kid:?}"
            )));
        }

        let token_data = decode::<Map<String, Value>>(token, key.decoding_key(), &validation(alg))
            .map_err(|e| match e.kind() {
                ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) | ErrorKind::InvalidToken => {
                    AuthError::MalformedToken(format!("invalid payload: {e}"))
                }
                _ => AuthError::InvalidSignature(e.to_string()),
            })?;
        let payload = token_data.claims;

        let now = chrono::Utc::now().timestamp();
        if let Some(exp) = numeric_date(&payload, "exp")? {
            if exp.saturating_add(self.clock_skew_seconds) < now {
                return Err(AuthError::TokenExpired(exp));
            }
        }
        if let Some(nbf) = numeric_date(&payload, "nbf")? {
            if nbf.saturating_sub(self.clock_skew_seconds) > now {
                return Err(AuthError::TokenNotYetValid(nbf));
            }
        }

        Ok(ClaimSet::from_verified_payload(payload))
    }
}

/// Signature-only validation; time claims are checked by the verifier itself.
fn validation(alg: Algorithm) -> Validation {
    let mut validation = Validation::new(alg);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation
}

fn numeric_date(payload: &Map<String, Value>, name: &str) -> Result<Option<i64>, AuthError> {
    match payload.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|secs| secs as i64))
            .map(Some)
            .ok_or_else(|| AuthError::MalformedToken(format!("'{name}' is not a numeric date"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::jwks::{JwksDocument, KeysetSource};
    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // RFC 8037 Ed25519 test key
    const ED25519_D: &str = "nWGxne_9WmC6hEr0kuwsxERJxWl7MmkZcDusAxyuf2A";
    const ED25519_X: &str = "11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo";

    struct StaticSource {
        keys: Vec<Value>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl KeysetSource for StaticSource {
        async fn fetch(&self) -> Result<JwksDocument, AuthError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(JwksDocument {
                keys: self.keys.clone(),
            })
        }
    }

    fn verifier_with_keys(keys: Vec<Value>) -> (TokenVerifier, Arc<StaticSource>) {
        let source = Arc::new(StaticSource {
            keys,
            fetches: AtomicUsize::new(0),
        });
        let cache = Arc::new(KeysetCache::new(source.clone()));
        (
            TokenVerifier::new(cache, DEFAULT_CLOCK_SKEW_SECONDS),
            source,
        )
    }

    fn default_verifier() -> (TokenVerifier, Arc<StaticSource>) {
        verifier_with_keys(vec![json!({
            "kty": "OKP", "crv": "Ed25519", "kid": "test-key", "x": ED25519_X, "alg": "EdDSA"
        })])
    }

    /// PKCS#8 v1 wrapper around a raw Ed25519 seed.
    fn encoding_key() -> EncodingKey {
        let seed = URL_SAFE_NO_PAD.decode(ED25519_D).unwrap();
        let mut pkcs8 = vec![
            0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22,
            0x04, 0x20,
        ];
        pkcs8.extend_from_slice(&seed);
        EncodingKey::from_ed_der(&pkcs8)
    }

    fn sign(claims: &Value, kid: Option<&str>) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = kid.map(str::to_string);
        encode(&header, claims, &encoding_key()).unwrap()
    }

    fn raw_token(header: &Value, payload: &Value, signature: &str) -> String {
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(payload.to_string()),
            signature
        )
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[tokio::test]
    async fn test_valid_token_returns_payload() {
        let (verifier, _) = default_verifier();
        let payload = json!({"sub": "user-1", "email": "a@b.com", "exp": now() + 3600, "profile": {"name": "A"}});

        let claims = verifier.verify(&sign(&payload, Some("test-key"))).await.unwrap();

        assert_eq!(claims.to_json(), payload);
    }

    #[tokio::test]
    async fn test_token_without_time_claims_is_accepted() {
        let (verifier, _) = default_verifier();
        let claims = verifier
            .verify(&sign(&json!({"sub": "user-1"}), Some("test-key")))
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_token_rejected_before_parsing() {
        let (verifier, source) = default_verifier();
        let token = "a".repeat(MAX_JWT_SIZE_BYTES + 1);

        let err = verifier.verify(&token).await.unwrap_err();

        assert!(matches!(err, AuthError::MalformedToken(_)));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wrong_segment_count_is_malformed() {
        let (verifier, _) = default_verifier();
        for token in ["", "abc", "a.b", "a.b.c.d", "a..c", ".b.c", "a.b."] {
            let err = verifier.verify(token).await.unwrap_err();
            assert!(
                matches!(err, AuthError::MalformedToken(_)),
                "token {token:?} gave {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_undecodable_header_is_malformed() {
        let (verifier, _) = default_verifier();
        let err = verifier.verify("!!!.eyJzdWIiOiJ4In0.c2ln").await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedToken(_)));
    }

    #[tokio::test]
    async fn test_alg_none_is_malformed() {
        let (verifier, source) = default_verifier();
        let token = raw_token(
            &json!({"alg": "none", "typ": "JWT", "kid": "test-key"}),
            &json!({"sub": "attacker"}),
            "c2ln",
        );

        let err = verifier.verify(&token).await.unwrap_err();

        assert!(matches!(err, AuthError::MalformedToken(_)));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hs256_is_rejected_as_invalid_signature() {
        let (verifier, _) = default_verifier();
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("test-key".to_string());
        // Attacker signs with the public key bytes as HMAC secret
        let token = encode(
            &header,
            &json!({"sub": "attacker"}),
            &EncodingKey::from_secret(ED25519_X.as_bytes()),
        )
        .unwrap();

        let err = verifier.verify(&token).await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn test_alg_not_matching_key_family_is_invalid_signature() {
        let (verifier, _) = default_verifier();
        let token = raw_token(
            &json!({"alg": "RS256", "typ": "JWT", "kid": "test-key"}),
            &json!({"sub": "user-1"}),
            "c2ln",
        );

        let err = verifier.verify(&token).await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn test_unknown_kid_refreshes_once_then_fails() {
        let (verifier, source) = default_verifier();
        verifier
            .verify(&sign(&json!({"sub": "u"}), Some("test-key")))
            .await
            .unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        let err = verifier
            .verify(&sign(&json!({"sub": "u"}), Some("other-key")))
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::UnknownKey("other-key".to_string()));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_token_without_kid_matches_kidless_key() {
        let (verifier, _) = verifier_with_keys(vec![json!({
            "kty": "OKP", "crv": "Ed25519", "x": ED25519_X
        })]);

        let claims = verifier.verify(&sign(&json!({"sub": "u"}), None)).await.unwrap();
        assert_eq!(claims.len(), 1);

        let err = verifier
            .verify(&sign(&json!({"sub": "u"}), Some("named")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn test_tampered_payload_is_invalid_signature() {
        let (verifier, _) = default_verifier();
        let token = sign(&json!({"sub": "user-1"}), Some("test-key"));
        let mut parts = token.split('.');
        let header = parts.next().unwrap();
        let _payload = parts.next().unwrap();
        let signature = parts.next().unwrap();
        let forged = format!(
            "{header}.{}.{signature}",
            URL_SAFE_NO_PAD.encode(r#"{"sub":"admin"}"#)
        );

        let err = verifier.verify(&forged).await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn test_non_object_payload_is_malformed() {
        let (verifier, _) = default_verifier();
        let token = sign(&json!(["not", "an", "object"]), Some("test-key"));

        let err = verifier.verify(&token).await.unwrap_err();

        assert!(matches!(err, AuthError::MalformedToken(_)));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let (verifier, _) = default_verifier();
        let exp = now() - 3600;
        let err = verifier
            .verify(&sign(&json!({"sub": "u", "exp": exp}), Some("test-key")))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::TokenExpired(exp));
    }

    #[tokio::test]
    async fn test_expiry_within_clock_skew_is_accepted() {
        let (verifier, _) = default_verifier();
        let exp = now() - (DEFAULT_CLOCK_SKEW_SECONDS - 2);
        verifier
            .verify(&sign(&json!({"sub": "u", "exp": exp}), Some("test-key")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_not_yet_valid_token() {
        let (verifier, _) = default_verifier();
        let nbf = now() + 3600;
        let err = verifier
            .verify(&sign(&json!({"sub": "u", "nbf": nbf}), Some("test-key")))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::TokenNotYetValid(nbf));
    }

    #[tokio::test]
    async fn test_nbf_within_clock_skew_is_accepted() {
        let (verifier, _) = default_verifier();
        let nbf = now() + (DEFAULT_CLOCK_SKEW_SECONDS - 2);
        verifier
            .verify(&sign(&json!({"sub": "u", "nbf": nbf}), Some("test-key")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_numeric_exp_is_malformed() {
        let (verifier, _) = default_verifier();
        let err = verifier
            .verify(&sign(&json!({"sub": "u", "exp": "tomorrow"}), Some("test-key")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedToken(_)));
    }

    #[tokio::test]
    async fn test_fractional_exp_is_accepted() {
        let (verifier, _) = default_verifier();
        let exp = (now() + 3600) as f64 + 0.5;
        verifier
            .verify(&sign(&json!({"sub": "u", "exp": exp}), Some("test-key")))
            .await
            .unwrap();
    }
}
