//! Auth proxy configuration.
//!
//! Configuration is loaded from environment variables. Passwords embedded in
//! URLs are removed from Debug output.

use crate::auth::gate::{ClaimMapping, VerifyFailurePolicy};
use crate::auth::jwks::DEFAULT_FETCH_TIMEOUT_SECONDS;
use crate::auth::jwt::{DEFAULT_CLOCK_SKEW_SECONDS, MAX_CLOCK_SKEW_SECONDS};
use crate::auth::ClaimPath;
use crate::middleware::TrustedHeaders;
use axum::http::{HeaderName, HeaderValue};
use reqwest::Url;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default server bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default access-token cookie name.
pub const DEFAULT_COOKIE_NAME: &str = "access_token";

/// Default login redirect path.
pub const DEFAULT_LOGIN_REDIRECT_PATH: &str = "/auth";

/// Default claim path for every identity value.
pub const DEFAULT_LOGIN_CLAIM: &str = "email";
pub const DEFAULT_EMAIL_CLAIM: &str = "email";
pub const DEFAULT_NAME_CLAIM: &str = "name";

pub const DEFAULT_USER_HEADER: &str = "X-WEBAUTH-USER";
pub const DEFAULT_EMAIL_HEADER: &str = "X-WEBAUTH-EMAIL";
pub const DEFAULT_NAME_HEADER: &str = "X-WEBAUTH-NAME";

/// Default backend request timeout in seconds.
pub const DEFAULT_BACKEND_TIMEOUT_SECONDS: u64 = 30;

/// Prefix reserved for the proxy's own endpoints.
pub const OPS_PATH_PREFIX: &str = "/-/";

/// Auth proxy configuration.
#[derive(Clone)]
pub struct Config {
    /// Server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Backend every authenticated request is forwarded to.
    pub proxy_target: Url,

    /// Path prefix the proxy serves. Always starts with `/` and never ends
    /// with one, except for the root path itself.
    pub base_path: String,

    pub cookie_name: String,

    /// Identity provider JWKS endpoint.
    pub jwks_url: Url,

    pub login_redirect_path: String,

    pub claims: ClaimMapping,

    pub trusted_headers: TrustedHeaders,

    pub verify_failure_policy: VerifyFailurePolicy,

    /// JWT clock skew tolerance in seconds for exp/nbf validation.
    pub jwt_clock_skew_seconds: i64,

    pub keyset_fetch_timeout_seconds: u64,

    /// Maximum keyset age before a lookup refetches. `None` disables expiry.
    pub keyset_max_age_seconds: Option<u64>,

    pub backend_timeout_seconds: u64,

    /// Time to keep serving after a shutdown signal.
    pub drain_seconds: u64,
}

/// Custom Debug implementation that drops URL passwords.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("proxy_target", &redact_url(&self.proxy_target))
            .field("base_path", &self.base_path)
            .field("cookie_name", &self.cookie_name)
            .field("jwks_url", &redact_url(&self.jwks_url))
            .field("login_redirect_path", &self.login_redirect_path)
            .field("claims", &self.claims)
            .field("trusted_headers", &self.trusted_headers)
            .field("verify_failure_policy", &self.verify_failure_policy)
            .field("jwt_clock_skew_seconds", &self.jwt_clock_skew_seconds)
            .field(
                "keyset_fetch_timeout_seconds",
                &self.keyset_fetch_timeout_seconds,
            )
            .field("keyset_max_age_seconds", &self.keyset_max_age_seconds)
            .field("backend_timeout_seconds", &self.backend_timeout_seconds)
            .field("drain_seconds", &self.drain_seconds)
            .finish()
    }
}

fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    // Only fails for URLs that cannot carry credentials in the first place
    let _ = redacted.set_password(None);
    redacted.to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid URL configuration: {0}")]
    InvalidUrl(String),

    #[error("Invalid path configuration: {0}")]
    InvalidPath(String),

    #[error("Invalid cookie name: {0}")]
    InvalidCookieName(String),

    #[error("Invalid claim path configuration: {0}")]
    InvalidClaimPath(String),

    #[error("Invalid header name configuration: {0}")]
    InvalidHeaderName(String),

    #[error("Invalid verify failure mode: {0}")]
    InvalidVerifyFailureMode(String),

    #[error("Invalid JWT clock skew configuration: {0}")]
    InvalidJwtClockSkew(String),

    #[error("Invalid duration configuration: {0}")]
    InvalidDuration(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let proxy_target = required_url(vars, "PROXY_TARGET")?;
        let jwks_url = required_url(vars, "JWKS_URL")?;

        let base_path = normalize_base_path(
            vars.get("BASE_PATH").map(String::as_str).unwrap_or("/"),
        )?;

        let cookie_name = vars
            .get("ACCESS_TOKEN_COOKIE_NAME")
            .cloned()
            .unwrap_or_else(|| DEFAULT_COOKIE_NAME.to_string());
        if cookie_name.is_empty()
            || cookie_name
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || ";,=\"".contains(c))
        {
            return Err(ConfigError::InvalidCookieName(format!(
                "ACCESS_TOKEN_COOKIE_NAME must be a non-empty cookie token, got '{}'",
                cookie_name
            )));
        }

        let login_redirect_path = vars
            .get("LOGIN_REDIRECT_PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOGIN_REDIRECT_PATH.to_string());
        if login_redirect_path.trim().is_empty() {
            return Err(ConfigError::InvalidPath(
                "LOGIN_REDIRECT_PATH must not be empty".to_string(),
            ));
        }
        if HeaderValue::from_str(&login_redirect_path).is_err() {
            return Err(ConfigError::InvalidPath(
                "LOGIN_REDIRECT_PATH must be a valid Location header value".to_string(),
            ));
        }

        let claims = ClaimMapping {
            login: claim_path(
                vars,
                "SYNC_LOGIN_OR_EMAIL_CLAIM_ATTRIBUTE",
                DEFAULT_LOGIN_CLAIM,
            )?,
            email: claim_path(vars, "SYNC_EMAIL_CLAIM_ATTRIBUTE", DEFAULT_EMAIL_CLAIM)?,
            name: claim_path(vars, "SYNC_NAME_CLAIM_ATTRIBUTE", DEFAULT_NAME_CLAIM)?,
        };

        let trusted_headers = TrustedHeaders {
            user: header_name(vars, "USER_HEADER", DEFAULT_USER_HEADER)?,
            email: header_name(vars, "EMAIL_HEADER", DEFAULT_EMAIL_HEADER)?,
            name: header_name(vars, "NAME_HEADER", DEFAULT_NAME_HEADER)?,
        };

        let verify_failure_policy = match vars.get("VERIFY_FAILURE_MODE") {
            Some(value) => value
                .parse()
                .map_err(|e| ConfigError::InvalidVerifyFailureMode(format!("{e}")))?,
            None => VerifyFailurePolicy::default(),
        };

        // Parse JWT clock skew tolerance with validation
        let jwt_clock_skew_seconds = if let Some(value_str) = vars.get("JWT_CLOCK_SKEW_SECONDS") {
            let value: i64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must be a valid integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value < 0 {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must not be negative, got {}",
                    value
                )));
            }

            if value > MAX_CLOCK_SKEW_SECONDS {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                    MAX_CLOCK_SKEW_SECONDS, value
                )));
            }

            value
        } else {
            DEFAULT_CLOCK_SKEW_SECONDS
        };

        let keyset_fetch_timeout_seconds = positive_seconds(
            vars,
            "KEYSET_FETCH_TIMEOUT_SECONDS",
        )?
        .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECONDS);

        let keyset_max_age_seconds = positive_seconds(vars, "KEYSET_MAX_AGE_SECONDS")?;

        let backend_timeout_seconds = positive_seconds(vars, "BACKEND_TIMEOUT_SECONDS")?
            .unwrap_or(DEFAULT_BACKEND_TIMEOUT_SECONDS);

        let drain_seconds = match vars.get("DRAIN_SECONDS") {
            Some(value_str) => value_str.parse().map_err(|e| {
                ConfigError::InvalidDuration(format!(
                    "DRAIN_SECONDS must be a valid non-negative integer, got '{}': {}",
                    value_str, e
                ))
            })?,
            None => 0,
        };

        Ok(Config {
            bind_address,
            proxy_target,
            base_path,
            cookie_name,
            jwks_url,
            login_redirect_path,
            claims,
            trusted_headers,
            verify_failure_policy,
            jwt_clock_skew_seconds,
            keyset_fetch_timeout_seconds,
            keyset_max_age_seconds,
            backend_timeout_seconds,
            drain_seconds,
        })
    }
}

fn required_url(vars: &HashMap<String, String>, name: &str) -> Result<Url, ConfigError> {
    let value = vars
        .get(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))?;

    let url = Url::parse(value.trim()).map_err(|e| {
        ConfigError::InvalidUrl(format!("{} must be an absolute URL, got '{}': {}", name, value, e))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl(format!(
            "{} must use http or https, got '{}'",
            name,
            url.scheme()
        )));
    }

    Ok(url)
}

/// Leading `/`, no trailing `/`, no route syntax.
fn normalize_base_path(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }

    let path = format!("/{trimmed}");
    if path.contains(['*', ':', '?', '#']) || path.contains("//") {
        return Err(ConfigError::InvalidPath(format!(
            "BASE_PATH must be a plain path, got '{}'",
            raw
        )));
    }

    if path == "/-" || path.starts_with(OPS_PATH_PREFIX) {
        return Err(ConfigError::InvalidPath(format!(
            "BASE_PATH must not use the reserved prefix '{}', got '{}'",
            OPS_PATH_PREFIX, raw
        )));
    }

    Ok(path)
}

fn claim_path(
    vars: &HashMap<String, String>,
    name: &str,
    default: &str,
) -> Result<ClaimPath, ConfigError> {
    let raw = vars.get(name).map(String::as_str).unwrap_or(default);
    raw.parse()
        .map_err(|e| ConfigError::InvalidClaimPath(format!("{}: {}", name, e)))
}

fn header_name(
    vars: &HashMap<String, String>,
    name: &str,
    default: &str,
) -> Result<HeaderName, ConfigError> {
    let raw = vars.get(name).map(String::as_str).unwrap_or(default);
    HeaderName::from_bytes(raw.trim().as_bytes()).map_err(|_| {
        ConfigError::InvalidHeaderName(format!(
            "{} must be a valid HTTP header name, got '{}'",
            name, raw
        ))
    })
}

/// Parse an optional strictly positive number of seconds.
fn positive_seconds(
    vars: &HashMap<String, String>,
    name: &str,
) -> Result<Option<u64>, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(None);
    };

    let value: u64 = value_str.parse().map_err(|e| {
        ConfigError::InvalidDuration(format!(
            "{} must be a valid positive integer, got '{}': {}",
            name, value_str, e
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidDuration(format!(
            "{} must be greater than 0",
            name
        )));
    }

    Ok(Some(value))
}
