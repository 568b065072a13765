//! Claim set model and claim extraction.
//!
//! A [`ClaimSet`] is the decoded payload of a verified token. Values are kept as
//! a tagged union ([`ClaimValue`]) so extraction can match every shape
//! exhaustively. Claim values may carry personal data, so `Debug` output for
//! the set lists claim names only.

use crate::errors::ClaimError;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A single claim value.
#[derive(Clone, PartialEq)]
pub enum ClaimValue {
    String(String),
    Number(Number),
    Bool(bool),
    Null,
    Map(BTreeMap<String, ClaimValue>),
    Seq(Vec<ClaimValue>),
}

impl ClaimValue {
    /// Name of the value's shape, used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClaimValue::String(_) => "string",
            ClaimValue::Number(_) => "number",
            ClaimValue::Bool(_) => "boolean",
            ClaimValue::Null => "null",
            ClaimValue::Map(_) => "mapping",
            ClaimValue::Seq(_) => "sequence",
        }
    }

    /// Convert back to a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            ClaimValue::String(s) => Value::String(s.clone()),
            ClaimValue::Number(n) => Value::Number(n.clone()),
            ClaimValue::Bool(b) => Value::Bool(*b),
            ClaimValue::Null => Value::Null,
            ClaimValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            ClaimValue::Seq(items) => Value::Array(items.iter().map(ClaimValue::to_json).collect()),
        }
    }
}

impl From<Value> for ClaimValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => ClaimValue::String(s),
            Value::Number(n) => ClaimValue::Number(n),
            Value::Bool(b) => ClaimValue::Bool(b),
            Value::Null => ClaimValue::Null,
            Value::Object(entries) => ClaimValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, ClaimValue::from(v)))
                    .collect(),
            ),
            Value::Array(items) => {
                ClaimValue::Seq(items.into_iter().map(ClaimValue::from).collect())
            }
        }
    }
}

/// Values are not printed; only the shape is.
impl fmt::Debug for ClaimValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.type_name())
    }
}

/// Decoded payload of a token.
///
/// Outside this crate a claim set can only be obtained from
/// [`TokenVerifier::verify`](crate::auth::jwt::TokenVerifier::verify) or as the
/// empty set via [`ClaimSet::empty`].
#[derive(Clone, PartialEq, Default)]
pub struct ClaimSet {
    claims: BTreeMap<String, ClaimValue>,
}

impl ClaimSet {
    /// The claim set used when verification failed and the gate continues
    /// anyway. Every extraction from it fails with `NotFound`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a claim set from a payload whose signature has been verified.
    pub(crate) fn from_verified_payload(payload: Map<String, Value>) -> Self {
        Self {
            claims: payload
                .into_iter()
                .map(|(k, v)| (k, ClaimValue::from(v)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ClaimValue> {
        self.claims.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Claim names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.claims.keys().map(String::as_str)
    }

    /// The claim set as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.claims
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl fmt::Debug for ClaimSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimSet")
            .field("names", &self.claims.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Invalid claim path syntax.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimPathError {
    #[error("claim path must not be empty")]
    Empty,

    #[error("claim path '{0}' contains an empty segment")]
    EmptySegment(String),
}

/// Dotted location of a claim, e.g. `user.email`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPath {
    raw: String,
    segments: Vec<String>,
}

impl ClaimPath {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for ClaimPath {
    type Err = ClaimPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ClaimPathError::Empty);
        }

        let segments: Vec<String> = trimmed.split('.').map(str::to_string).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(ClaimPathError::EmptySegment(trimmed.to_string()));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }
}

impl fmt::Display for ClaimPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Extract the string form of the claim at `path`.
///
/// Strings are returned as-is, numbers in their JSON representation and
/// booleans as `true`/`false`. Mappings, sequences and null cannot be rendered
/// and yield `TypeMismatch`, as does walking through a non-mapping value.
pub fn extract(claims: &ClaimSet, path: &ClaimPath) -> Result<String, ClaimError> {
    let not_found = || ClaimError::NotFound {
        path: path.to_string(),
    };

    let mut segments = path.segments().iter();
    let first = segments.next().ok_or_else(not_found)?;
    let mut current = claims.get(first).ok_or_else(not_found)?;

    for segment in segments {
        current = match current {
            ClaimValue::Map(entries) => entries.get(segment).ok_or_else(not_found)?,
            other => {
                return Err(ClaimError::TypeMismatch {
                    path: path.to_string(),
                    found: other.type_name(),
                })
            }
        };
    }

    match current {
        ClaimValue::String(s) => Ok(s.clone()),
        ClaimValue::Number(n) => Ok(n.to_string()),
        ClaimValue::Bool(b) => Ok(b.to_string()),
        other @ (ClaimValue::Null | ClaimValue::Map(_) | ClaimValue::Seq(_)) => {
            Err(ClaimError::TypeMismatch {
                path: path.to_string(),
                found: other.type_name(),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claim_set(payload: Value) -> ClaimSet {
        ClaimSet::from_verified_payload(payload.as_object().cloned().unwrap())
    }

    fn path(s: &str) -> ClaimPath {
        s.parse().unwrap()
    }

    #[test]
    fn test_extract_top_level_string() {
        let claims = claim_set(json!({"email": "a@b.com", "sub": "a@b.com"}));
        assert_eq!(extract(&claims, &path("email")).unwrap(), "a@b.com");
    }

    #[test]
    fn test_extract_nested_string() {
        let claims = claim_set(json!({"user": {"profile": {"email": "nested@example.com"}}}));
        assert_eq!(
            extract(&claims, &path("user.profile.email")).unwrap(),
            "nested@example.com"
        );
    }

    #[test]
    fn test_extract_numbers_and_booleans() {
        let claims = claim_set(json!({"id": 42, "ratio": 1.5, "neg": -7, "admin": true, "guest": false}));
        assert_eq!(extract(&claims, &path("id")).unwrap(), "42");
        assert_eq!(extract(&claims, &path("ratio")).unwrap(), "1.5");
        assert_eq!(extract(&claims, &path("neg")).unwrap(), "-7");
        assert_eq!(extract(&claims, &path("admin")).unwrap(), "true");
        assert_eq!(extract(&claims, &path("guest")).unwrap(), "false");
    }

    #[test]
    fn test_extract_empty_string_is_returned() {
        let claims = claim_set(json!({"name": ""}));
        assert_eq!(extract(&claims, &path("name")).unwrap(), "");
    }

    #[test]
    fn test_extract_missing_claim() {
        let claims = claim_set(json!({"email": "a@b.com"}));
        let err = extract(&claims, &path("name")).unwrap_err();
        assert_eq!(
            err,
            ClaimError::NotFound {
                path: "name".to_string()
            }
        );
    }

    #[test]
    fn test_extract_missing_nested_segment() {
        let claims = claim_set(json!({"user": {"id": "u-1"}}));
        let err = extract(&claims, &path("user.email")).unwrap_err();
        assert!(matches!(err, ClaimError::NotFound { path } if path == "user.email"));
    }

    #[test]
    fn test_extract_through_non_mapping_is_type_mismatch() {
        let claims = claim_set(json!({"user": "flat"}));
        let err = extract(&claims, &path("user.email")).unwrap_err();
        assert_eq!(
            err,
            ClaimError::TypeMismatch {
                path: "user.email".to_string(),
                found: "string"
            }
        );
    }

    #[test]
    fn test_extract_unrenderable_terminals() {
        let claims = claim_set(json!({
            "groups": ["a", "b"],
            "profile": {"x": 1},
            "nothing": null
        }));

        for (name, found) in [
            ("groups", "sequence"),
            ("profile", "mapping"),
            ("nothing", "null"),
        ] {
            let err = extract(&claims, &path(name)).unwrap_err();
            assert_eq!(
                err,
                ClaimError::TypeMismatch {
                    path: name.to_string(),
                    found
                },
                "claim {name}"
            );
        }
    }

    #[test]
    fn test_extract_from_empty_set_is_not_found() {
        let err = extract(&ClaimSet::empty(), &path("email")).unwrap_err();
        assert_eq!(err.kind(), "claim_not_found");
    }

    #[test]
    fn test_extract_is_idempotent() {
        let claims = claim_set(json!({"user": {"email": "a@b.com"}, "groups": []}));
        let p = path("user.email");
        let first = extract(&claims, &p);
        let second = extract(&claims, &p);
        assert_eq!(first, second);

        let p = path("groups");
        assert_eq!(extract(&claims, &p), extract(&claims, &p));
    }

    #[test]
    fn test_claim_path_parsing() {
        let p = path("user.email");
        assert_eq!(p.segments(), &["user".to_string(), "email".to_string()]);
        assert_eq!(p.to_string(), "user.email");

        assert_eq!(" sub ".parse::<ClaimPath>().unwrap().as_str(), "sub");
        assert_eq!("".parse::<ClaimPath>(), Err(ClaimPathError::Empty));
        assert_eq!(
            "user..email".parse::<ClaimPath>(),
            Err(ClaimPathError::EmptySegment("user..email".to_string()))
        );
        assert!(".email".parse::<ClaimPath>().is_err());
        assert!("email.".parse::<ClaimPath>().is_err());
    }

    #[test]
    fn test_claim_set_round_trips_payload() {
        let payload = json!({"sub": "u", "n": 3, "nested": {"list": [1, "two", null]}});
        let claims = claim_set(payload.clone());
        assert_eq!(claims.to_json(), payload);
        assert_eq!(claims.len(), 3);
    }

    #[test]
    fn test_claim_set_debug_hides_values() {
        let claims = claim_set(json!({"email": "secret@example.com", "sub": "user-123"}));
        let debug_str = format!("{:?}", claims);

        assert!(debug_str.contains("email"));
        assert!(debug_str.contains("sub"));
        assert!(
            !debug_str.contains("secret@example.com"),
            "Debug output should not contain claim values"
        );
        assert!(!debug_str.contains("user-123"));
    }

    #[test]
    fn test_claim_value_debug_shows_shape_only() {
        let value = ClaimValue::String("private".to_string());
        assert_eq!(format!("{:?}", value), "<string>");
    }
}
