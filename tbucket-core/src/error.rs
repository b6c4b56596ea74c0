//! Public error taxonomy (shapes, not store-specific wire errors).
//!
//! Transport- and conflict-class errors carry enough detail for the engine
//! to decide retry policy; everything else is the domain's normal failure
//! signal and is never retried by the library itself.

use serde::Serialize;
use thiserror::Error;

/// A single field that failed validation.
#[derive(Debug, Clone, Error)]
#[error("invalid {field}: {reason} (value: {value:?})")]
pub struct ValidationError {
    pub field: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl ValidationError {
    #[must_use]
    pub fn new(field: &'static str, value: impl Into<String>, reason: &'static str) -> Self {
        Self {
            field,
            value: value.into(),
            reason,
        }
    }
}

/// Which side of a cascade a rate-limit violation occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[serde(rename = "self")]
    SelfEntity,
    Parent,
}

/// One violated limit within a `RateLimitExceeded`.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub entity_id: String,
    pub limit_name: String,
    pub resource: String,
    pub available: i64,
    pub exceeded: bool,
    pub retry_after_seconds: f64,
    pub side: Side,
}

/// Raised when one or more buckets touched by an `acquire` lacked capacity.
/// No bucket in the attempted set is ever mutated when this is raised.
#[derive(Debug, Clone, Error)]
#[error("rate limit exceeded, retry after {retry_after_seconds:.3}s")]
pub struct RateLimitExceeded {
    pub violations: Vec<Violation>,
    /// Max `retry_after_seconds` across `violations`.
    pub retry_after_seconds: f64,
}

impl RateLimitExceeded {
    /// Builds the error from a non-empty set of violations, computing the
    /// top-level `retry_after_seconds` as the max across them.
    ///
    /// # Panics
    ///
    /// Panics if `violations` is empty — a `RateLimitExceeded` with no
    /// violations is a programming error in the caller, not a valid result.
    #[must_use]
    pub fn new(violations: Vec<Violation>) -> Self {
        let retry_after_seconds = violations
            .iter()
            .map(|v| v.retry_after_seconds)
            .fold(0.0_f64, f64::max);
        assert!(!violations.is_empty(), "RateLimitExceeded requires at least one violation");
        Self {
            violations,
            retry_after_seconds,
        }
    }

    /// The exact serializable shape external callers (e.g. an HTTP
    /// adapter) depend on, including an HTTP-ready `Retry-After` header
    /// value.
    #[must_use]
    pub fn as_dict(&self) -> RateLimitExceededDict<'_> {
        RateLimitExceededDict {
            error: "rate_limit_exceeded",
            message: self.to_string(),
            retry_after_seconds: self.retry_after_seconds,
            retry_after_header: self.retry_after_seconds.ceil().max(0.0) as u64,
            limits: &self.violations,
        }
    }
}

/// Serializable view of [`RateLimitExceeded`]; `retry_after_header` is
/// rendered as a string by `Display`/`serde_json` the same way an HTTP
/// `Retry-After` header would be.
#[derive(Debug, Serialize)]
pub struct RateLimitExceededDict<'a> {
    pub error: &'static str,
    pub message: String,
    pub retry_after_seconds: f64,
    #[serde(serialize_with = "serialize_as_string")]
    pub retry_after_header: u64,
    pub limits: &'a [Violation],
}

fn serialize_as_string<S: serde::Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

/// The library's public error type. Transport-class variants
/// (`ConflictExhausted`, `Transport`) are distinct from `RateLimitExceeded`
/// so callers can tell domain rejection apart from infrastructure failure.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error(transparent)]
    RateLimitExceeded(#[from] RateLimitExceeded),

    #[error("no limits resolvable for this call and none were supplied")]
    LimitsUnavailable,

    #[error("entity already exists: {0}")]
    EntityExists(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("acquire retry budget exhausted due to contention")]
    ConflictExhausted,

    #[error("store transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(available: i64, retry_after: f64, side: Side) -> Violation {
        Violation {
            entity_id: "u1".into(),
            limit_name: "rpm".into(),
            resource: "api".into(),
            available,
            exceeded: true,
            retry_after_seconds: retry_after,
            side,
        }
    }

    #[test]
    fn retry_after_is_max_across_violations() {
        let err = RateLimitExceeded::new(vec![violation(0, 1.0, Side::SelfEntity), violation(0, 12.0, Side::Parent)]);
        assert_eq!(err.retry_after_seconds, 12.0);
    }

    #[test]
    fn as_dict_serializes_expected_shape() {
        let err = RateLimitExceeded::new(vec![violation(0, 11.6, Side::SelfEntity)]);
        let json = serde_json::to_value(err.as_dict()).unwrap();
        assert_eq!(json["error"], "rate_limit_exceeded");
        assert_eq!(json["retry_after_header"], "12");
        assert_eq!(json["limits"][0]["side"], "self");
    }

    #[test]
    #[should_panic(expected = "at least one violation")]
    fn rejects_empty_violations() {
        RateLimitExceeded::new(vec![]);
    }
}
