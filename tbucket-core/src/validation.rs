//! Bit-exact name validation for everything that ends up embedded in a key.

use crate::error::ValidationError;
use regex::Regex;
use std::sync::OnceLock;

/// `entity_id` / resource name / limit name: non-empty, at most 128
/// characters, no control characters, no slashes (slashes are the
/// namespace-prefix separator and would corrupt PK parsing).
const MAX_IDENTIFIER_LEN: usize = 128;

/// Namespace names are stricter: letter-initial, alphanumeric-or-hyphen,
/// at most 55 characters total.
fn namespace_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,54}$").expect("static regex is valid"))
}

/// Validates an `entity_id`, resource name, or limit name.
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new(field, value, "must not be empty"));
    }
    if value.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::new(field, value, "must be at most 128 characters"));
    }
    if value.chars().any(char::is_control) {
        return Err(ValidationError::new(field, value, "must not contain control characters"));
    }
    if value.contains('/') {
        return Err(ValidationError::new(field, value, "must not contain '/'"));
    }
    Ok(())
}

/// Validates a namespace name against `[A-Za-z][A-Za-z0-9-]{0,54}`.
pub fn validate_namespace_name(value: &str) -> Result<(), ValidationError> {
    if !namespace_name_regex().is_match(value) {
        return Err(ValidationError::new(
            "namespace_name",
            value,
            "must match [A-Za-z][A-Za-z0-9-]{0,54}",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifier() {
        assert!(validate_identifier("entity_id", "u1").is_ok());
    }

    #[test]
    fn rejects_empty_identifier() {
        assert!(validate_identifier("entity_id", "").is_err());
    }

    #[test]
    fn rejects_identifier_with_slash() {
        assert!(validate_identifier("resource", "gpt-4/turbo").is_err());
    }

    #[test]
    fn rejects_identifier_with_control_char() {
        assert!(validate_identifier("limit_name", "rp\nm").is_err());
    }

    #[test]
    fn rejects_identifier_over_128_chars() {
        let long = "a".repeat(129);
        assert!(validate_identifier("entity_id", &long).is_err());
    }

    #[test]
    fn accepts_identifier_at_128_chars() {
        let exact = "a".repeat(128);
        assert!(validate_identifier("entity_id", &exact).is_ok());
    }

    #[test]
    fn namespace_name_must_start_with_a_letter() {
        assert!(validate_namespace_name("1acme").is_err());
        assert!(validate_namespace_name("acme-1").is_ok());
    }

    #[test]
    fn namespace_name_rejects_over_55_chars() {
        let long = format!("a{}", "b".repeat(55));
        assert!(validate_namespace_name(&long).is_err());
    }
}
