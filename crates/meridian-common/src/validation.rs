//! Input validation utilities.
//!
//! Centralized validation helpers used across API routes.

use std::sync::LazyLock;
use validator::Validate;

use crate::error::RelayError;

/// Permissive email pattern: tolerates unicode domains and a trailing-dot
/// FQDN, strict enough to reject obviously malformed input.
pub static EMAIL_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[^\s@]{1,64}@[^\s@]+\.[^\s@]{2,}\.?$").unwrap()
});

/// Validate a request body, returning a `RelayError::ValidationFail` on failure.
pub fn validate_request<T: Validate>(body: &T) -> Result<(), RelayError> {
    body.validate().map_err(|e| RelayError::validation(format_validation_errors(e)))
}

/// Format validation errors into a human-readable string.
fn format_validation_errors(errors: validator::ValidationErrors) -> String {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                e.message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Invalid value for '{field}'"))
            })
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate an email address against [`EMAIL_REGEX`].
pub fn validate_email(email: &str) -> Result<(), RelayError> {
    if EMAIL_REGEX.is_match(email) {
        Ok(())
    } else {
        Err(RelayError::validation("Invalid email address"))
    }
}

/// Validate a client-generated UUID string, returning the parsed value.
pub fn validate_uuid(raw: &str, field: &str) -> Result<uuid::Uuid, RelayError> {
    uuid::Uuid::parse_str(raw)
        .map_err(|_| RelayError::validation(format!("'{field}' must be a valid UUID")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_emails() {
        assert!(validate_email("a@x.org").is_ok());
        assert!(validate_email("five@sub.domain.co.").is_ok());
    }

    #[test]
    fn rejects_malformed_emails() {
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("@missing-local.com").is_err());
        assert!(validate_email("spaces in@email.com").is_err());
    }

    #[test]
    fn validate_uuid_rejects_garbage() {
        assert!(validate_uuid("not-a-uuid", "clientId").is_err());
        assert!(validate_uuid("11111111-1111-4111-8111-111111111111", "clientId").is_ok());
    }
}
