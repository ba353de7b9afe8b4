//! Strict-mode validation adapter.
//!
//! Validators are pluggable and keyed by sub-protocol name; the engine
//! consults the one matching the negotiated sub-protocol at four
//! checkpoints: outbound call params, inbound call params, inbound call
//! results, and outbound call results.

use serde_json::Value;
use wirecall_protocol::{ErrorCode, WireError};

/// A schema failure reported by a validator.
#[derive(Debug, Clone)]
pub struct SchemaViolation {
    /// The schema keyword that failed (`"required"`, `"type"`, ...).
    /// Drives the translation into a wire error code.
    pub keyword: String,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(keyword: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            message: message.into(),
        }
    }
}

/// Validates payloads against a sub-protocol's schema set.
///
/// Keys follow the `"<Method>.req"` / `"<Method>.conf"` convention — see
/// [`request_key`] and [`response_key`].  A key with no registered schema
/// should be treated as a failure by strict validators.
pub trait SchemaValidator: Send + Sync + 'static {
    fn validate(&self, key: &str, payload: &Value) -> Result<(), SchemaViolation>;
}

/// Schema key for a method's request payload.
pub fn request_key(method: &str) -> String {
    format!("{method}.req")
}

/// Schema key for a method's response payload.
pub fn response_key(method: &str) -> String {
    format!("{method}.conf")
}

/// Translate a schema keyword into the wire error code peers expect.
pub fn violation_code(keyword: &str) -> ErrorCode {
    match keyword {
        "required" | "dependencies" => ErrorCode::OccurenceConstraintViolation,
        "type" => ErrorCode::TypeConstraintViolation,
        "maximum" | "minimum" | "exclusiveMaximum" | "exclusiveMinimum" | "maxLength"
        | "minLength" | "maxItems" | "minItems" | "pattern" | "enum" | "const"
        | "multipleOf" => ErrorCode::PropertyConstraintViolation,
        _ => ErrorCode::FormatViolation,
    }
}

pub(crate) fn violation_to_wire(violation: SchemaViolation) -> WireError {
    WireError::with_description(violation_code(&violation.keyword), violation.message)
}
