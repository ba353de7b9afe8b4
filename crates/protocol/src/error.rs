//! The closed set of protocol error codes and the ERROR-frame payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sub-protocol whose published documents misspell two error codes.  Frames
/// sent under this sub-protocol must carry the historical spellings.
pub const LEGACY_SUBPROTOCOL: &str = "ocpp1.6";

/// Wire error codes.
///
/// The set is closed: peers depend on the exact spellings, including the
/// historical misspellings `FormationViolation` and
/// `OccurenceConstraintViolation`, which are kept as distinct codes rather
/// than collapsed into their corrected forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    GenericError,
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormatViolation,
    /// Legacy spelling of [`ErrorCode::FormatViolation`].
    FormationViolation,
    PropertyConstraintViolation,
    /// Legacy spelling of [`ErrorCode::OccurrenceConstraintViolation`].
    OccurenceConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    MessageTypeNotSupported,
    RpcFrameworkError,
}

impl ErrorCode {
    /// The exact string carried on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::GenericError => "GenericError",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
        }
    }

    /// Parse a wire code string.  Returns `None` for anything outside the
    /// closed set.
    pub fn from_name(name: &str) -> Option<ErrorCode> {
        Some(match name {
            "GenericError" => ErrorCode::GenericError,
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "InternalError" => ErrorCode::InternalError,
            "ProtocolError" => ErrorCode::ProtocolError,
            "SecurityError" => ErrorCode::SecurityError,
            "FormatViolation" => ErrorCode::FormatViolation,
            "FormationViolation" => ErrorCode::FormationViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "OccurenceConstraintViolation" => ErrorCode::OccurenceConstraintViolation,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            "MessageTypeNotSupported" => ErrorCode::MessageTypeNotSupported,
            "RpcFrameworkError" => ErrorCode::RpcFrameworkError,
            _ => return None,
        })
    }

    /// Default human-readable description for this code.
    pub fn default_description(&self) -> &'static str {
        match self {
            ErrorCode::GenericError => "Generic error",
            ErrorCode::NotImplemented => {
                "Requested method is not known by receiver and cannot be handled"
            }
            ErrorCode::NotSupported => {
                "Requested method is recognized but not supported by the receiver"
            }
            ErrorCode::InternalError => {
                "An internal error occurred and the receiver was not able to process the request"
            }
            ErrorCode::ProtocolError => "Payload for method is incomplete",
            ErrorCode::SecurityError => {
                "During the processing of the method a security issue occurred"
            }
            ErrorCode::FormatViolation | ErrorCode::FormationViolation => {
                "Payload for the method is syntactically incorrect"
            }
            ErrorCode::PropertyConstraintViolation => {
                "Payload is syntactically correct but at least one field contains an invalid value"
            }
            ErrorCode::OccurenceConstraintViolation
            | ErrorCode::OccurrenceConstraintViolation => {
                "Payload is syntactically correct but at least one of the fields violates occurrence constraints"
            }
            ErrorCode::TypeConstraintViolation => {
                "Payload is syntactically correct but at least one of the fields violates data type constraints"
            }
            ErrorCode::MessageTypeNotSupported => {
                "A message with a message type number received that is not supported by this implementation"
            }
            ErrorCode::RpcFrameworkError => {
                "Content of the call is not a valid RPC request"
            }
        }
    }

    /// Apply the legacy sub-protocol respelling quirk.
    ///
    /// Under [`LEGACY_SUBPROTOCOL`] the wire spellings differ:
    /// `FormatViolation` is written `FormationViolation` and
    /// `OccurenceConstraintViolation` is written
    /// `OccurrenceConstraintViolation`.  All other codes pass through.
    pub fn respelled_for(self, subprotocol: Option<&str>) -> ErrorCode {
        if subprotocol != Some(LEGACY_SUBPROTOCOL) {
            return self;
        }
        match self {
            ErrorCode::FormatViolation => ErrorCode::FormationViolation,
            ErrorCode::OccurenceConstraintViolation => {
                ErrorCode::OccurrenceConstraintViolation
            }
            other => other,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The payload of an ERROR frame: code, description, and free-form details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl WireError {
    /// An error carrying the code's default description and empty details.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            description: code.default_description().to_string(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_description(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}
