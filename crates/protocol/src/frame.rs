//! Encoding and decoding of the three JSON array frame shapes.

use serde_json::Value;

use crate::error::{ErrorCode, WireError};

/// Numeric message-type discriminants used as element 0 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Call = 2,
    Result = 3,
    Error = 4,
}

impl MessageType {
    fn from_number(n: u64) -> Option<MessageType> {
        match n {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::Result),
            4 => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call {
        id: String,
        method: String,
        params: Value,
    },
    Result {
        id: String,
        payload: Value,
    },
    Error {
        id: String,
        error: WireError,
    },
}

impl Frame {
    pub fn id(&self) -> &str {
        match self {
            Frame::Call { id, .. } | Frame::Result { id, .. } | Frame::Error { id, .. } => id,
        }
    }

    /// Serialize to the wire text form.
    pub fn encode(&self) -> String {
        let value = match self {
            Frame::Call { id, method, params } => {
                serde_json::json!([MessageType::Call as u8, id, method, params])
            }
            Frame::Result { id, payload } => {
                serde_json::json!([MessageType::Result as u8, id, payload])
            }
            Frame::Error { id, error } => serde_json::json!([
                MessageType::Error as u8,
                id,
                error.code.as_str(),
                error.description,
                error.details
            ]),
        };
        value.to_string()
    }
}

/// A structural failure while decoding an inbound message.
///
/// Carries everything the engine needs to react: the mapped error code, the
/// correlation id if one could be extracted, and the message type if element
/// 0 was readable.  Replying with an ERROR frame is forbidden when the
/// offending message was itself a RESULT or ERROR.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {description}")]
pub struct DecodeError {
    pub code: ErrorCode,
    pub description: String,
    /// Correlation id, when element 1 was a readable string.
    pub id: Option<String>,
    /// Message type, when element 0 was a readable number in the known set.
    pub message_type: Option<MessageType>,
}

impl DecodeError {
    fn framework(description: &str) -> Self {
        Self {
            code: ErrorCode::RpcFrameworkError,
            description: description.to_string(),
            id: None,
            message_type: None,
        }
    }

    /// Whether the engine may answer this failure with an ERROR frame.
    ///
    /// Replying to a RESULT or ERROR frame would itself violate the
    /// protocol, so those failures are only surfaced locally.
    pub fn may_reply(&self) -> bool {
        !matches!(
            self.message_type,
            Some(MessageType::Result) | Some(MessageType::Error)
        )
    }
}

/// Decode one inbound text message.
///
/// Validation happens in a fixed order so that every malformed input maps to
/// one specific failure: valid JSON, then array shape, then a numeric
/// message type in the supported set, then a string correlation id, then the
/// per-type payload elements.
pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|_| DecodeError::framework("Message must be a valid JSON structure"))?;

    let items = value
        .as_array()
        .ok_or_else(|| DecodeError::framework("Message must be a JSON array"))?;

    let type_value = items
        .first()
        .filter(|v| v.is_number())
        .ok_or_else(|| DecodeError::framework("Message type must be a number"))?;

    // Element 1 is best-effort at this point: a readable id lets the engine
    // echo it even when the type number is outside the supported set.
    let id_hint = items.get(1).and_then(Value::as_str).map(str::to_string);

    // Numbers outside the supported set (including non-integers) hit the
    // explicit extension-fallback error rather than a generic framework
    // error.
    let message_type = type_value
        .as_u64()
        .and_then(MessageType::from_number)
        .ok_or_else(|| DecodeError {
            code: ErrorCode::MessageTypeNotSupported,
            description: format!("Unsupported message type: {type_value}"),
            id: id_hint.clone(),
            message_type: None,
        })?;

    let id = id_hint.ok_or_else(|| DecodeError {
        code: ErrorCode::RpcFrameworkError,
        description: "Message ID must be a string".to_string(),
        id: None,
        message_type: Some(message_type),
    })?;

    match message_type {
        MessageType::Call => {
            let method = items
                .get(2)
                .and_then(Value::as_str)
                .ok_or_else(|| DecodeError {
                    code: ErrorCode::RpcFrameworkError,
                    description: "Method must be a string".to_string(),
                    id: Some(id.clone()),
                    message_type: Some(MessageType::Call),
                })?
                .to_string();
            let params = items.get(3).cloned().unwrap_or(Value::Null);
            Ok(Frame::Call { id, method, params })
        }
        MessageType::Result => {
            let payload = items.get(2).cloned().unwrap_or(Value::Null);
            Ok(Frame::Result { id, payload })
        }
        MessageType::Error => {
            let code_name = items
                .get(2)
                .and_then(Value::as_str)
                .ok_or_else(|| DecodeError {
                    code: ErrorCode::RpcFrameworkError,
                    description: "Error code must be a string".to_string(),
                    id: Some(id.clone()),
                    message_type: Some(MessageType::Error),
                })?;
            // Codes outside the closed set degrade to GenericError rather
            // than poisoning the whole frame.
            let code = ErrorCode::from_name(code_name).unwrap_or(ErrorCode::GenericError);
            let description = items
                .get(3)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let details = items
                .get(4)
                .cloned()
                .unwrap_or(Value::Object(Default::default()));
            Ok(Frame::Error {
                id,
                error: WireError {
                    code,
                    description,
                    details,
                },
            })
        }
    }
}
