//! JSON wire codec for [`Envelope`].

use serde_json::Value;

use super::Envelope;

/// Errors from encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The frame is valid JSON but not an object.
    #[error("envelope must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// The object does not have the envelope shape (e.g. missing `action`).
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Serialization failed.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CodecError {
    /// Whether this is an inbound decode failure (as opposed to encoding).
    pub fn is_decode(&self) -> bool {
        !matches!(self, Self::Encode(_))
    }
}

/// Serialize an envelope to a JSON text frame.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(CodecError::Encode)
}

/// Parse a JSON text frame into an envelope.
pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_str(text).map_err(CodecError::InvalidJson)?;
    if !value.is_object() {
        return Err(CodecError::NotAnObject(json_kind(&value)));
    }
    serde_json::from_value(value).map_err(CodecError::Malformed)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
