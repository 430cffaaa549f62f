//! Wire format for the dialog socket.
//!
//! One request per connection. The client writes a JSON object followed by a
//! single NUL byte; the dialog writes one JSON object and closes the
//! connection. There is no framing beyond "JSON then EOF" on the reply side.

use thiserror::Error;

use crate::types::{DialogReply, DialogRequest};

/// Byte that terminates a request.
pub const REQUEST_TERMINATOR: u8 = 0;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize or parse a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to read/write to the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Received an invalid message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Peer closed the connection without sending anything.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Encode a request as JSON followed by the terminator byte.
pub fn encode_request(request: &DialogRequest) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(request)?;
    bytes.push(REQUEST_TERMINATOR);
    Ok(bytes)
}

/// Decode a request read up to (and possibly including) the terminator.
pub fn decode_request(bytes: &[u8]) -> Result<DialogRequest, ProtocolError> {
    let body = match bytes.iter().position(|b| *b == REQUEST_TERMINATOR) {
        Some(end) => &bytes[..end],
        None => bytes,
    };
    if body.is_empty() {
        return Err(ProtocolError::ConnectionClosed);
    }
    Ok(serde_json::from_slice(body)?)
}

/// Encode a reply. No terminator: the dialog closes the connection instead.
pub fn encode_reply(reply: &DialogReply) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(reply)?)
}

/// Decode everything the dialog wrote before closing the connection.
pub fn decode_reply(bytes: &[u8]) -> Result<DialogReply, ProtocolError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolError::ConnectionClosed);
    }
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if !value.is_object() {
        return Err(ProtocolError::InvalidMessage(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    }
    Ok(serde_json::from_value(value)?)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
