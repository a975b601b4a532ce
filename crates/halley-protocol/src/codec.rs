//! Codec for encoding and decoding Bayeux message batches.
//!
//! Clients send either a single JSON object or a JSON array of objects;
//! the server always answers with an array.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

use crate::message::Message;

/// Maximum batch size (16 MiB).
pub const MAX_BATCH_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Batch exceeds maximum size.
    #[error("Batch size {0} exceeds maximum {MAX_BATCH_SIZE}")]
    BatchTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed JSON that is not a message batch.
    #[error("Invalid batch: {0}")]
    Invalid(String),
}

/// Encode a batch of messages as a JSON array.
///
/// # Errors
///
/// Returns an error if the batch is too large or encoding fails.
pub fn encode(messages: &[Message]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(messages, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a batch as a JSON string, for text frames.
///
/// # Errors
///
/// Returns an error if the batch is too large or encoding fails.
pub fn encode_text(messages: &[Message]) -> Result<String, ProtocolError> {
    let payload = serde_json::to_string(messages)?;
    if payload.len() > MAX_BATCH_SIZE {
        return Err(ProtocolError::BatchTooLarge(payload.len()));
    }
    Ok(payload)
}

/// Encode a batch into an existing buffer.
///
/// # Errors
///
/// Returns an error if the batch is too large or encoding fails.
pub fn encode_into(messages: &[Message], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(messages)?;

    if payload.len() > MAX_BATCH_SIZE {
        return Err(ProtocolError::BatchTooLarge(payload.len()));
    }

    buf.reserve(payload.len());
    buf.put_slice(&payload);

    Ok(())
}

/// Decode a batch from bytes.
///
/// # Errors
///
/// Returns an error if the data is too large, not JSON, or not a message batch.
pub fn decode(data: &[u8]) -> Result<Vec<Message>, ProtocolError> {
    if data.len() > MAX_BATCH_SIZE {
        return Err(ProtocolError::BatchTooLarge(data.len()));
    }

    match serde_json::from_slice::<Value>(data)? {
        Value::Object(map) => Ok(vec![Message::from_map(map)]),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(map) => Ok(Message::from_map(map)),
                other => Err(ProtocolError::Invalid(format!(
                    "element {index} is {}, expected an object",
                    json_kind(&other)
                ))),
            })
            .collect(),
        other => Err(ProtocolError::Invalid(format!(
            "batch is {}, expected an object or array",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
