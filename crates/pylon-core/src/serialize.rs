//! Payload serialization capability.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error code used when a failure carries no code of its own.
pub const UNKNOWN_ERROR_CODE: &str = "PIT-000";

/// Serialization failures.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// The serializer could not encode the value.
    #[error("serialize failed: {0}")]
    Encode(String),
    /// The serializer could not decode the bytes.
    #[error("deserialize failed: {0}")]
    Decode(String),
}

/// Body of an outbound message before serialization.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Already-serialized bytes, written as-is.
    Raw(Bytes),
    /// A structured value run through the configured serializer.
    Value(serde_json::Value),
}

impl Payload {
    /// Short description for debug logs: byte length for raw payloads, the value otherwise.
    pub fn describe(&self) -> String {
        match self {
            Self::Raw(bytes) => format!("{}bytes", bytes.len()),
            Self::Value(value) => value.to_string(),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self::Raw(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Raw(Bytes::from(value))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(value: &'static [u8]) -> Self {
        Self::Raw(Bytes::from_static(value))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

/// Protocol descriptor advertised to clients during the handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializerMetadata {
    /// Schema descriptor.
    pub messages: String,
    /// Route to schema mapping.
    pub mappings: String,
}

/// Error body sent to the client when the real payload cannot be serialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub msg: String,
}

/// Turns payload values into bytes for the wire.
pub trait Serializer: Send + Sync {
    /// Serializer name, e.g. `"json"`.
    fn name(&self) -> &'static str;

    /// Serialize a structured value.
    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, SerializeError>;

    /// Deserialize bytes into a structured value.
    fn deserialize(&self, data: &[u8]) -> Result<serde_json::Value, SerializeError>;

    /// Schema metadata for the handshake, if the format has any.
    fn metadata(&self) -> Option<SerializerMetadata> {
        None
    }

    /// Serialize a description of `err` to stand in for a payload that failed to serialize.
    fn error_payload(&self, err: &dyn std::error::Error) -> Result<Vec<u8>, SerializeError> {
        let body = ErrorPayload {
            code: UNKNOWN_ERROR_CODE.to_owned(),
            msg: err.to_string(),
        };
        let value =
            serde_json::to_value(&body).map_err(|e| SerializeError::Encode(e.to_string()))?;
        self.serialize(&value)
    }
}

/// Serialize `payload` unless it is already raw bytes.
pub fn serialize_or_raw(
    serializer: &dyn Serializer,
    payload: &Payload,
) -> Result<Bytes, SerializeError> {
    match payload {
        Payload::Raw(bytes) => Ok(bytes.clone()),
        Payload::Value(value) => serializer.serialize(value).map(Bytes::from),
    }
}

/// JSON serializer.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: &serde_json::Value) -> Result<Vec<u8>, SerializeError> {
        serde_json::to_vec(value).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    fn deserialize(&self, data: &[u8]) -> Result<serde_json::Value, SerializeError> {
        serde_json::from_slice(data).map_err(|e| SerializeError::Decode(e.to_string()))
    }
}
