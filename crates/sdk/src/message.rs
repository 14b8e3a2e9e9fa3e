//! Message payloads and the envelope that carries them.
//!
//! A [`Payload`] is the decoded, format-independent value a codec produces
//! or consumes. An [`Envelope`] binds a payload to its format name and a
//! timestamp: the reception instant for inbound messages, the creation
//! instant for outbound ones. Envelopes are immutable once built.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{IotError, Result};

/// Decoded message data.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured data, produced by the `json` codec.
    Json(serde_json::Value),
    /// Unicode text, produced by the `text` and `xml` codecs.
    Text(String),
    /// Raw bytes, produced by the `binary` codec.
    Binary(Bytes),
}

impl Payload {
    /// Serializes any `Serialize` value into a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|e| IotError::Serialization(e.to_string()))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Deserializes a JSON payload into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Payload::Json(value) => {
                T::deserialize(value).map_err(|e| IotError::InvalidPayload(e.to_string()))
            }
            other => Err(IotError::InvalidPayload(format!(
                "expected a JSON payload, got {}",
                other.kind()
            ))),
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Json(_) => "json",
            Payload::Text(_) => "text",
            Payload::Binary(_) => "binary",
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Binary(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(value))
    }
}

/// An immutable decoded message together with its format and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    data: Payload,
    timestamp: OffsetDateTime,
    format: String,
}

impl Envelope {
    pub fn new(format: impl Into<String>, data: Payload, timestamp: OffsetDateTime) -> Self {
        Self {
            data,
            timestamp,
            format: format.into(),
        }
    }

    /// Envelope for an outbound message, stamped with the current UTC time.
    pub fn outbound(format: impl Into<String>, data: Payload) -> Self {
        Self::new(format, data, OffsetDateTime::now_utc())
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn into_data(self) -> Payload {
        self.data
    }
}
