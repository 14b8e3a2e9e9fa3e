//! Format-keyed codec registry.
//!
//! Every message on the platform names its format in the topic
//! (`.../fmt/{format}`). The registry maps that name to a [`Codec`] which
//! turns an outbound [`Envelope`] into bytes and inbound bytes into a
//! [`Payload`].
//!
//! # Built-in formats
//!
//! | format   | payload            | wire form          |
//! |----------|--------------------|--------------------|
//! | `json`   | `Payload::Json`    | UTF-8 JSON         |
//! | `text`   | `Payload::Text`    | UTF-8 text         |
//! | `xml`    | `Payload::Text`    | UTF-8 text (alias) |
//! | `binary` | `Payload::Binary`  | base64 text        |
//!
//! Unknown formats fail with `IotError::UnsupportedFormat` on both paths.
//! Registration is guarded by a lock so codecs can be added while a client
//! is running; re-registering a format replaces the previous codec.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{IotError, Result};
use crate::message::{Envelope, Payload};

/// Encodes envelopes for one message format and decodes its payloads.
pub trait Codec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;
    fn decode(&self, raw: &[u8]) -> Result<Payload>;
}

/// JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let result = match envelope.data() {
            Payload::Json(value) => serde_json::to_vec(value),
            Payload::Text(text) => serde_json::to_vec(text),
            Payload::Binary(_) => {
                return Err(IotError::Serialization(
                    "binary data can't be encoded as json, use the binary format".to_string(),
                ))
            }
        };
        result.map_err(|e| IotError::Serialization(e.to_string()))
    }

    fn decode(&self, raw: &[u8]) -> Result<Payload> {
        serde_json::from_slice(raw).map(Payload::Json).map_err(|e| {
            IotError::InvalidPayload(format!(
                "Unable to parse JSON. payload=\"{}\" error={e}",
                String::from_utf8_lossy(raw)
            ))
        })
    }
}

/// UTF-8 text codec, also registered as `xml`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        match envelope.data() {
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
            Payload::Json(serde_json::Value::String(text)) => Ok(text.as_bytes().to_vec()),
            other => Err(IotError::Serialization(format!(
                "{} data can't be encoded as {}",
                other.kind(),
                envelope.format()
            ))),
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<Payload> {
        std::str::from_utf8(raw)
            .map(|text| Payload::Text(text.to_string()))
            .map_err(|e| IotError::InvalidPayload(format!("Unable to decode text payload: {e}")))
    }
}

/// Binary codec: raw bytes travel as base64 text.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        match envelope.data() {
            Payload::Binary(bytes) => Ok(STANDARD.encode(bytes).into_bytes()),
            other => Err(IotError::Serialization(format!(
                "{} data can't be encoded as binary",
                other.kind()
            ))),
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<Payload> {
        STANDARD
            .decode(raw)
            .map(|bytes| Payload::Binary(Bytes::from(bytes)))
            .map_err(|e| IotError::InvalidPayload(format!("Unable to decode base64 payload: {e}")))
    }
}

/// Codec assembled from a pair of closures.
pub struct FnCodec<E, D> {
    encode: E,
    decode: D,
}

impl<E, D> FnCodec<E, D>
where
    E: Fn(&Envelope) -> Result<Vec<u8>> + Send + Sync,
    D: Fn(&[u8]) -> Result<Payload> + Send + Sync,
{
    pub fn new(encode: E, decode: D) -> Self {
        Self { encode, decode }
    }
}

impl<E, D> Codec for FnCodec<E, D>
where
    E: Fn(&Envelope) -> Result<Vec<u8>> + Send + Sync,
    D: Fn(&[u8]) -> Result<Payload> + Send + Sync,
{
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        (self.encode)(envelope)
    }

    fn decode(&self, raw: &[u8]) -> Result<Payload> {
        (self.decode)(raw)
    }
}

/// Thread-safe map from format name to codec.
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn Codec>>>,
}

impl CodecRegistry {
    /// A registry with no codecs at all.
    pub fn empty() -> Self {
        Self {
            codecs: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in `json`, `text`, `xml` and `binary` codecs.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register("json", JsonCodec);
        registry.register("text", TextCodec);
        registry.register("xml", TextCodec);
        registry.register("binary", BinaryCodec);
        registry
    }

    /// Registers `codec` for `format`, replacing any existing codec.
    pub fn register(&self, format: impl Into<String>, codec: impl Codec + 'static) {
        let format = format.into();
        debug!(format = %format, "Registering message codec");
        let mut codecs = self.codecs.write().unwrap_or_else(|e| e.into_inner());
        codecs.insert(format, Arc::new(codec));
    }

    /// Registers a codec built from an encode and a decode closure.
    pub fn register_fn<E, D>(&self, format: impl Into<String>, encode: E, decode: D)
    where
        E: Fn(&Envelope) -> Result<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<Payload> + Send + Sync + 'static,
    {
        self.register(format, FnCodec::new(encode, decode));
    }

    /// Looks up the codec for `format`.
    pub fn resolve(&self, format: &str) -> Result<Arc<dyn Codec>> {
        let codecs = self.codecs.read().unwrap_or_else(|e| e.into_inner());
        codecs
            .get(format)
            .cloned()
            .ok_or_else(|| IotError::UnsupportedFormat(format.to_string()))
    }

    pub fn contains(&self, format: &str) -> bool {
        let codecs = self.codecs.read().unwrap_or_else(|e| e.into_inner());
        codecs.contains_key(format)
    }

    /// Registered format names, sorted.
    pub fn formats(&self) -> Vec<String> {
        let codecs = self.codecs.read().unwrap_or_else(|e| e.into_inner());
        let mut formats: Vec<String> = codecs.keys().cloned().collect();
        formats.sort();
        formats
    }

    /// Encodes an outbound envelope with the codec named by its format.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        self.resolve(envelope.format())?.encode(envelope)
    }

    /// Decodes inbound bytes, stamping the envelope with the current time.
    pub fn decode(&self, format: &str, raw: &[u8]) -> Result<Envelope> {
        self.decode_at(format, raw, OffsetDateTime::now_utc())
    }

    /// Decodes inbound bytes into an envelope stamped with `received_at`.
    pub fn decode_at(&self, format: &str, raw: &[u8], received_at: OffsetDateTime) -> Result<Envelope> {
        let payload = self.resolve(format)?.decode(raw)?;
        Ok(Envelope::new(format, payload, received_at))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}
