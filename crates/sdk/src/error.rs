//! Unified error type for every SDK operation.
//!
//! `IotError` aggregates failures from the codec layer, the MQTT transport,
//! the device-management state machine and the REST client into a single
//! type that application code can pattern-match on.
//!
//! # Error Categories
//!
//! **Payload errors** (the message itself is the problem):
//! - `UnsupportedFormat`: no codec registered for the requested format
//! - `InvalidPayload`: inbound bytes could not be decoded
//! - `Serialization`: outbound data does not fit the chosen codec
//!
//! **Addressing and configuration errors** (caught before any I/O):
//! - `InvalidTopic`, `InvalidMetadata`, `Configuration`, `ConfigError`
//!
//! **Runtime errors** (transient or terminal connectivity issues):
//! - `Connection`: could not establish or keep the session
//! - `ClientClosed`: the client was explicitly disconnected
//! - `RequestTimedOut`: a confirmation or response never arrived
//! - `ClientTransfer`, `Transport`, `RetriesPolicy`, `Io`
//!
//! **REST errors**:
//! - `Api`: the platform answered with a non-2xx status
//! - `Http`: the request never produced a response
//!
//! **Callback errors**:
//! - `Handler`: a user handler panicked during dispatch
//!
//! # Usage
//!
//! ```ignore
//! match device.publish_event("status", "json", payload, 1, None).await {
//!     Ok(()) => {}
//!     Err(IotError::ClientClosed) => return,
//!     Err(IotError::UnsupportedFormat(format)) => {
//!         eprintln!("register a codec for {format} first");
//!     }
//!     Err(e) => eprintln!("publish failed: {e}"),
//! }
//! ```

use thiserror::Error;

use crate::api::ApiError;
use crate::backoff::BackoffError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IotError>;

/// The unified error type for SDK operations.
#[derive(Debug, Error)]
pub enum IotError {
    /// No codec is registered under the requested format name.
    ///
    /// Raised by the codec registry on both the publish and the receive path.
    /// Register a codec for the format (see `CodecRegistry::register`) or pick
    /// one of the built-in formats (`json`, `text`, `xml`, `binary`).
    #[error("No codec registered for message format: {0}")]
    UnsupportedFormat(String),

    /// Inbound bytes could not be decoded by the format's codec.
    ///
    /// The message is dropped and reported to the dispatcher's error
    /// callback; the connection stays up.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Outbound data could not be encoded by the chosen codec.
    ///
    /// Typically a type mismatch such as raw bytes sent with the `json`
    /// format. Not retryable.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A topic could not be parsed, or a topic segment is not allowed.
    ///
    /// Identifiers must be non-empty and must not contain `/`, `+` or `#`.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Publish or subscribe parameters are out of range.
    ///
    /// # Example
    /// ```ignore
    /// // QoS 3 does not exist:
    /// // InvalidMetadata("Invalid QoS value 3, must be 0, 1, or 2")
    /// ```
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The session could not be established or was lost for good.
    ///
    /// Carries the human-readable reason, e.g. "Bad username or password"
    /// when the broker refuses the credentials.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The client has been disconnected and cannot be used any more.
    ///
    /// Every call made after `disconnect()` fails with this error without
    /// touching the transport.
    #[error("Client is closed")]
    ClientClosed,

    /// The REST API answered with a non-2xx status.
    #[error(transparent)]
    Api(Box<ApiError>),

    /// A delivery confirmation or a response did not arrive in time.
    #[error("Request timed out: {0}")]
    RequestTimedOut(String),

    /// The client configuration is missing required values or combines
    /// options that cannot work together.
    /// For example `Configuration("QuickStart does not support device management")`.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Field-level validation of a configuration struct failed.
    #[error("Configuration validation error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The MQTT client refused a request (its request channel is closed).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// The transport failed outside of the connection handshake.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The reconnection policy gave up.
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] BackoffError),

    /// A user callback panicked while handling a message.
    #[error("Handler error: {0}")]
    Handler(String),

    /// The HTTP request failed before a response was received.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// File I/O error, e.g. while reading a CA certificate.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ApiError> for IotError {
    fn from(err: ApiError) -> Self {
        IotError::Api(Box::new(err))
    }
}

impl IotError {
    /// Returns the API error when this is a REST failure.
    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            IotError::Api(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the failure is a terminal close of the client.
    pub fn is_closed(&self) -> bool {
        matches!(self, IotError::ClientClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IotError::UnsupportedFormat("yaml".to_string());
        assert_eq!(err.to_string(), "No codec registered for message format: yaml");

        let err = IotError::InvalidMetadata("bad qos".to_string());
        assert_eq!(err.to_string(), "Invalid metadata: bad qos");

        let err = IotError::ClientClosed;
        assert_eq!(err.to_string(), "Client is closed");
    }

    #[test]
    fn test_error_from_backoff() {
        let backoff = BackoffError::Exhausted(3);
        let err: IotError = backoff.into();
        assert!(matches!(err, IotError::RetriesPolicy(_)));
        assert!(err.to_string().contains("3"));
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "ca.pem");
        let err: IotError = io.into();
        assert!(matches!(err, IotError::Io(_)));
    }

    #[test]
    fn test_api_error_is_boxed_and_transparent() {
        let api = ApiError::new(404, "Not Found", "https://org.example/api/v0002/x", "{}");
        let err: IotError = api.into();

        assert!(err.as_api().is_some());
        assert_eq!(err.as_api().map(ApiError::status), Some(404));
        assert!(err.to_string().contains("404"));
        assert!(!err.is_closed());
    }
}
