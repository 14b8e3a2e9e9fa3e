//! The seam between the connection manager and the wire.
//!
//! A session is split in two halves, mirroring `rumqttc`'s
//! `AsyncClient`/`EventLoop` pair:
//!
//! - [`Transport`] issues requests (subscribe, publish, disconnect). The
//!   connection manager keeps it behind a `tokio::sync::Mutex` so at most
//!   one request is in flight at a time.
//! - [`EventSource`] is polled by a single task; it performs the handshake
//!   on first use, reconnects when polled again after a failure, and yields
//!   the [`TransportEvent`]s the connection manager reacts to.
//!
//! The MQTT implementation lives in [`crate::client`]; tests use
//! [`crate::memory`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;

use crate::error::{IotError, Result};

/// Something the session reports to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the session.
    Connected { session_present: bool },
    /// An inbound publish.
    Message { topic: String, payload: Bytes },
    /// An outbound publish was written to the socket. QoS 0 publishes carry
    /// packet id 0.
    Sent { pkid: u16 },
    /// The broker completed the QoS 1 (PUBACK) or QoS 2 (PUBCOMP) flow.
    Acknowledged { pkid: u16 },
    /// The session ended cleanly (DISCONNECT sent or received).
    Disconnected { reason: String },
}

/// Why polling failed, and whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// Network-level problem; poll again after a backoff delay.
    Retry(String),
    /// Retrying cannot succeed (bad credentials, TLS misconfiguration).
    Fatal(String),
}

impl TransportFailure {
    pub fn reason(&self) -> &str {
        match self {
            TransportFailure::Retry(reason) | TransportFailure::Fatal(reason) => reason,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportFailure::Fatal(_))
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Outbound half of a session.
#[async_trait]
pub trait Transport: Send {
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<()>;

    /// Subscribes to several filters in one request where the protocol allows.
    async fn subscribe_many(&mut self, filters: &[(String, QoS)]) -> Result<()> {
        for (filter, qos) in filters {
            self.subscribe(filter, *qos).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<()>;

    async fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;
}

/// Inbound half of a session.
#[async_trait]
pub trait EventSource: Send {
    /// Drives the session and returns the next relevant event.
    async fn poll(&mut self) -> std::result::Result<TransportEvent, TransportFailure>;
}

/// The outbound half as shared by the connection manager.
pub type SharedTransport = Arc<tokio::sync::Mutex<Box<dyn Transport>>>;

/// Maps a numeric QoS level to the protocol value.
pub fn qos(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(IotError::InvalidMetadata(format!(
            "Invalid QoS value {other}, must be 0, 1, or 2"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos(2).unwrap(), QoS::ExactlyOnce);

        let err = qos(3).unwrap_err();
        assert!(matches!(err, IotError::InvalidMetadata(_)));
        assert!(err.to_string().contains("must be 0, 1, or 2"));
    }

    #[test]
    fn test_failure_display() {
        let failure = TransportFailure::Fatal("Bad username or password".into());
        assert!(failure.is_fatal());
        assert_eq!(failure.to_string(), "Bad username or password");
        assert!(!TransportFailure::Retry("timeout".into()).is_fatal());
    }
}
