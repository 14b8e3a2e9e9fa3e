//! Connection lifecycle states.
//!
//! The connection manager publishes its state on a `watch` channel so
//! application code can react to outages (show a status, pause sampling)
//! without polling.
//!
//! ```text
//! Disconnected --connect()--> Connecting --CONNACK--> Connected
//!      ^                          |                       |
//!      +------ retry/backoff -----+------- link lost -----+
//!
//! any state --disconnect()--> Closed   (terminal)
//! ```

use std::fmt;

/// The current state of a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected. Carries the reason of the last loss, `None` before the
    /// first connect attempt.
    Disconnected(Option<String>),

    /// Handshake in progress (initial connect or automatic reconnect).
    Connecting,

    /// Session established; subscriptions have been (re)issued.
    Connected,

    /// `disconnect()` was called. Terminal: the client can't be reused and
    /// every further operation fails with `ClientClosed`.
    Closed,
}

impl ConnectionState {
    /// Why the link was lost, when the platform or transport said so.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ConnectionState::Disconnected(reason) => reason.as_deref(),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected(None)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(Some(reason)) => write!(f, "Disconnected ({reason})"),
            ConnectionState::Disconnected(None) => f.write_str("Disconnected"),
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::Connected => f.write_str("Connected"),
            ConnectionState::Closed => f.write_str("Closed"),
        }
    }
}
