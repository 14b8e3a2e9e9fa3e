//! # wiotp-sdk: Watson IoT Platform client SDK
//!
//! Async clients for devices, gateways and applications talking to the
//! Watson IoT Platform over MQTT, device-management support for managed
//! devices, and a REST client for the registry and management APIs.
//! Built on top of `rumqttc`, `tokio` and `reqwest`.
//!
//! - **Pluggable payload formats**: a codec registry maps format names
//!   (`json`, `text`, `xml`, `binary`, or your own) to encoders/decoders
//! - **Pattern dispatch**: inbound commands and events go to the most
//!   specific registered handler; failures never reach the transport loop
//! - **Bounded reconnection** with exponential backoff and automatic
//!   resubscription after every connect
//! - **Delivery confirmation** callbacks and publish-and-wait
//! - **Device management**: manage/unmanage, location, diagnostics,
//!   reboot, factory reset, firmware download/update and custom actions
//!
//! # Quick Start
//!
//! ```ignore
//! use serde_json::json;
//! use wiotp_sdk::{ClientConfig, DeviceClient, Pattern};
//!
//! #[tokio::main]
//! async fn main() -> wiotp_sdk::Result<()> {
//!     let config = ClientConfig::device("myorg", "sensor", "dev-1", "s3cr3t");
//!     let device = DeviceClient::new(config)?;
//!
//!     device.on_command(Pattern::any().id("reboot"), |msg| {
//!         println!("reboot requested: {:?}", msg.data());
//!     })?;
//!     device.connect().await?;
//!
//!     device
//!         .publish_event("status", "json", json!({"cpu": 12.5}), 1, None)
//!         .await?;
//!
//!     device.disconnect().await
//! }
//! ```
//!
//! # Topics
//!
//! ```text
//! iot-2/evt/{event}/fmt/{format}                          device events (device side)
//! iot-2/cmd/{command}/fmt/{format}                        device commands (device side)
//! iot-2/type/{type}/id/{device}/evt/{event}/fmt/{format}  events (application/gateway side)
//! iot-2/type/{type}/id/{device}/cmd/{command}/fmt/{format} commands (application/gateway side)
//! iot-2/type/{type}/id/{device}/notify                    gateway notifications
//! iotdm-1/...                                             device management (JSON)
//! ```
//!
//! # Connection lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected(reason) -> Connecting -> ...
//!                                   \-> disconnect() -> Closed
//! ```
//!
//! `connect()` retries according to `options.reconnect` and fails with
//! `IotError::Connection` once the attempts are exhausted or the broker
//! refuses the credentials. After `disconnect()` every call fails with
//! `IotError::ClientClosed` without touching the network.
//!
//! Subscribe to state changes for diagnostics:
//!
//! ```ignore
//! let mut state_rx = device.connection().state_receiver();
//! while state_rx.changed().await.is_ok() {
//!     println!("connection: {}", *state_rx.borrow());
//! }
//! ```
//!
//! # Testing
//!
//! [`memory::pair`] returns an in-memory transport, its event source and a
//! [`memory::Broker`] handle that records every call and injects inbound
//! traffic. Every client has a `with_transport` constructor accepting them.

pub mod api;
pub mod application;
pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod message;
pub mod mgmt;
pub mod publisher;
pub mod state;
pub mod subscription;
pub mod topic;
pub mod transport;

// Re-exports: Clients
//
// The entry points most applications start from
pub use application::ApplicationClient;
pub use device::DeviceClient;
pub use gateway::GatewayClient;
pub use mgmt::{DeviceInfo, ManagedDevice};
// Re-exports: Configuration
pub use config::{ClientConfig, ClientKind};
// Re-exports: Messages and dispatch
pub use codec::{Codec, CodecRegistry};
pub use dispatcher::{Handler, Message, Pattern};
pub use message::{Envelope, Payload};
// Re-exports: Connection management
//
// Used by callers that need control below the client facades
pub use connection::{Connection, ConnectionOptions};
pub use state::ConnectionState;
pub use transport::{EventSource, Transport};
// Re-exports: REST
pub use api::{ApiClient, ApiConfig, ApiError};
// Re-exports: Error handling
//
// Every fallible call returns IotError
pub use error::{IotError, Result};
