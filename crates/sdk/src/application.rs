//! Application client.
//!
//! Applications act on behalf of devices: they publish events and commands
//! on the scoped topics
//!
//! ```text
//! iot-2/type/{type}/id/{device}/evt/{event}/fmt/{format}
//! iot-2/type/{type}/id/{device}/cmd/{command}/fmt/{format}
//! ```
//!
//! and subscribe to them with `+` wildcards in any position.

use tracing::info;

use crate::config::{ClientConfig, ClientKind};
use crate::connection::{Connection, ConnectionOptions};
use crate::delivery::OnPublish;
use crate::dispatcher::{Handler, Message, Pattern};
use crate::error::{IotError, Result};
use crate::message::Payload;
use crate::state::ConnectionState;
use crate::topic::{self, MessageClass, TopicAddress};
use crate::transport::{EventSource, Transport};

/// Matches any device type, device id, event/command id or format.
pub const ANY: &str = "+";

pub struct ApplicationClient {
    config: ClientConfig,
    connection: Connection,
}

impl ApplicationClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connection = Connection::from_config(&config, ClientKind::Application)?;
        Ok(Self { config, connection })
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: impl Transport + 'static,
        events: impl EventSource + 'static,
    ) -> Result<Self> {
        config.validate_for(ClientKind::Application)?;
        let connection = Connection::new(transport, events, ConnectionOptions::from_config(&config));
        Ok(Self { config, connection })
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await?;
        info!(app_id = ?self.config.identity.app_id, "Application connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Publishes an event as if it came from the given device.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish_event(
        &self,
        device_type: &str,
        device_id: &str,
        event_id: &str,
        format: &str,
        data: impl Into<Payload>,
        qos: u8,
        on_publish: Option<OnPublish>,
    ) -> Result<()> {
        let address = TopicAddress::event(device_type, device_id, event_id);
        self.connection.publish(&address, format, data, qos, on_publish).await
    }

    /// Sends a command to a device.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish_command(
        &self,
        device_type: &str,
        device_id: &str,
        command_id: &str,
        format: &str,
        data: impl Into<Payload>,
        qos: u8,
        on_publish: Option<OnPublish>,
    ) -> Result<()> {
        if self.config.is_quickstart() {
            return Err(IotError::Configuration(
                "QuickStart does not support sending commands".to_string(),
            ));
        }
        let address = TopicAddress::command(device_type, device_id, command_id);
        self.connection.publish(&address, format, data, qos, on_publish).await
    }

    /// Subscribes to device events. Pass [`ANY`] for any argument to match
    /// everything in that position.
    pub async fn subscribe_to_device_events(
        &self,
        device_type: &str,
        device_id: &str,
        event_id: &str,
        format: &str,
        qos: u8,
    ) -> Result<()> {
        let filter = topic::scoped_filter(MessageClass::Event, device_type, device_id, event_id, format)?;
        self.connection.subscribe(&filter, qos).await
    }

    pub async fn unsubscribe_from_device_events(
        &self,
        device_type: &str,
        device_id: &str,
        event_id: &str,
        format: &str,
    ) -> Result<()> {
        let filter = topic::scoped_filter(MessageClass::Event, device_type, device_id, event_id, format)?;
        self.connection.unsubscribe(&filter).await
    }

    /// Subscribes to commands sent to devices.
    pub async fn subscribe_to_device_commands(
        &self,
        device_type: &str,
        device_id: &str,
        command_id: &str,
        format: &str,
        qos: u8,
    ) -> Result<()> {
        let filter = topic::scoped_filter(MessageClass::Command, device_type, device_id, command_id, format)?;
        self.connection.subscribe(&filter, qos).await
    }

    pub async fn unsubscribe_from_device_commands(
        &self,
        device_type: &str,
        device_id: &str,
        command_id: &str,
        format: &str,
    ) -> Result<()> {
        let filter = topic::scoped_filter(MessageClass::Command, device_type, device_id, command_id, format)?;
        self.connection.unsubscribe(&filter).await
    }

    pub fn on_event(&self, pattern: Pattern, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.connection.register(pattern, Handler::event(handler));
    }

    pub fn on_command(&self, pattern: Pattern, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.connection.register(pattern, Handler::command(handler));
    }

    pub fn on_error(&self, callback: impl Fn(&str, &[u8], &IotError) + Send + Sync + 'static) {
        self.connection.dispatcher().on_error(callback);
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}
