//! Device client.
//!
//! A device publishes events on `iot-2/evt/{event}/fmt/{format}` and
//! receives commands on `iot-2/cmd/{command}/fmt/{format}`. Registered
//! devices subscribe to every command at QoS 1 when connecting; quickstart
//! devices cannot receive commands.
//!
//! ```ignore
//! let client = DeviceClient::new(ClientConfig::device("myorg", "sensor", "dev-1", token))?;
//! client.on_command(Pattern::any().id("reboot"), |msg| info!(data = ?msg.data(), "Reboot"))?;
//! client.connect().await?;
//! client.publish_event("status", "json", json!({"cpu": 0.3}), 1, None).await?;
//! ```

use tracing::info;

use crate::config::{ClientConfig, ClientKind};
use crate::connection::{Connection, ConnectionOptions};
use crate::delivery::OnPublish;
use crate::dispatcher::{Handler, Message, Pattern};
use crate::error::{IotError, Result};
use crate::message::Payload;
use crate::state::ConnectionState;
use crate::topic::{TopicAddress, DEVICE_COMMANDS};
use crate::transport::{EventSource, Transport};

pub struct DeviceClient {
    config: ClientConfig,
    connection: Connection,
}

impl DeviceClient {
    /// Creates a client connected over MQTT.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connection = Connection::from_config(&config, ClientKind::Device)?;
        Ok(Self { config, connection })
    }

    /// Creates a client over a caller-supplied transport.
    pub fn with_transport(
        config: ClientConfig,
        transport: impl Transport + 'static,
        events: impl EventSource + 'static,
    ) -> Result<Self> {
        config.validate_for(ClientKind::Device)?;
        let connection = Connection::new(transport, events, ConnectionOptions::from_config(&config));
        Ok(Self { config, connection })
    }

    pub async fn connect(&self) -> Result<()> {
        if !self.config.is_quickstart() {
            self.connection.subscribe(DEVICE_COMMANDS, 1).await?;
        }
        self.connection.connect().await?;
        info!(
            device_type = ?self.config.identity.type_id,
            device_id = ?self.config.identity.device_id,
            "Device connected"
        );
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Publishes an event for this device.
    pub async fn publish_event(
        &self,
        event_id: &str,
        format: &str,
        data: impl Into<Payload>,
        qos: u8,
        on_publish: Option<OnPublish>,
    ) -> Result<()> {
        self.connection
            .publish(&TopicAddress::device_event(event_id), format, data, qos, on_publish)
            .await
    }

    /// Registers a command handler. `pattern` may narrow on command id and
    /// format.
    pub fn on_command(&self, pattern: Pattern, handler: impl Fn(&Message) + Send + Sync + 'static) -> Result<()> {
        if self.config.is_quickstart() {
            return Err(IotError::Configuration(
                "QuickStart devices do not support commands".to_string(),
            ));
        }
        self.connection.register(pattern, Handler::command(handler));
        Ok(())
    }

    /// Receives inbound messages that could not be decoded or whose handler
    /// panicked.
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
