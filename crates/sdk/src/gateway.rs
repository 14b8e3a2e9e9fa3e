//! Gateway client.
//!
//! A gateway is a device that also speaks for the devices attached behind
//! it. Everything it sends and receives uses the scoped topics, its own
//! traffic included. On connect it subscribes to its own commands and to
//! its notification topic, where the platform reports problems with
//! messages the gateway published.

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

pub struct GatewayClient {
    config: ClientConfig,
    connection: Connection,
    device_type: String,
    device_id: String,
}

impl GatewayClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connection = Connection::from_config(&config, ClientKind::Gateway)?;
        Ok(Self::assemble(config, connection))
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: impl Transport + 'static,
        events: impl EventSource + 'static,
    ) -> Result<Self> {
        config.validate_for(ClientKind::Gateway)?;
        let connection = Connection::new(transport, events, ConnectionOptions::from_config(&config));
        Ok(Self::assemble(config, connection))
    }

    fn assemble(config: ClientConfig, connection: Connection) -> Self {
        // Both ids were checked by validate_for.
        let device_type = config.identity.type_id.clone().unwrap_or_default();
        let device_id = config.identity.device_id.clone().unwrap_or_default();
        Self {
            config,
            connection,
            device_type,
            device_id,
        }
    }

    pub async fn connect(&self) -> Result<()> {
        let commands = topic::scoped_filter(
            MessageClass::Command,
            &self.device_type,
            &self.device_id,
            "+",
            "+",
        )?;
        let notifications = TopicAddress {
            class: MessageClass::Notification,
            device_type: Some(self.device_type.clone()),
            device_id: Some(self.device_id.clone()),
            id: String::new(),
        }
        .topic("json")?;

        self.connection.subscribe(&commands, 1).await?;
        self.connection.subscribe(&notifications, 1).await?;
        self.connection.connect().await?;
        info!(device_type = %self.device_type, device_id = %self.device_id, "Gateway connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Publishes an event for the gateway itself.
    pub async fn publish_event(
        &self,
        event_id: &str,
        format: &str,
        data: impl Into<Payload>,
        qos: u8,
        on_publish: Option<OnPublish>,
    ) -> Result<()> {
        let address = TopicAddress::event(&self.device_type, &self.device_id, event_id);
        self.connection.publish(&address, format, data, qos, on_publish).await
    }

    /// Publishes an event on behalf of an attached device.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish_device_event(
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

    /// Subscribes to commands for an attached device; `+` matches anything.
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

    /// Commands for the gateway and for attached devices.
    pub fn on_command(&self, pattern: Pattern, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.connection.register(pattern, Handler::command(handler));
    }

    pub fn on_notification(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.connection.register(Pattern::any(), Handler::notification(handler));
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

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::memory::{self, Broker};

    fn gateway() -> (GatewayClient, Broker) {
        let (transport, events, broker) = memory::pair();
        let config = ClientConfig::gateway("myorg", "gw-type", "gw-1", "secret");
        (GatewayClient::with_transport(config, transport, events).unwrap(), broker)
    }

    #[tokio::test]
    async fn test_connect_subscribes_commands_and_notifications() {
        let (gw, broker) = gateway();
        broker.connack();
        gw.connect().await.unwrap();

        assert_eq!(
            broker.subscriptions(),
            vec![
                "iot-2/type/gw-type/id/gw-1/cmd/+/fmt/+".to_string(),
                "iot-2/type/gw-type/id/gw-1/notify".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_publishes_use_scoped_topics() {
        let (gw, broker) = gateway();
        broker.connack();
        gw.connect().await.unwrap();

        gw.publish_event("heartbeat", "json", json!({}), 0, None).await.unwrap();
        gw.publish_device_event("sensor", "s-7", "temp", "json", json!({"c": 4}), 1, None)
            .await
            .unwrap();

        let topics: Vec<String> = broker.published().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            topics,
            vec![
                "iot-2/type/gw-type/id/gw-1/evt/heartbeat/fmt/json".to_string(),
                "iot-2/type/sensor/id/s-7/evt/temp/fmt/json".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_attached_device_commands_and_notifications() {
        let (gw, broker) = gateway();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let commands = seen.clone();
        let notes = seen.clone();
        gw.on_command(Pattern::any().device_type("sensor"), move |msg| {
            commands.lock().unwrap().push(format!("cmd {}", msg.id()))
        });
        gw.on_notification(move |msg| notes.lock().unwrap().push(format!("notify {:?}", msg.device_id())));
        gw.subscribe_to_device_commands("sensor", "+", "+", "+", 1).await.unwrap();

        broker.connack();
        gw.connect().await.unwrap();
        broker.deliver("iot-2/type/sensor/id/s-7/cmd/calibrate/fmt/json", &b"{}"[..]);
        broker.deliver("iot-2/type/gw-type/id/gw-1/notify", &br#"{"Reason":"bad format"}"#[..]);

        for _ in 0..200 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["cmd calibrate".to_string(), "notify Some(\"gw-1\")".to_string()]
        );
    }

    #[test]
    fn test_quickstart_gateway_is_rejected() {
        let (transport, events, _broker) = memory::pair();
        let result = GatewayClient::with_transport(ClientConfig::quickstart("gw", "1"), transport, events);
        assert!(matches!(result, Err(IotError::Configuration(_))));
    }
}
