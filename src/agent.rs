//! The device agent: connects as a device, logs every command it receives
//! and publishes a status event on a fixed interval until cancelled.

use std::time::Duration;

use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wiotp_sdk::{ClientConfig, DeviceClient, Pattern, Payload, Result};

use crate::config::AgentConfig;

pub struct Agent {
    device: DeviceClient,
    settings: AgentConfig,
    started: Instant,
}

impl Agent {
    pub fn new(client: ClientConfig, settings: AgentConfig) -> Result<Self> {
        Ok(Self::with_device(DeviceClient::new(client)?, settings))
    }

    pub fn with_device(device: DeviceClient, settings: AgentConfig) -> Self {
        Self {
            device,
            settings,
            started: Instant::now(),
        }
    }

    /// Installs the command and error logging and connects.
    pub async fn start(&self) -> Result<()> {
        if !self.device.config().is_quickstart() {
            self.device.on_command(Pattern::any(), |msg| {
                info!(command = %msg.id(), format = %msg.format(), data = ?msg.data(), "Command received");
            })?;
        }
        self.device.on_error(|topic, raw, err| {
            warn!(topic, bytes = raw.len(), error = %err, "Dropped undeliverable message");
        });
        self.device.connect().await
    }

    /// Publishes status events until `cancel` fires, then disconnects.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.status_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    sequence += 1;
                    self.publish_status(sequence).await;
                }
            }
        }

        info!(published = sequence, "Stopping agent");
        self.device.disconnect().await
    }

    async fn publish_status(&self, sequence: u64) {
        let status = self.status(sequence);
        debug!(sequence, "Publishing status event");
        if let Err(e) = self
            .device
            .publish_event(
                &self.settings.event_id,
                &self.settings.format,
                status,
                self.settings.qos,
                None,
            )
            .await
        {
            error!(sequence, error = %e, "Failed to publish status event");
        }
    }

    fn status(&self, sequence: u64) -> Payload {
        let uptime = self.started.elapsed().as_secs();
        let version = env!("CARGO_PKG_VERSION");
        let connection = self.device.state().to_string();
        let fields = json!({
            "sequence": sequence,
            "uptime_secs": uptime,
            "version": version,
            "connection": connection,
        });

        match self.settings.format.as_str() {
            "text" => Payload::Text(format!(
                "sequence={sequence} uptime_secs={uptime} version={version} connection={connection}"
            )),
            "xml" => Payload::Text(format!(
                "<status sequence=\"{sequence}\" uptimeSecs=\"{uptime}\" version=\"{version}\" connection=\"{connection}\"/>"
            )),
            "binary" => Payload::from(fields.to_string().into_bytes()),
            _ => Payload::Json(fields),
        }
    }

    pub fn device(&self) -> &DeviceClient {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;
    use wiotp_sdk::memory::{self, Broker};
    use wiotp_sdk::{ConnectionState, IotError};

    use super::*;

    fn agent(interval: u64) -> (Agent, Broker) {
        agent_with_format(interval, "json")
    }

    fn agent_with_format(interval: u64, format: &str) -> (Agent, Broker) {
        let (transport, events, broker) = memory::pair();
        let device = DeviceClient::with_transport(
            ClientConfig::device("myorg", "host", "host-01", "s3cr3t"),
            transport,
            events,
        )
        .unwrap();
        let settings = AgentConfig {
            status_interval_secs: interval,
            format: format.to_string(),
            ..Default::default()
        };
        (Agent::with_device(device, settings), broker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_status_until_cancelled() {
        let (agent, broker) = agent(10);
        broker.connack();
        agent.start().await.unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            stopper.cancel();
        });
        agent.run(cancel).await.unwrap();

        let events = broker.published_json("iot-2/evt/status/fmt/json");
        let sequences: Vec<u64> = events.iter().filter_map(|e| e["sequence"].as_u64()).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(events[0]["version"], json!(env!("CARGO_PKG_VERSION")));
        assert_eq!(agent.device().state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_matches_configured_format() {
        for format in ["text", "xml", "binary"] {
            let (agent, broker) = agent_with_format(60, format);
            broker.connack();
            agent.start().await.unwrap();

            let cancel = CancellationToken::new();
            let stopper = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                stopper.cancel();
            });
            agent.run(cancel).await.unwrap();

            let topic = format!("iot-2/evt/status/fmt/{format}");
            let published: Vec<_> = broker.published().into_iter().filter(|(t, _)| *t == topic).collect();
            assert_eq!(published.len(), 1, "{format}");
            let wire = String::from_utf8(published[0].1.to_vec()).unwrap();
            match format {
                "text" => assert!(wire.starts_with("sequence=1 "), "{wire}"),
                "xml" => assert!(wire.starts_with("<status sequence=\"1\""), "{wire}"),
                _ => assert!(!wire.contains('{'), "base64 expected: {wire}"),
            }
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_logs_commands() {
        let (agent, broker) = agent(3600);
        broker.connack();
        agent.start().await.unwrap();

        broker.deliver("iot-2/cmd/reboot/fmt/json", &br#"{"delay": 5}"#[..]);
        for _ in 0..200 {
            if logs_contain("Command received") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(logs_contain("Command received"));
        assert!(logs_contain("command=reboot"));
    }

    #[tokio::test]
    async fn test_stopped_agent_refuses_work() {
        let (agent, broker) = agent(3600);
        broker.connack();
        agent.start().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        agent.run(cancel).await.unwrap();

        let err = agent
            .device()
            .publish_event("status", "json", json!({}), 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IotError::ClientClosed));
    }
}
