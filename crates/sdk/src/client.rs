//! MQTT transport built on `rumqttc`.
//!
//! [`ClientBuilder`] turns a [`ClientConfig`] into `rumqttc`'s
//! `AsyncClient`/`EventLoop` pair, wrapped as [`MqttTransport`] and
//! [`MqttEvents`] so the connection manager can drive them through the
//! [`Transport`]/[`EventSource`] seam.
//!
//! # Examples
//!
//! ```ignore
//! use wiotp_sdk::{client::ClientBuilder, ClientConfig, ClientKind};
//!
//! let config = ClientConfig::device("myorg", "sensor", "dev-1", "secret");
//! let (transport, events) = ClientBuilder::from_config(&config, ClientKind::Device)?
//!     .keep_alive(30)
//!     .build()?;
//! ```
//!
//! The broker is `{org}.messaging.{domain}`. Port 1883 is plain TCP, every
//! other port is TLS: with the configured CA file when one is set,
//! otherwise with the platform's default roots.

use std::{fs, time::Duration};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter, TlsConfiguration, Transport as NetworkTransport,
};
use tracing::{debug, trace};

use crate::config::{ClientConfig, ClientKind};
use crate::error::{IotError, Result};
use crate::transport::{EventSource, Transport, TransportEvent, TransportFailure};

/// Builder for the MQTT transport pair.
pub struct ClientBuilder {
    /// MQTT protocol options (client id, broker, keep-alive, credentials).
    opts: MqttOptions,

    tls: bool,

    /// CA bundle (PEM) used instead of the default roots.
    ca_file: Option<String>,

    /// Capacity of the request channel between client and event loop.
    cap: usize,
}

impl ClientBuilder {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16, cap: usize) -> Self {
        Self {
            opts: MqttOptions::new(client_id, host, port),
            tls: false,
            ca_file: None,
            cap,
        }
    }

    /// Creates a builder for `kind` from a configuration.
    ///
    /// The configuration is validated for `kind` first.
    pub fn from_config(config: &ClientConfig, kind: ClientKind) -> Result<Self> {
        config.validate_for(kind)?;

        let options = &config.options;
        let mut builder = Self::new(
            config.client_id(kind)?,
            config.host(),
            config.port(),
            options.request_channel_capacity,
        )
        .keep_alive(options.keep_alive)
        .clean_session(options.clean_start)
        .max_inflight(options.max_inflight);

        if let Some((username, password)) = config.credentials(kind) {
            builder = builder.credentials(username, password);
        }
        if config.uses_tls() {
            builder.tls = true;
            builder.ca_file = options.ca_file.clone();
        }
        Ok(builder)
    }

    /// Enables TLS, validating the broker against `ca_file` if given.
    pub fn with_tls(mut self, ca_file: Option<String>) -> Self {
        self.tls = true;
        self.ca_file = ca_file;
        self
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    /// `false` asks the broker to keep subscriptions and queued messages
    /// across reconnects.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    /// Maximum number of unacknowledged QoS 1/2 publishes.
    pub fn max_inflight(mut self, max: u16) -> Self {
        self.opts.set_inflight(max);
        self
    }

    fn network(&self) -> Result<NetworkTransport> {
        if !self.tls {
            return Ok(NetworkTransport::Tcp);
        }
        match &self.ca_file {
            Some(path) => {
                let ca = fs::read(path)
                    .map_err(|e| IotError::Configuration(format!("Unable to read CA file {path}: {e}")))?;
                Ok(NetworkTransport::Tls(TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                }))
            }
            None => Ok(NetworkTransport::tls_with_default_config()),
        }
    }

    /// Constructs the transport pair. The event loop does not touch the
    /// network until it is first polled.
    pub fn build(self) -> Result<(MqttTransport, MqttEvents)> {
        let network = self.network()?;
        let mut opts = self.opts;
        opts.set_transport(network);

        debug!(
            client_id = %opts.client_id(),
            broker = ?opts.broker_address(),
            "Building MQTT client"
        );
        let (client, event_loop) = AsyncClient::new(opts, self.cap);
        Ok((MqttTransport { client }, MqttEvents { event_loop }))
    }
}

/// Outbound half of an MQTT session.
pub struct MqttTransport {
    client: AsyncClient,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<()> {
        self.client.subscribe(filter, qos).await?;
        Ok(())
    }

    async fn subscribe_many(&mut self, filters: &[(String, QoS)]) -> Result<()> {
        let filters = filters
            .iter()
            .map(|(filter, qos)| SubscribeFilter::new(filter.clone(), *qos))
            .collect::<Vec<_>>();
        self.client.subscribe_many(filters).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<()> {
        self.client.unsubscribe(filter).await?;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        self.client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Never block: the event loop may no longer be polled.
        self.client.try_disconnect()?;
        Ok(())
    }
}

/// Inbound half of an MQTT session.
pub struct MqttEvents {
    event_loop: EventLoop,
}

#[async_trait]
impl EventSource for MqttEvents {
    async fn poll(&mut self) -> std::result::Result<TransportEvent, TransportFailure> {
        loop {
            let event = self.event_loop.poll().await.map_err(|e| classify_connection_error(&e))?;
            trace!(?event, "MQTT event");
            if let Some(event) = translate(event)? {
                return Ok(event);
            }
        }
    }
}

fn translate(event: Event) -> std::result::Result<Option<TransportEvent>, TransportFailure> {
    let translated = match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            if ack.code != ConnectReturnCode::Success {
                return Err(classify_refusal(ack.code));
            }
            Some(TransportEvent::Connected {
                session_present: ack.session_present,
            })
        }
        Event::Incoming(Packet::Publish(publish)) => Some(TransportEvent::Message {
            topic: publish.topic,
            payload: publish.payload,
        }),
        Event::Incoming(Packet::PubAck(ack)) => Some(TransportEvent::Acknowledged { pkid: ack.pkid }),
        Event::Incoming(Packet::PubComp(comp)) => Some(TransportEvent::Acknowledged { pkid: comp.pkid }),
        Event::Incoming(Packet::Disconnect) => Some(TransportEvent::Disconnected {
            reason: "broker closed the session".to_string(),
        }),
        Event::Outgoing(Outgoing::Publish(pkid)) => Some(TransportEvent::Sent { pkid }),
        Event::Outgoing(Outgoing::Disconnect) => Some(TransportEvent::Disconnected {
            reason: "client disconnect".to_string(),
        }),
        _ => None,
    };
    Ok(translated)
}

fn refusal_reason(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "Connection accepted",
        ConnectReturnCode::RefusedProtocolVersion => "Incorrect protocol version",
        ConnectReturnCode::BadClientId => "Invalid client identifier",
        ConnectReturnCode::ServiceUnavailable => "Server unavailable",
        ConnectReturnCode::BadUserNamePassword => "Bad username or password",
        ConnectReturnCode::NotAuthorized => "Not authorized",
    }
}

fn classify_refusal(code: ConnectReturnCode) -> TransportFailure {
    let reason = refusal_reason(code).to_string();
    match code {
        ConnectReturnCode::RefusedProtocolVersion
        | ConnectReturnCode::BadClientId
        | ConnectReturnCode::BadUserNamePassword
        | ConnectReturnCode::NotAuthorized => TransportFailure::Fatal(reason),
        _ => TransportFailure::Retry(reason),
    }
}

/// Decides whether polling again can recover from `err`.
fn classify_connection_error(err: &ConnectionError) -> TransportFailure {
    let reason = error_message(err);

    match err {
        // Certificates or crypto setup; retrying won't fix it
        ConnectionError::Tls(_) => TransportFailure::Fatal(reason),

        ConnectionError::MqttState(_) => TransportFailure::Fatal(reason),

        ConnectionError::NotConnAck(_) => TransportFailure::Fatal(reason),

        ConnectionError::RequestsDone => TransportFailure::Fatal(reason),

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => TransportFailure::Fatal(reason),
            _ => TransportFailure::Retry(reason),
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => TransportFailure::Retry(reason),

        ConnectionError::ConnectionRefused(code) => classify_refusal(*code),

        #[allow(unreachable_patterns)]
        _ => TransportFailure::Retry(reason),
    }
}

/// Innermost message of an error chain, without surrounding quotes.
fn error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::Bytes;
    use rumqttc::{ConnAck, PubAck, Publish};
    use tempfile::NamedTempFile;

    use super::*;

    fn device_config() -> ClientConfig {
        ClientConfig::device("myorg", "sensor", "dev-1", "secret")
    }

    #[test]
    fn test_from_config_device() {
        let builder = ClientBuilder::from_config(&device_config(), ClientKind::Device).unwrap();

        assert_eq!(builder.opts.client_id(), "d:myorg:sensor:dev-1");
        assert_eq!(
            builder.opts.broker_address(),
            ("myorg.messaging.internetofthings.ibmcloud.com".to_string(), 8883)
        );
        assert_eq!(
            builder.opts.credentials(),
            Some(("use-token-auth".to_string(), "secret".to_string()))
        );
        assert_eq!(builder.opts.keep_alive(), Duration::from_secs(60));
        assert!(!builder.opts.clean_session());
        assert!(builder.tls);
    }

    #[test]
    fn test_from_config_quickstart_is_plain_tcp() {
        let config = ClientConfig::quickstart("sensor", "dev-1");
        let builder = ClientBuilder::from_config(&config, ClientKind::Device).unwrap();

        assert_eq!(builder.opts.broker_address().1, 1883);
        assert_eq!(builder.opts.credentials(), None);
        assert!(!builder.tls);
        assert!(matches!(builder.network().unwrap(), NetworkTransport::Tcp));
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let mut config = device_config();
        config.auth.token = None;
        assert!(ClientBuilder::from_config(&config, ClientKind::Device).is_err());
    }

    #[test]
    fn test_custom_ca_file() {
        let mut ca = NamedTempFile::new().unwrap();
        ca.write_all(b"-----BEGIN CERTIFICATE-----").unwrap();
        let mut config = device_config();
        config.options.ca_file = Some(ca.path().to_string_lossy().into_owned());

        let builder = ClientBuilder::from_config(&config, ClientKind::Device).unwrap();
        match builder.network().unwrap() {
            NetworkTransport::Tls(TlsConfiguration::Simple { ca: bytes, .. }) => {
                assert_eq!(bytes, b"-----BEGIN CERTIFICATE-----".to_vec());
            }
            _ => panic!("expected a TLS transport with the custom CA"),
        }
    }

    #[test]
    fn test_unreadable_ca_file() {
        let builder = ClientBuilder::new("d:o:t:i", "localhost", 8883, 10).with_tls(Some("/nonexistent/ca.pem".into()));
        match builder.build() {
            Err(err) => assert!(err.to_string().contains("Unable to read CA file /nonexistent/ca.pem")),
            Ok(_) => panic!("expected the missing CA file to be reported"),
        }
    }

    #[tokio::test]
    async fn test_build_does_not_connect() {
        let (_transport, _events) = ClientBuilder::new("a:o:app", "localhost", 1883, 10).build().unwrap();
    }

    #[test]
    fn test_translate_connack() {
        let ok = Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, true)));
        assert_eq!(
            translate(ok).unwrap(),
            Some(TransportEvent::Connected { session_present: true })
        );

        let refused = Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::NotAuthorized, false)));
        assert_eq!(translate(refused).unwrap_err(), TransportFailure::Fatal("Not authorized".into()));
    }

    #[test]
    fn test_translate_publish_and_acks() {
        let publish = Publish::new("iot-2/cmd/reboot/fmt/json", QoS::AtLeastOnce, b"{}".to_vec());
        assert_eq!(
            translate(Event::Incoming(Packet::Publish(publish))).unwrap(),
            Some(TransportEvent::Message {
                topic: "iot-2/cmd/reboot/fmt/json".into(),
                payload: Bytes::from_static(b"{}"),
            })
        );
        assert_eq!(
            translate(Event::Incoming(Packet::PubAck(PubAck::new(4)))).unwrap(),
            Some(TransportEvent::Acknowledged { pkid: 4 })
        );
        assert_eq!(
            translate(Event::Outgoing(Outgoing::Publish(4))).unwrap(),
            Some(TransportEvent::Sent { pkid: 4 })
        );
        assert_eq!(translate(Event::Outgoing(Outgoing::PingReq)).unwrap(), None);
        assert!(matches!(
            translate(Event::Outgoing(Outgoing::Disconnect)).unwrap(),
            Some(TransportEvent::Disconnected { .. })
        ));
    }

    #[test]
    fn test_classify_connection_errors() {
        assert_eq!(
            classify_connection_error(&ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword)),
            TransportFailure::Fatal("Bad username or password".into())
        );
        assert_eq!(
            classify_connection_error(&ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable)),
            TransportFailure::Retry("Server unavailable".into())
        );
        assert!(!classify_connection_error(&ConnectionError::NetworkTimeout).is_fatal());

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(
            classify_connection_error(&ConnectionError::Io(reset)),
            TransportFailure::Retry("reset by peer".into())
        );

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(classify_connection_error(&ConnectionError::Io(denied)).is_fatal());
        assert!(classify_connection_error(&ConnectionError::RequestsDone).is_fatal());
    }
}
