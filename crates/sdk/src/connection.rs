//! Connection lifecycle management.
//!
//! `Connection` owns one platform session and drives it through
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> ... -> Closed
//! ```
//!
//! - [`Connection::connect`] polls the event source until the broker accepts
//!   the session, sleeping between failed attempts with bounded exponential
//!   backoff. Fatal refusals (bad credentials, TLS errors) fail immediately.
//! - Once connected, a driver task owns the event source: it routes inbound
//!   messages to the [`Dispatcher`], feeds publish confirmations to the
//!   [`DeliveryTracker`], and reconnects with backoff when the link drops.
//! - Every successful connect reissues all recorded subscriptions.
//! - [`Connection::disconnect`] may be called from any task at any time. It
//!   stops a pending connect or retry sleep promptly, waits (bounded) for
//!   in-flight publishes, and moves to the terminal `Closed` state; every
//!   later call fails with `ClientClosed` without touching the transport.
//!
//! # Architecture
//!
//! ```text
//! DeviceClient / ApplicationClient / GatewayClient / ManagedDevice
//!     |
//! Connection ---- Publisher ----------+
//!     |       \-- SubscriptionManager -+-- Mutex<Box<dyn Transport>>
//!     |
//! driver task -- Box<dyn EventSource> -- Dispatcher -- user handlers
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::client::ClientBuilder;
use crate::codec::CodecRegistry;
use crate::config::{ClientConfig, ClientKind};
use crate::delivery::{DeliveryTracker, OnPublish, PublishDrain};
use crate::dispatcher::{Dispatcher, Handler, Pattern};
use crate::error::{IotError, Result};
use crate::message::Payload;
use crate::publisher::Publisher;
use crate::state::ConnectionState;
use crate::subscription::SubscriptionManager;
use crate::topic::TopicAddress;
use crate::transport::{self, EventSource, SharedTransport, Transport, TransportEvent, TransportFailure};

/// Tuning for a [`Connection`].
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Retry policy shared by `connect()` and automatic reconnects.
    pub backoff: Backoff,
    /// Upper bound `disconnect()` waits for in-flight publishes.
    pub drain_timeout: Duration,
    pub codecs: Arc<CodecRegistry>,
}

impl ConnectionOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            backoff: Backoff::from_config(&config.options.reconnect),
            drain_timeout: Duration::from_millis(config.options.drain_timeout_ms),
            codecs: Arc::new(CodecRegistry::new()),
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// A platform session with automatic reconnection.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    transport: SharedTransport,

    /// Owned by `connect()` until the session is up, then by the driver.
    events: Mutex<Option<Box<dyn EventSource>>>,

    dispatcher: Arc<Dispatcher>,

    subscriptions: SubscriptionManager,

    publisher: Publisher,

    tracker: Arc<DeliveryTracker>,

    drain: Arc<PublishDrain>,

    closed: Arc<AtomicBool>,

    cancel: CancellationToken,

    state_tx: watch::Sender<ConnectionState>,

    backoff: Backoff,

    drain_timeout: Duration,

    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        transport: impl Transport + 'static,
        events: impl EventSource + 'static,
        options: ConnectionOptions,
    ) -> Self {
        let transport: SharedTransport = Arc::new(Mutex::new(Box::new(transport)));
        let tracker = Arc::new(DeliveryTracker::new());
        let drain = Arc::new(PublishDrain::new());
        let closed = Arc::new(AtomicBool::new(false));
        let publisher = Publisher::new(
            options.codecs.clone(),
            transport.clone(),
            tracker.clone(),
            drain.clone(),
            closed.clone(),
        );
        let (state_tx, _) = watch::channel(ConnectionState::default());

        Self {
            inner: Arc::new(Inner {
                subscriptions: SubscriptionManager::new(transport.clone()),
                dispatcher: Arc::new(Dispatcher::new(options.codecs)),
                events: Mutex::new(Some(Box::new(events))),
                transport,
                publisher,
                tracker,
                drain,
                closed,
                cancel: CancellationToken::new(),
                state_tx,
                backoff: options.backoff,
                drain_timeout: options.drain_timeout,
                driver: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Builds an MQTT connection from a validated client configuration.
    pub fn from_config(config: &ClientConfig, kind: ClientKind) -> Result<Self> {
        let (transport, events) = ClientBuilder::from_config(config, kind)?.build()?;
        Ok(Self::new(transport, events, ConnectionOptions::from_config(config)))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        self.inner.dispatcher.codecs()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    /// Registers a message handler.
    pub fn register(&self, pattern: Pattern, handler: Handler) {
        self.inner.dispatcher.register(pattern, handler);
    }

    /// Establishes the session, retrying transient failures with backoff.
    ///
    /// Returns once the broker accepted the session and the recorded
    /// subscriptions were reissued. Calling it while a session is running
    /// is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let mut slot = inner.events.lock().await;
        inner.ensure_open()?;
        let Some(mut events) = slot.take() else {
            debug!("Session already running");
            return Ok(());
        };

        inner.set_state(ConnectionState::Connecting);
        info!("Connecting to platform");

        let mut backoff = inner.backoff.clone();
        let outcome = loop {
            let polled = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => break Err(IotError::ClientClosed),
                polled = events.poll() => polled,
            };

            let failure = match polled {
                Ok(TransportEvent::Connected { session_present }) => break Ok(session_present),
                Ok(TransportEvent::Disconnected { reason }) => TransportFailure::Retry(reason),
                Ok(event) => {
                    inner.handle_event(event);
                    continue;
                }
                Err(failure) => failure,
            };

            match failure {
                TransportFailure::Fatal(reason) => break Err(IotError::Connection(reason)),
                TransportFailure::Retry(reason) => match backoff.next_delay() {
                    Ok(delay) => {
                        warn!(
                            reason = %reason,
                            attempt = backoff.attempt(),
                            "Connection attempt failed, retrying in {:.2}s",
                            delay.as_secs_f64()
                        );
                        tokio::select! {
                            biased;
                            _ = inner.cancel.cancelled() => break Err(IotError::ClientClosed),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => break Err(IotError::Connection(format!("{reason} ({e})"))),
                },
            }
        };

        match outcome {
            Ok(session_present) => {
                inner.set_state(ConnectionState::Connected);
                info!(session_present, "Connected to platform");

                let driver = tokio::spawn(drive(self.inner.clone(), events));
                *inner.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(driver);
                drop(slot);

                if let Err(e) = inner.subscriptions.resubscribe_all().await {
                    warn!(error = %e, "Subscriptions will be restored on the next reconnect");
                }
                Ok(())
            }
            Err(IotError::ClientClosed) => {
                debug!("Connect aborted by disconnect");
                Err(IotError::ClientClosed)
            }
            Err(e) => {
                error!(error = %e, "Unable to connect");
                *slot = Some(events);
                inner.set_state(ConnectionState::Disconnected(Some(e.to_string())));
                Err(e)
            }
        }
    }

    /// Closes the session. The connection can't be used afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Disconnecting from platform");

        if !inner.state().is_connected() {
            inner.cancel.cancel();
        }

        if tokio::time::timeout(inner.drain_timeout, inner.drain.wait_idle())
            .await
            .is_err()
        {
            warn!(inflight = inner.drain.inflight(), "Timed out waiting for in-flight publishes");
        }

        {
            let mut transport = inner.transport.lock().await;
            if let Err(e) = transport.disconnect().await {
                warn!(error = %e, "Error sending disconnect");
            }
        }

        let driver = inner.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(inner.drain_timeout, &mut driver).await.is_err() {
                inner.cancel.cancel();
                let _ = driver.await;
            }
        }

        inner.cancel.cancel();
        inner.tracker.clear();
        inner.set_state(ConnectionState::Closed);
        info!("Disconnected from platform");
        Ok(())
    }

    /// Subscribes to a topic filter. While disconnected the filter is only
    /// recorded and issued on the next connect.
    pub async fn subscribe(&self, filter: &str, qos: u8) -> Result<()> {
        self.inner.ensure_open()?;
        let qos = transport::qos(qos)?;
        if filter.is_empty() {
            return Err(IotError::InvalidTopic("subscription filter must not be empty".to_string()));
        }
        self.inner
            .subscriptions
            .subscribe(filter, qos, self.is_connected())
            .await
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner
            .subscriptions
            .unsubscribe(filter, self.is_connected())
            .await
    }

    /// Encodes `data` in `format` and publishes it to `address`.
    pub async fn publish(
        &self,
        address: &TopicAddress,
        format: &str,
        data: impl Into<Payload>,
        qos: u8,
        on_publish: Option<OnPublish>,
    ) -> Result<()> {
        self.inner
            .publisher
            .publish(address, format, data.into(), qos, on_publish)
            .await
    }

    /// Publishes and waits until the transport confirms delivery.
    pub async fn publish_and_wait(
        &self,
        address: &TopicAddress,
        format: &str,
        data: impl Into<Payload>,
        qos: u8,
        timeout: Duration,
    ) -> Result<()> {
        self.inner
            .publisher
            .publish_and_wait(address, format, data.into(), qos, timeout)
            .await
    }

    /// Publishes pre-encoded bytes on an arbitrary topic.
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>, qos: u8, retain: bool) -> Result<()> {
        self.inner.publisher.publish_raw(topic, payload, qos, retain, None).await
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IotError::ClientClosed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if current.is_closed() || *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        if changed {
            info!(state = %state, "Connection state changed");
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message { topic, payload } => {
                self.dispatcher.dispatch(&topic, &payload);
            }
            TransportEvent::Sent { pkid } => self.tracker.on_sent(pkid),
            TransportEvent::Acknowledged { pkid } => self.tracker.on_acknowledged(pkid),
            TransportEvent::Connected { .. } | TransportEvent::Disconnected { .. } => {}
        }
    }
}

/// Runs the established session until it is closed or lost for good.
async fn drive(inner: Arc<Inner>, mut events: Box<dyn EventSource>) {
    let mut backoff = inner.backoff.clone();

    loop {
        let polled = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            polled = events.poll() => polled,
        };

        let failure = match polled {
            Ok(TransportEvent::Connected { session_present }) => {
                backoff.reset();
                inner.set_state(ConnectionState::Connected);
                info!(session_present, "Reconnected to platform");
                let subscriptions = inner.subscriptions.clone();
                tokio::spawn(async move {
                    if let Err(e) = subscriptions.resubscribe_all().await {
                        warn!(error = %e, "Subscriptions will be restored on the next reconnect");
                    }
                });
                continue;
            }
            Ok(TransportEvent::Disconnected { reason }) => TransportFailure::Retry(reason),
            Ok(event) => {
                inner.handle_event(event);
                continue;
            }
            Err(failure) => failure,
        };

        if inner.is_closed() {
            debug!(reason = %failure, "Session ended after disconnect");
            break;
        }
        inner.set_state(ConnectionState::Disconnected(Some(failure.reason().to_string())));

        match failure {
            TransportFailure::Fatal(reason) => {
                error!(reason = %reason, "Connection lost and cannot be re-established");
                break;
            }
            TransportFailure::Retry(reason) => match backoff.next_delay() {
                Ok(delay) => {
                    warn!(
                        reason = %reason,
                        attempt = backoff.attempt(),
                        "Connection lost, reconnecting in {:.2}s",
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        biased;
                        _ = inner.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    inner.set_state(ConnectionState::Connecting);
                }
                Err(e) => {
                    error!(reason = %reason, error = %e, "Giving up reconnecting");
                    break;
                }
            },
        }
    }

    // Hand the event source back so a later connect() can start over.
    if !inner.is_closed() {
        *inner.events.lock().await = Some(events);
    }
}
