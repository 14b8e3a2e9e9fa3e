//! Outbound message path.
//!
//! The `Publisher` turns `(address, format, data)` into a wire message:
//!
//! 1. refuses with `ClientClosed` once the client is closed (no I/O),
//! 2. wraps the data in an outbound [`Envelope`] and encodes it with the
//!    codec registered for `format`,
//! 3. renders the topic from the [`TopicAddress`],
//! 4. hands the bytes to the transport under the transport lock, queueing
//!    the `on_publish` callback with the [`DeliveryTracker`] in the same
//!    critical section.
//!
//! Every publish holds a [`PublishDrain`] guard for its whole duration so
//! `disconnect()` can wait for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::oneshot;
use tracing::debug;

use crate::codec::CodecRegistry;
use crate::delivery::{DeliveryTracker, OnPublish, PublishDrain};
use crate::error::{IotError, Result};
use crate::message::{Envelope, Payload};
use crate::topic::TopicAddress;
use crate::transport::{self, SharedTransport};

#[derive(Clone)]
pub struct Publisher {
    codecs: Arc<CodecRegistry>,

    transport: SharedTransport,

    tracker: Arc<DeliveryTracker>,

    drain: Arc<PublishDrain>,

    closed: Arc<AtomicBool>,
}

impl Publisher {
    pub fn new(
        codecs: Arc<CodecRegistry>,
        transport: SharedTransport,
        tracker: Arc<DeliveryTracker>,
        drain: Arc<PublishDrain>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            codecs,
            transport,
            tracker,
            drain,
            closed,
        }
    }

    /// Encodes `data` with the codec for `format` and publishes it.
    ///
    /// `on_publish` fires once the transport confirms the message (see
    /// [`crate::delivery`]).
    pub async fn publish(
        &self,
        address: &TopicAddress,
        format: &str,
        data: Payload,
        qos: u8,
        on_publish: Option<OnPublish>,
    ) -> Result<()> {
        let _guard = self.drain.enter();
        self.ensure_open()?;

        let qos = transport::qos(qos)?;
        let topic = address.topic(format)?;
        let envelope = Envelope::outbound(format, data);
        let payload = self.codecs.encode(&envelope)?;

        self.send(&topic, payload, qos, false, on_publish).await
    }

    /// Publishes pre-encoded bytes on an arbitrary topic.
    pub async fn publish_raw(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
        on_publish: Option<OnPublish>,
    ) -> Result<()> {
        let _guard = self.drain.enter();
        self.ensure_open()?;

        let qos = transport::qos(qos)?;
        self.send(topic, payload, qos, retain, on_publish).await
    }

    /// Publishes and waits for the transport's confirmation.
    ///
    /// Fails with `RequestTimedOut` when no confirmation arrives within
    /// `timeout`.
    pub async fn publish_and_wait(
        &self,
        address: &TopicAddress,
        format: &str,
        data: Payload,
        qos: u8,
        timeout: Duration,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let confirm: OnPublish = Box::new(move || {
            let _ = tx.send(());
        });
        self.publish(address, format, data, qos, Some(confirm)).await?;

        let topic = address.topic(format)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(IotError::RequestTimedOut(format!(
                "confirmation for '{topic}' abandoned"
            ))),
            Err(_) => Err(IotError::RequestTimedOut(format!(
                "no confirmation for '{topic}' within {timeout:?}"
            ))),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IotError::ClientClosed);
        }
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        on_publish: Option<OnPublish>,
    ) -> Result<()> {
        debug!(topic = %topic, bytes = payload.len(), ?qos, "Publishing");

        let mut transport = self.transport.lock().await;
        self.tracker.enqueue(qos, on_publish);
        if let Err(e) = transport.publish(topic, qos, retain, payload).await {
            self.tracker.withdraw_last();
            return Err(e);
        }
        Ok(())
    }
}
