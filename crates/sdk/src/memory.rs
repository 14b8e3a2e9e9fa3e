//! In-memory transport for tests and offline development.
//!
//! [`pair`] returns a [`MemoryTransport`] that records every request, a
//! [`MemoryEvents`] source for the connection manager to poll, and a
//! [`Broker`] handle that feeds events into that source. By default the
//! transport behaves like a well-behaved broker: published messages are
//! reported as sent and, for QoS 1/2, acknowledged; a disconnect request is
//! answered with a `Disconnected` event.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::mpsc;

use crate::error::{IotError, Result};
use crate::transport::{EventSource, Transport, TransportEvent, TransportFailure};

type Polled = std::result::Result<TransportEvent, TransportFailure>;

/// A request recorded by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Subscribe { filter: String, qos: QoS },
    Unsubscribe { filter: String },
    Publish { topic: String, qos: QoS, retain: bool, payload: Vec<u8> },
    Disconnect,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Call>>,
    manual_acks: AtomicBool,
    fail_requests: AtomicBool,
    next_pkid: AtomicU16,
}

/// Recording [`Transport`].
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Polled>,
}

/// [`EventSource`] fed by a [`Broker`].
pub struct MemoryEvents {
    rx: mpsc::UnboundedReceiver<Polled>,
}

/// Test handle used to script what the connection manager observes.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Polled>,
}

/// Creates a connected transport/event-source pair and its broker handle.
pub fn pair() -> (MemoryTransport, MemoryEvents, Broker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        MemoryTransport {
            shared: shared.clone(),
            events: tx.clone(),
        },
        MemoryEvents { rx },
        Broker { shared, events: tx },
    )
}

impl MemoryTransport {
    fn record(&self, call: Call) -> Result<()> {
        if self.shared.fail_requests.load(Ordering::SeqCst) {
            return Err(IotError::Transport("request rejected by memory transport".to_string()));
        }
        self.shared.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
        Ok(())
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(Ok(event));
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<()> {
        self.record(Call::Subscribe {
            filter: filter.to_string(),
            qos,
        })
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<()> {
        self.record(Call::Unsubscribe {
            filter: filter.to_string(),
        })
    }

    async fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        self.record(Call::Publish {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        })?;

        if self.shared.manual_acks.load(Ordering::SeqCst) {
            return Ok(());
        }
        if qos == QoS::AtMostOnce {
            self.emit(TransportEvent::Sent { pkid: 0 });
        } else {
            let pkid = self.shared.next_pkid.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            self.emit(TransportEvent::Sent { pkid });
            self.emit(TransportEvent::Acknowledged { pkid });
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.record(Call::Disconnect)?;
        self.emit(TransportEvent::Disconnected {
            reason: "client disconnect".to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl EventSource for MemoryEvents {
    async fn poll(&mut self) -> Polled {
        match self.rx.recv().await {
            Some(polled) => polled,
            None => Err(TransportFailure::Fatal("memory broker dropped".to_string())),
        }
    }
}

impl Broker {
    /// Every request recorded so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `(topic, payload)` of every recorded publish.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish { topic, payload, .. } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    /// Publishes whose topic equals `topic`, decoded as JSON.
    pub fn published_json(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, payload)| serde_json::from_slice(&payload).ok())
            .collect()
    }

    /// Filters of every recorded subscribe.
    pub fn subscriptions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Subscribe { filter, .. } => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.shared.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Stops automatic `Sent`/`Acknowledged` events; use [`Broker::sent`] and
    /// [`Broker::acknowledge`] instead.
    pub fn set_manual_acks(&self, manual: bool) {
        self.shared.manual_acks.store(manual, Ordering::SeqCst);
    }

    /// Makes every subsequent request fail.
    pub fn set_fail_requests(&self, fail: bool) {
        self.shared.fail_requests.store(fail, Ordering::SeqCst);
    }

    pub fn connack(&self) {
        self.push(Ok(TransportEvent::Connected { session_present: false }));
    }

    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) {
        self.push(Ok(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        }));
    }

    pub fn sent(&self, pkid: u16) {
        self.push(Ok(TransportEvent::Sent { pkid }));
    }

    pub fn acknowledge(&self, pkid: u16) {
        self.push(Ok(TransportEvent::Acknowledged { pkid }));
    }

    pub fn drop_link(&self, reason: &str) {
        self.push(Err(TransportFailure::Retry(reason.to_string())));
    }

    pub fn refuse(&self, reason: &str) {
        self.push(Err(TransportFailure::Fatal(reason.to_string())));
    }

    pub fn push(&self, polled: Polled) {
        let _ = self.events.send(polled);
    }
}
