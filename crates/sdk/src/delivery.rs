//! Publish bookkeeping: in-flight accounting and delivery confirmation.
//!
//! [`PublishDrain`] counts publishes that are inside the client so
//! `disconnect()` can wait for them before closing the transport.
//!
//! [`DeliveryTracker`] fires a publish's `on_publish` callback once the
//! transport confirms it. Confirmations arrive as two kinds of event:
//! `Sent { pkid }` when a publish leaves the client (in submission order)
//! and `Acknowledged { pkid }` when the broker completes the QoS flow. The
//! tracker queues callbacks in submission order, binds each to its packet id
//! on `Sent`, and fires it on `Sent` for QoS 0 or on `Acknowledged` otherwise.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rumqttc::QoS;
use tokio::sync::Notify;
use tracing::{trace, warn};

/// Callback fired once a publish is confirmed.
pub type OnPublish = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
pub struct PublishDrain {
    inflight: AtomicUsize,
    notify: Notify,
}

impl PublishDrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> PublishGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        PublishGuard { drain: self.clone() }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Resolves once no publish is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct PublishGuard {
    drain: Arc<PublishDrain>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

#[derive(Default)]
pub struct DeliveryTracker {
    queued: Mutex<VecDeque<(QoS, Option<OnPublish>)>>,
    /// QoS 1/2 packets sent and not yet acknowledged, with or without a
    /// callback.
    awaiting: Mutex<HashMap<u16, Option<OnPublish>>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a publish about to be handed to the transport. Must be
    /// called while holding the transport lock so queue order matches
    /// submission order.
    pub fn enqueue(&self, qos: QoS, on_publish: Option<OnPublish>) {
        self.queued.lock().unwrap_or_else(|e| e.into_inner()).push_back((qos, on_publish));
    }

    /// Withdraws the most recent [`DeliveryTracker::enqueue`] after the
    /// transport rejected the publish.
    pub fn withdraw_last(&self) {
        self.queued.lock().unwrap_or_else(|e| e.into_inner()).pop_back();
    }

    /// A packet left the client. A packet id that is still awaiting its
    /// acknowledgement is a retransmission after reconnect and consumes
    /// nothing from the queue.
    pub fn on_sent(&self, pkid: u16) {
        let mut awaiting = self.awaiting.lock().unwrap_or_else(|e| e.into_inner());
        if pkid != 0 && awaiting.contains_key(&pkid) {
            trace!(pkid, "Publish retransmitted");
            return;
        }

        let next = self.queued.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        let Some((qos, on_publish)) = next else {
            trace!(pkid, "Sent event without a queued publish");
            return;
        };
        if qos != QoS::AtMostOnce {
            awaiting.insert(pkid, on_publish);
            return;
        }
        drop(awaiting);
        if let Some(on_publish) = on_publish {
            fire(on_publish);
        }
    }

    pub fn on_acknowledged(&self, pkid: u16) {
        let callback = self
            .awaiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pkid)
            .flatten();
        if let Some(on_publish) = callback {
            fire(on_publish);
        }
    }

    /// Number of callbacks that have not fired yet.
    pub fn pending(&self) -> usize {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, cb)| cb.is_some())
            .count();
        let awaiting = self
            .awaiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|cb| cb.is_some())
            .count();
        queued + awaiting
    }

    /// Drops every outstanding callback without firing it.
    pub fn clear(&self) {
        self.queued.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.awaiting.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn fire(on_publish: OnPublish) {
    if catch_unwind(AssertUnwindSafe(on_publish)).is_err() {
        warn!("on_publish callback panicked");
    }
}
