//! Subscription bookkeeping.
//!
//! The manager remembers every filter the client asked for so the
//! connection manager can reissue them after each successful connect. A
//! subscribe issued while disconnected is only recorded; the broker sees it
//! on the next connect.

use std::sync::Arc;

use rumqttc::QoS;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::transport::SharedTransport;

#[derive(Clone)]
pub struct SubscriptionManager {
    /// Filters in first-subscribed order; re-subscribing updates the QoS in place.
    filters: Arc<RwLock<Vec<(String, QoS)>>>,

    transport: SharedTransport,
}

impl SubscriptionManager {
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            filters: Arc::new(RwLock::new(Vec::new())),
            transport,
        }
    }

    /// Records `filter` and, when `connected`, subscribes immediately.
    ///
    /// An immediate failure is logged and left to the next resubscription;
    /// the filter stays recorded either way.
    pub async fn subscribe(&self, filter: &str, qos: QoS, connected: bool) -> Result<()> {
        {
            let mut filters = self.filters.write().await;
            match filters.iter_mut().find(|(f, _)| f == filter) {
                Some(entry) => entry.1 = qos,
                None => filters.push((filter.to_string(), qos)),
            }
        }

        if !connected {
            debug!(filter = %filter, "Not connected, subscription deferred until connect");
            return Ok(());
        }

        let mut transport = self.transport.lock().await;
        match transport.subscribe(filter, qos).await {
            Ok(()) => info!(filter = %filter, ?qos, "Subscribed"),
            Err(e) => warn!(
                filter = %filter,
                error = %e,
                "Immediate subscription failed, will retry on reconnect"
            ),
        }
        Ok(())
    }

    /// Forgets `filter` and, when `connected`, unsubscribes from the broker.
    pub async fn unsubscribe(&self, filter: &str, connected: bool) -> Result<()> {
        self.filters.write().await.retain(|(f, _)| f != filter);

        if connected {
            let mut transport = self.transport.lock().await;
            match transport.unsubscribe(filter).await {
                Ok(()) => info!(filter = %filter, "Unsubscribed"),
                Err(e) => warn!(filter = %filter, error = %e, "Failed to unsubscribe"),
            }
        }
        Ok(())
    }

    /// Reissues every recorded filter in one request.
    pub async fn resubscribe_all(&self) -> Result<()> {
        let filters = self.filters.read().await.clone();
        if filters.is_empty() {
            debug!("No subscriptions to restore");
            return Ok(());
        }

        info!(count = filters.len(), "Restoring subscriptions");
        let mut transport = self.transport.lock().await;
        if let Err(e) = transport.subscribe_many(&filters).await {
            error!(error = %e, "Failed to restore subscriptions");
            return Err(e);
        }
        Ok(())
    }

    pub async fn filters(&self) -> Vec<(String, QoS)> {
        self.filters.read().await.clone()
    }

    pub async fn is_subscribed(&self, filter: &str) -> bool {
        self.filters.read().await.iter().any(|(f, _)| f == filter)
    }
}
