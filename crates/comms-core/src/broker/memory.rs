//! In-process broker with direct fan-out.
//!
//! Delivery is synchronous with respect to `publish`: every callback for the
//! topic is awaited, in registration order, before `publish` returns. This
//! makes tests deterministic and keeps single-binary deployments free of any
//! channel machinery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::broker::{MessageBroker, MessageCallback, SubscriptionId};
use crate::envelope::Envelope;
use crate::error::{CommsError, Result};

/// Direct fan-out broker. The default backend.
pub struct MemoryBroker {
    /// topic -> ordered list of (subscription id, callback)
    subscriptions: DashMap<String, Vec<(SubscriptionId, MessageCallback)>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CommsError::NotConnected)
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        debug!("memory broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        self.subscriptions.clear();
        debug!("memory broker disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        self.ensure_connected()?;
        envelope.validate()?;

        // Clone the callback list out so no map shard lock is held across
        // an await point.
        let callbacks: Vec<MessageCallback> = match self.subscriptions.get(topic) {
            Some(entry) => entry.iter().map(|(_, cb)| cb.clone()).collect(),
            None => {
                debug!(topic, "no subscribers, dropping message");
                return Ok(());
            }
        };

        for callback in callbacks {
            if let Err(e) = callback(envelope.clone()).await {
                warn!(topic, error = %e, "subscriber callback failed");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, callback: MessageCallback) -> Result<SubscriptionId> {
        self.ensure_connected()?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .entry(topic.to_string())
            .or_default()
            .push((id, callback));
        debug!(topic, %id, "subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        for mut entry in self.subscriptions.iter_mut() {
            let before = entry.len();
            entry.retain(|(sub_id, _)| *sub_id != id);
            if entry.len() != before {
                debug!(%id, topic = entry.key(), "unsubscribed");
                return Ok(());
            }
        }
        // Unknown ids are tolerated; double-unsubscribe is not an error.
        Ok(())
    }
}
