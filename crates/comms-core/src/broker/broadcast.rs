//! Channel-backed broker with at-most-once delivery.
//!
//! Each topic owns a `tokio::sync::broadcast` channel carrying the serialized
//! envelope. Every subscription spawns a listener task holding its own
//! receiver; `publish` returns as soon as the bytes are in the channel, so
//! delivery is decoupled from the publisher. Slow subscribers that fall more
//! than `capacity` messages behind lose the overwritten messages, which is
//! the intended semantics for fan-out status traffic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{MessageBroker, MessageCallback, SubscriptionId};
use crate::envelope::Envelope;
use crate::error::{CommsError, Result};

/// Fan-out broker built on broadcast channels. At-most-once delivery.
pub struct BroadcastBroker {
    /// topic -> sender half; receivers are created per subscription.
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    /// subscription id -> listener task, for teardown.
    listeners: DashMap<SubscriptionId, JoinHandle<()>>,
    capacity: usize,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl BroadcastBroker {
    pub fn new(capacity: usize) -> Self {
        BroadcastBroker {
            channels: DashMap::new(),
            listeners: DashMap::new(),
            capacity: capacity.max(1),
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

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl MessageBroker for BroadcastBroker {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        debug!(capacity = self.capacity, "broadcast broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        for entry in self.listeners.iter() {
            entry.value().abort();
        }
        self.listeners.clear();
        self.channels.clear();
        debug!("broadcast broker disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        self.ensure_connected()?;
        envelope.validate()?;
        let bytes = envelope.to_bytes()?;
        let sender = self.sender_for(topic);
        // A send error only means there are no receivers right now.
        if sender.send(bytes).is_err() {
            debug!(topic, "no subscribers, message dropped");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, callback: MessageCallback) -> Result<SubscriptionId> {
        self.ensure_connected()?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut rx = self.sender_for(topic).subscribe();
        let topic_name = topic.to_string();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bytes) => {
                        let envelope = match Envelope::from_bytes(&bytes) {
                            Ok(env) => env,
                            Err(e) => {
                                warn!(topic = %topic_name, error = %e, "undecodable message");
                                continue;
                            }
                        };
                        if let Err(e) = callback(envelope).await {
                            warn!(topic = %topic_name, error = %e, "subscriber callback failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(topic = %topic_name, missed, "subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.listeners.insert(id, handle);
        debug!(topic, %id, "subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        if let Some((_, handle)) = self.listeners.remove(&id) {
            handle.abort();
            debug!(%id, "unsubscribed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 1s");
    }

    #[tokio::test]
    async fn delivers_through_channel() {
        let broker = BroadcastBroker::new(16);
        broker.connect().await.unwrap();

        let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback: MessageCallback = Arc::new(move |env| {
            let seen = seen_cb.clone();
            Box::pin(async move {
                seen.lock().await.push(env);
                Ok(())
            })
        });
        broker.subscribe("calls", callback).await.unwrap();

        let envelope = Envelope::new(MessageKind::Transcription, "transcriber", "summarizer");
        broker.publish("calls", envelope.clone()).await.unwrap();

        let seen_wait = seen.clone();
        wait_for(move || seen_wait.try_lock().map(|v| !v.is_empty()).unwrap_or(false)).await;
        assert_eq!(seen.lock().await.as_slice(), &[envelope]);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_dropped_not_failed() {
        let broker = BroadcastBroker::new(16);
        broker.connect().await.unwrap();
        let envelope = Envelope::new(MessageKind::Status, "a", "b");
        assert!(broker.publish("nobody", envelope).await.is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_aborts_listener() {
        let broker = BroadcastBroker::new(16);
        broker.connect().await.unwrap();

        let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback: MessageCallback = Arc::new(move |env| {
            let seen = seen_cb.clone();
            Box::pin(async move {
                seen.lock().await.push(env);
                Ok(())
            })
        });
        let id = broker.subscribe("calls", callback).await.unwrap();
        broker.unsubscribe(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let envelope = Envelope::new(MessageKind::Status, "a", "b");
        broker.publish("calls", envelope).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().await.is_empty());
    }
}
