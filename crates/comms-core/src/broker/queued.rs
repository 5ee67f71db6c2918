//! Queue-per-subscriber broker with acknowledgement and redelivery.
//!
//! Topics act as fanout exchanges: publishing enqueues a copy of the message
//! onto every subscriber's private queue. A worker task per subscription
//! drains its queue and invokes the callback; the message is acknowledged
//! (removed for good) only when the callback returns `Ok`. On `Err` the
//! message is redelivered, with a short backoff, up to the configured
//! redelivery limit, after which it is dropped with a warning.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{MessageBroker, MessageCallback, SubscriptionId};
use crate::envelope::Envelope;
use crate::error::{CommsError, Result};

const REDELIVERY_BACKOFF: Duration = Duration::from_millis(50);

struct Delivery {
    bytes: Vec<u8>,
    attempts: u32,
}

struct Subscriber {
    topic: String,
    queue: mpsc::UnboundedSender<Delivery>,
    worker: JoinHandle<()>,
}

/// Acknowledged broker. At-least-once delivery up to the redelivery limit.
pub struct QueuedBroker {
    subscribers: DashMap<SubscriptionId, Subscriber>,
    max_redeliveries: u32,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl QueuedBroker {
    pub fn new(max_redeliveries: u32) -> Self {
        QueuedBroker {
            subscribers: DashMap::new(),
            max_redeliveries,
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

#[async_trait]
impl MessageBroker for QueuedBroker {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        debug!(max_redeliveries = self.max_redeliveries, "queued broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        for entry in self.subscribers.iter() {
            entry.value().worker.abort();
        }
        self.subscribers.clear();
        debug!("queued broker disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        self.ensure_connected()?;
        envelope.validate()?;
        let bytes = envelope.to_bytes()?;

        let mut enqueued = 0usize;
        for entry in self.subscribers.iter() {
            if entry.value().topic != topic {
                continue;
            }
            let delivery = Delivery {
                bytes: bytes.clone(),
                attempts: 0,
            };
            if entry.value().queue.send(delivery).is_ok() {
                enqueued += 1;
            }
        }
        if enqueued == 0 {
            debug!(topic, "no queues bound, message dropped");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, callback: MessageCallback) -> Result<SubscriptionId> {
        self.ensure_connected()?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let requeue = tx.clone();
        let topic_name = topic.to_string();
        let max_redeliveries = self.max_redeliveries;

        let worker = tokio::spawn(async move {
            while let Some(mut delivery) = rx.recv().await {
                let envelope = match Envelope::from_bytes(&delivery.bytes) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!(topic = %topic_name, error = %e, "undecodable message dropped");
                        continue;
                    }
                };
                match callback(envelope).await {
                    Ok(()) => {} // acknowledged
                    Err(e) => {
                        delivery.attempts += 1;
                        if delivery.attempts > max_redeliveries {
                            warn!(
                                topic = %topic_name,
                                attempts = delivery.attempts,
                                error = %e,
                                "redelivery limit reached, message dropped"
                            );
                            continue;
                        }
                        debug!(
                            topic = %topic_name,
                            attempt = delivery.attempts,
                            error = %e,
                            "callback failed, redelivering"
                        );
                        tokio::time::sleep(REDELIVERY_BACKOFF).await;
                        if requeue.send(delivery).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.subscribers.insert(
            id,
            Subscriber {
                topic: topic.to_string(),
                queue: tx,
                worker,
            },
        );
        debug!(topic, %id, "queue bound");
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        if let Some((_, subscriber)) = self.subscribers.remove(&id) {
            subscriber.worker.abort();
            debug!(%id, topic = %subscriber.topic, "queue unbound");
        }
        Ok(())
    }
}
