//! Bus facade over a broker.
//!
//! The [`MessageBus`] is the surface agents talk to. It owns one broker,
//! keeps delivery counters and a bounded audit trail, and layers
//! per-subscription kind filtering on top of the broker's topic routing.
//! Which backend sits underneath is a construction-time decision; nothing
//! above the bus can tell the difference.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::broker::{MessageBroker, MessageCallback, SubscriptionId};
use crate::envelope::{Envelope, MessageKind};
use crate::error::Result;

const AUDIT_CAPACITY: usize = 1000;

/// What a bus audit entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// One line of the bus audit trail.
///
/// Publish entries carry the envelope fields; subscription entries carry
/// the subscription id instead.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub active_subscriptions: usize,
}

struct HandlerInfo {
    topic: String,
    kinds: Option<Vec<MessageKind>>,
    registered_at: DateTime<Utc>,
    delivered: Arc<AtomicU64>,
}

/// Per-subscription view returned by [`MessageBus::topic_info`].
#[derive(Debug, Clone, Serialize)]
pub struct TopicInfo {
    pub topic: String,
    pub kinds: Option<Vec<MessageKind>>,
    pub registered_at: DateTime<Utc>,
    pub delivered: u64,
}

/// Messaging facade handed to every agent.
pub struct MessageBus {
    broker: Arc<dyn MessageBroker>,
    handlers: DashMap<SubscriptionId, HandlerInfo>,
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    audit: Mutex<VecDeque<AuditRecord>>,
}

impl MessageBus {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        MessageBus {
            broker,
            handlers: DashMap::new(),
            sent: Arc::new(AtomicU64::new(0)),
            received: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            audit: Mutex::new(VecDeque::with_capacity(AUDIT_CAPACITY)),
        }
    }

    fn record(&self, record: AuditRecord) {
        let mut audit = self.audit.lock();
        if audit.len() == AUDIT_CAPACITY {
            audit.pop_front();
        }
        audit.push_back(record);
    }

    pub async fn connect(&self) -> Result<()> {
        self.broker.connect().await?;
        info!("message bus connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.broker.disconnect().await?;
        self.handlers.clear();
        info!("message bus disconnected");
        Ok(())
    }

    /// Publish an envelope to a topic.
    ///
    /// On success the sent counter and audit trail are updated; on failure
    /// only the error counter moves and the error is propagated to the
    /// caller.
    pub async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        let record = AuditRecord {
            timestamp: Utc::now(),
            action: AuditAction::Publish,
            topic: topic.to_string(),
            message_id: Some(envelope.id.clone()),
            kind: Some(envelope.kind),
            sender: Some(envelope.sender.clone()),
            recipient: Some(envelope.recipient.clone()),
            subscription: None,
        };

        match self.broker.publish(topic, envelope).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                self.record(record);
                Ok(())
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                error!(topic, error = %e, "publish failed");
                Err(e)
            }
        }
    }

    /// Subscribe a handler to a topic, optionally filtered by message kind.
    ///
    /// When `kinds` is `Some`, envelopes of other kinds are silently skipped
    /// before the handler runs (they still count as received by the bus).
    pub async fn subscribe<F, Fut>(
        &self,
        topic: &str,
        kinds: Option<Vec<MessageKind>>,
        handler: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let received = self.received.clone();
        let errors = self.errors.clone();
        let delivered = Arc::new(AtomicU64::new(0));
        let delivered_cb = delivered.clone();
        let filter = kinds.clone();

        let callback: MessageCallback = Arc::new(move |envelope: Envelope| {
            let handler = handler.clone();
            let received = received.clone();
            let errors = errors.clone();
            let delivered = delivered_cb.clone();
            let filter = filter.clone();
            Box::pin(async move {
                received.fetch_add(1, Ordering::Relaxed);
                if let Some(filter) = &filter {
                    if !filter.contains(&envelope.kind) {
                        debug!(kind = %envelope.kind, "filtered out by kind");
                        return Ok(());
                    }
                }
                delivered.fetch_add(1, Ordering::Relaxed);
                match handler(envelope).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // Surfaced to the broker so the queued backend can
                        // redeliver.
                        errors.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "message handler failed");
                        Err(e)
                    }
                }
            })
        });

        let id = self.broker.subscribe(topic, callback).await?;
        self.handlers.insert(
            id,
            HandlerInfo {
                topic: topic.to_string(),
                kinds,
                registered_at: Utc::now(),
                delivered,
            },
        );
        self.record(AuditRecord {
            timestamp: Utc::now(),
            action: AuditAction::Subscribe,
            topic: topic.to_string(),
            message_id: None,
            kind: None,
            sender: None,
            recipient: None,
            subscription: Some(id.to_string()),
        });
        debug!(topic, %id, "bus subscription registered");
        Ok(id)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        // Topic is looked up before the registry entry goes away.
        let topic = self
            .handlers
            .get(&id)
            .map(|info| info.topic.clone())
            .unwrap_or_default();
        self.broker.unsubscribe(id).await?;
        self.handlers.remove(&id);
        self.record(AuditRecord {
            timestamp: Utc::now(),
            action: AuditAction::Unsubscribe,
            topic,
            message_id: None,
            kind: None,
            sender: None,
            recipient: None,
            subscription: Some(id.to_string()),
        });
        Ok(())
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            active_subscriptions: self.handlers.len(),
        }
    }

    /// Envelopes delivered to a given subscription after kind filtering.
    pub fn delivered_count(&self, id: SubscriptionId) -> Option<u64> {
        self.handlers
            .get(&id)
            .map(|info| info.delivered.load(Ordering::Relaxed))
    }

    /// Per-subscription registry snapshot.
    pub fn topic_info(&self) -> Vec<TopicInfo> {
        self.handlers
            .iter()
            .map(|entry| {
                let info = entry.value();
                TopicInfo {
                    topic: info.topic.clone(),
                    kinds: info.kinds.clone(),
                    registered_at: info.registered_at,
                    delivered: info.delivered.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Topics with at least one live subscription.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.value().topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Snapshot of the most recent audit entries, oldest first.
    pub fn audit_trail(&self, limit: usize) -> Vec<AuditRecord> {
        let audit = self.audit.lock();
        let skip = audit.len().saturating_sub(limit);
        audit.iter().skip(skip).cloned().collect()
    }
}
