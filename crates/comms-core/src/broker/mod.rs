//! Transport-level publish/subscribe brokers.
//!
//! A broker knows only how to move envelopes between topics and callbacks.
//! Three interchangeable backends are provided, selected by [`BrokerKind`]
//! at construction time:
//!
//! - [`MemoryBroker`]: synchronous in-process fan-out, delivery order =
//!   registration order. The default for tests and single-binary setups.
//! - [`BroadcastBroker`]: each topic is a broadcast channel carrying the
//!   serialized envelope; at-most-once, best-effort delivery.
//! - [`QueuedBroker`]: each topic is a fanout exchange with one queue per
//!   subscriber; messages are acknowledged and removed only after the
//!   callback completes without error, otherwise redelivered.
//!
//! Topics are arbitrary strings chosen at runtime; there is no compile-time
//! topic registry. Every variant carries the same JSON wire shape, so an
//! envelope round-trips losslessly regardless of backend.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::Result;

pub mod broadcast;
pub mod memory;
pub mod queued;

pub use broadcast::BroadcastBroker;
pub use memory::MemoryBroker;
pub use queued::QueuedBroker;

/// Which broker backend a bus should be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Memory,
    Broadcast,
    Queued,
}

/// Broker construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Backend to construct.
    pub kind: BrokerKind,
    /// Per-topic backlog for the broadcast backend.
    pub channel_capacity: usize,
    /// Redelivery attempts before the queued backend drops a message.
    pub max_redeliveries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            kind: BrokerKind::Memory,
            channel_capacity: 1024,
            max_redeliveries: 3,
        }
    }
}

/// Opaque subscription token returned by [`MessageBroker::subscribe`].
///
/// Unsubscription requires the token; handler identity is never used as a
/// key, so handlers can be wrapped freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Callback invoked for each delivered envelope.
///
/// The returned `Result` is the acknowledgement signal: the queued backend
/// redelivers on `Err`, the other backends log and move on.
pub type MessageCallback =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Transport abstraction implemented by all three backends.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Establish the transport. A failure here is fatal to the owning bus.
    async fn connect(&self) -> Result<()>;

    /// Tear down the transport, dropping in-flight messages.
    async fn disconnect(&self) -> Result<()>;

    /// Publish an envelope to a topic.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()>;

    /// Register a callback for a topic.
    async fn subscribe(&self, topic: &str, callback: MessageCallback) -> Result<SubscriptionId>;

    /// Remove a previously registered callback.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

/// Construct the broker selected by the configuration.
pub fn create_broker(config: &BrokerConfig) -> Arc<dyn MessageBroker> {
    match config.kind {
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
        BrokerKind::Broadcast => Arc::new(BroadcastBroker::new(config.channel_capacity)),
        BrokerKind::Queued => Arc::new(QueuedBroker::new(config.max_redeliveries)),
    }
}
