//! Messaging and event substrate for the callgrid pipeline.
//!
//! This crate provides the communication layer the call-processing agents
//! are built on:
//!
//! - [`envelope`]: the `Envelope` message record and its closed
//!   `MessageKind` set
//! - [`broker`]: the `MessageBroker` trait and its three backends
//! - [`bus`]: the `MessageBus` facade agents publish and subscribe through
//! - [`events`]: the `EventSystem` observability side-channel
//! - [`logging`]: `tracing` subscriber setup shared by binaries and tests
//!
//! Nothing here knows about call semantics; routing, scoring, and agent
//! lifecycles live in the engine crate on top.

pub mod broker;
pub mod bus;
pub mod envelope;
pub mod error;
pub mod events;
pub mod logging;

pub use broker::{
    create_broker, BroadcastBroker, BrokerConfig, BrokerKind, MemoryBroker, MessageBroker,
    MessageCallback, QueuedBroker, SubscriptionId,
};
pub use bus::{AuditAction, AuditRecord, BusStats, MessageBus, TopicInfo};
pub use envelope::{Envelope, MessageKind};
pub use error::{CommsError, Result};
pub use events::{
    Event, EventFilter, EventMetrics, EventSystem, EventType, ListenerId, ListenerStats,
};
pub use logging::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
