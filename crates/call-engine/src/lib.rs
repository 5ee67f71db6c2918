//! Call center orchestration engine.
//!
//! Builds on `callgrid-comms-core` to run a pool of long-lived agents over
//! the message bus:
//!
//! - [`agent`]: the lifecycle frame (state machine, inbox, run loop,
//!   built-in status/control handling) and the [`agent::AgentBehavior`]
//!   trait concrete agents implement
//! - [`routing`]: rule evaluation, worker-pool matching, wait queue, and
//!   the routing agent itself
//! - [`server`]: the `CallCenterServer` facade that wires configuration,
//!   bus, events, and agents together
//! - [`config`]: TOML-backed configuration with full defaults
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use callgrid_call_engine::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let server = CallCenterServer::builder()
//!     .with_config(CallCenterConfig::default())
//!     .build();
//!
//! let routing = Arc::new(RoutingAgent::new(server.config().routing.clone()));
//! server.register_agent(AgentConfig::new("Routing", "routing"), routing)?;
//!
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod routing;
pub mod server;

pub use agent::{Agent, AgentBehavior, AgentContext, AgentState};
pub use config::{AgentConfig, CallCenterConfig, GeneralConfig, RoutingConfig};
pub use error::{CallCenterError, Result};
pub use routing::{RoutingAgent, RoutingEngine};
pub use server::{CallCenterServer, CallCenterServerBuilder, ServerStatus};

/// Common imports for building on the engine.
pub mod prelude {
    pub use crate::agent::{
        agent_topic, Agent, AgentBehavior, AgentContext, AgentState, MetricsSnapshot,
        BROADCAST_TOPIC,
    };
    pub use crate::config::{AgentConfig, CallCenterConfig, GeneralConfig, RoutingConfig};
    pub use crate::error::{CallCenterError, Result};
    pub use crate::routing::{
        default_rules, default_worker_pool, CallAttributes, PoolStats, RouteAction, RoutingAgent,
        RoutingEngine, RoutingRule, SkillTier, WorkerProfile,
    };
    pub use crate::server::{AgentStatus, CallCenterServer, CallCenterServerBuilder, ServerStatus};
    pub use callgrid_comms_core::{
        BrokerConfig, BrokerKind, Envelope, Event, EventSystem, EventType, MessageBus, MessageKind,
    };
}
