//! Server facade: owns the bus, the event system, and the agents.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callgrid_comms_core::{
    create_broker, log_welcome, parse_log_level, setup_logging, BusStats, EventMetrics,
    EventSystem, LoggingConfig, MessageBus, SubscriptionId,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::agent::{agent_topic, Agent, AgentBehavior, AgentState, MetricsSnapshot, BROADCAST_TOPIC};
use crate::config::{AgentConfig, CallCenterConfig};
use crate::error::{CallCenterError, Result};

/// One agent's line in the server status report.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub agent_type: String,
    pub state: AgentState,
    pub metrics: MetricsSnapshot,
}

/// Aggregated view over the whole server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub agents: Vec<AgentStatus>,
    pub bus: BusStats,
    pub events: EventMetrics,
}

/// Owns the messaging substrate and every registered agent.
///
/// Startup wires each agent's inbox to its point-to-point topic and the
/// broadcast topic; shutdown unwinds in reverse order. A single agent
/// failing to initialize is a degraded-capacity condition, not a server
/// failure.
pub struct CallCenterServer {
    config: CallCenterConfig,
    bus: Arc<MessageBus>,
    events: Arc<EventSystem>,
    agents: RwLock<Vec<Arc<Agent>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    running: AtomicBool,
}

impl CallCenterServer {
    pub fn builder() -> CallCenterServerBuilder {
        CallCenterServerBuilder::default()
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    pub fn events(&self) -> Arc<EventSystem> {
        self.events.clone()
    }

    pub fn config(&self) -> &CallCenterConfig {
        &self.config
    }

    /// Create and register an agent. Must be called before `start`.
    pub fn register_agent(
        &self,
        config: AgentConfig,
        behavior: Arc<dyn AgentBehavior>,
    ) -> Result<Arc<Agent>> {
        if self.running.load(Ordering::Acquire) {
            return Err(CallCenterError::agent(
                "agents must be registered before the server starts",
            ));
        }
        let agent = Agent::new(
            config,
            behavior,
            self.bus.clone(),
            self.events.clone(),
            Duration::from_millis(self.config.general.agent_poll_interval_ms),
        );
        info!(agent = agent.name(), "agent registered");
        self.agents.write().push(agent.clone());
        Ok(agent)
    }

    pub fn agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.read().iter().find(|a| a.name() == name).cloned()
    }

    /// Set up logging, connect the bus, start the event loop, then bring up
    /// every agent.
    pub async fn start(&self) -> Result<()> {
        // Checked before the running flag flips so a bad level leaves the
        // server stopped.
        let level = parse_log_level(&self.config.general.log_level)?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        setup_logging(LoggingConfig::new(
            level,
            self.config.general.app_name.clone(),
        ))?;
        log_welcome(&self.config.general.app_name, env!("CARGO_PKG_VERSION"));
        info!(app = %self.config.general.app_name, "starting call center server");

        // A broker connect failure aborts startup.
        self.bus.connect().await?;
        self.events.start();

        let agents: Vec<Arc<Agent>> = self.agents.read().clone();
        for agent in agents {
            if let Err(e) = self.bring_up(&agent).await {
                error!(agent = agent.name(), error = %e, "agent failed to start, continuing degraded");
            }
        }
        info!("call center server started");
        Ok(())
    }

    async fn bring_up(&self, agent: &Arc<Agent>) -> Result<()> {
        agent.initialize().await?;

        for topic in [agent_topic(agent.name()), BROADCAST_TOPIC.to_string()] {
            let inbox = agent.clone();
            let id = self
                .bus
                .subscribe(&topic, None, move |envelope| {
                    let inbox = inbox.clone();
                    async move {
                        inbox
                            .receive(envelope)
                            .map_err(|e| callgrid_comms_core::CommsError::communication(e.to_string()))
                    }
                })
                .await?;
            self.subscriptions.lock().push(id);
        }

        agent.start().await
    }

    /// Stop agents, drop subscriptions, stop events, disconnect the bus.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!("stopping call center server");

        let agents: Vec<Arc<Agent>> = self.agents.read().clone();
        for agent in agents {
            if let Err(e) = agent.stop().await {
                warn!(agent = agent.name(), error = %e, "agent stop failed");
            }
        }

        let subscriptions: Vec<SubscriptionId> = self.subscriptions.lock().drain(..).collect();
        for id in subscriptions {
            if let Err(e) = self.bus.unsubscribe(id).await {
                warn!(%id, error = %e, "unsubscribe failed");
            }
        }

        self.events.stop().await;
        self.bus.disconnect().await?;
        info!("call center server stopped");
        Ok(())
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            running: self.running.load(Ordering::Acquire),
            agents: self
                .agents
                .read()
                .iter()
                .map(|a| AgentStatus {
                    name: a.name().to_string(),
                    agent_type: a.context().agent_type.clone(),
                    state: a.state(),
                    metrics: a.metrics(),
                })
                .collect(),
            bus: self.bus.stats(),
            events: self.events.metrics(),
        }
    }
}

/// Builds a [`CallCenterServer`] from configuration.
#[derive(Default)]
pub struct CallCenterServerBuilder {
    config: Option<CallCenterConfig>,
    max_event_history: Option<usize>,
}

impl CallCenterServerBuilder {
    pub fn with_config(mut self, config: CallCenterConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_config_file(mut self, path: impl AsRef<std::path::Path>) -> Result<Self> {
        self.config = Some(CallCenterConfig::from_toml_file(path)?);
        Ok(self)
    }

    pub fn with_max_event_history(mut self, max: usize) -> Self {
        self.max_event_history = Some(max);
        self
    }

    pub fn build(self) -> CallCenterServer {
        let config = self.config.unwrap_or_default();
        let broker = create_broker(&config.broker);
        CallCenterServer {
            bus: Arc::new(MessageBus::new(broker)),
            events: Arc::new(EventSystem::new(self.max_event_history.unwrap_or(1000))),
            config,
            agents: RwLock::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }
}
