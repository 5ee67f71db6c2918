//! Agent lifecycle frame.
//!
//! An [`Agent`] is a long-lived worker with an explicit state machine, a
//! private inbound queue, and a run loop that dispatches envelopes by kind.
//! Domain logic plugs in through [`AgentBehavior`]; the frame owns
//! everything else: state transitions, the inbox, built-in status and
//! control handling, and per-message metrics.
//!
//! Every agent listens on its point-to-point topic (`agent_<name>`) and on
//! the shared `broadcast` topic; the server facade wires those
//! subscriptions to [`Agent::receive`].

pub mod metrics;
pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use callgrid_comms_core::{Envelope, Event, EventSystem, MessageBus, MessageKind};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{CallCenterError, Result};

pub use metrics::{AgentMetrics, MetricsSnapshot};
pub use state::{AgentState, StateChange, StateTracker};

/// Fan-out topic every agent is subscribed to.
pub const BROADCAST_TOPIC: &str = "broadcast";

/// Point-to-point topic for one agent's inbound queue.
pub fn agent_topic(name: &str) -> String {
    format!("agent_{}", name.to_lowercase())
}

/// Domain hooks a concrete agent plugs into the frame.
///
/// `initialize` and `handle_message` are required; the start/stop hooks
/// default to no-ops. Hook failures in `initialize`/`on_start` are fatal
/// to the agent (it enters `Error`); failures in `handle_message` are
/// logged and counted but never terminate the run loop.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    async fn initialize(&self, ctx: &AgentContext) -> Result<()>;

    async fn on_start(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    async fn handle_message(&self, ctx: &AgentContext, envelope: Envelope) -> Result<()>;
}

/// Everything a behavior needs to talk to the rest of the system.
#[derive(Clone)]
pub struct AgentContext {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub config: AgentConfig,
    pub bus: Arc<MessageBus>,
    pub events: Arc<EventSystem>,
    state_data: Arc<RwLock<HashMap<String, Value>>>,
}

impl AgentContext {
    /// Publish an envelope to the recipient's point-to-point topic.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        let topic = agent_topic(&envelope.recipient);
        self.bus.publish(&topic, envelope).await?;
        Ok(())
    }

    /// Emit a system event. Never blocks.
    pub fn emit(&self, event: Event) -> Result<()> {
        self.events.publish(event)?;
        Ok(())
    }

    /// Reply to a failed request with an `error` envelope.
    pub async fn reply_error(&self, original: &Envelope, description: &str) -> Result<()> {
        let reply = original
            .reply(MessageKind::Error, self.name.clone())
            .with_entry("error", json!(description))
            .with_entry("original_message_id", json!(original.id));
        self.send(reply).await
    }

    pub fn set_state_data(&self, key: impl Into<String>, value: Value) {
        self.state_data.write().insert(key.into(), value);
    }

    pub fn get_state_data(&self, key: &str) -> Option<Value> {
        self.state_data.read().get(key).cloned()
    }

    pub fn clear_state_data(&self) {
        self.state_data.write().clear();
    }
}

/// The lifecycle frame wrapping one behavior.
pub struct Agent {
    ctx: AgentContext,
    behavior: Arc<dyn AgentBehavior>,
    state: StateTracker,
    metrics: Arc<AgentMetrics>,
    inbox_tx: mpsc::UnboundedSender<Envelope>,
    /// Receiver parked here while the run loop is stopped.
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    running: Arc<AtomicBool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    weak: Weak<Agent>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        behavior: Arc<dyn AgentBehavior>,
        bus: Arc<MessageBus>,
        events: Arc<EventSystem>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak| Agent {
            ctx: AgentContext {
                id: Uuid::new_v4().to_string(),
                name: config.name.clone(),
                agent_type: config.agent_type.clone(),
                config,
                bus,
                events,
                state_data: Arc::new(RwLock::new(HashMap::new())),
            },
            behavior,
            state: StateTracker::new(),
            metrics: Arc::new(AgentMetrics::new()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            running: Arc::new(AtomicBool::new(false)),
            loop_handle: Mutex::new(None),
            poll_interval,
            weak: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn state(&self) -> AgentState {
        self.state.current()
    }

    pub fn state_history(&self) -> Vec<StateChange> {
        self.state.history()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run the initialize hook and move to `Ready`.
    ///
    /// Legal from `Idle`, `Shutdown`, and `Error`. A hook failure leaves
    /// the agent in `Error` and propagates.
    pub async fn initialize(&self) -> Result<()> {
        self.state.transition(AgentState::Initializing)?;
        info!(agent = %self.ctx.name, "initializing agent");
        match self.behavior.initialize(&self.ctx).await {
            Ok(()) => {
                self.state.transition(AgentState::Ready)?;
                Ok(())
            }
            Err(e) => {
                error!(agent = %self.ctx.name, error = %e, "initialization failed");
                self.state.transition(AgentState::Error)?;
                Err(e)
            }
        }
    }

    /// Spawn the run loop. Requires `Ready`.
    pub async fn start(&self) -> Result<()> {
        if self.state.current() != AgentState::Ready {
            return Err(CallCenterError::agent(format!(
                "cannot start agent {} from state {}",
                self.ctx.name,
                self.state.current()
            )));
        }
        let Some(mut rx) = self.inbox_rx.lock().take() else {
            return Err(CallCenterError::agent(format!(
                "agent {} is already running",
                self.ctx.name
            )));
        };

        if let Err(e) = self.behavior.on_start(&self.ctx).await {
            error!(agent = %self.ctx.name, error = %e, "start hook failed");
            self.state.transition(AgentState::Error)?;
            *self.inbox_rx.lock() = Some(rx);
            return Err(e);
        }

        self.running.store(true, Ordering::Release);
        let weak = self.weak.clone();
        let poll = self.poll_interval;
        let handle = tokio::spawn(async move {
            loop {
                let Some(agent) = weak.upgrade() else { break };
                if !agent.running.load(Ordering::Acquire) {
                    break;
                }
                match tokio::time::timeout(poll, rx.recv()).await {
                    Ok(Some(envelope)) => agent.dispatch(envelope).await,
                    Ok(None) => break,
                    Err(_) => continue, // poll timeout, re-check stop flag
                }
            }
            if let Some(agent) = weak.upgrade() {
                *agent.inbox_rx.lock() = Some(rx);
            }
        });
        *self.loop_handle.lock() = Some(handle);
        info!(agent = %self.ctx.name, "agent started");
        Ok(())
    }

    /// Stop the run loop and move to `Shutdown`. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<()> {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if was_running {
            if let Err(e) = self.behavior.on_stop(&self.ctx).await {
                warn!(agent = %self.ctx.name, error = %e, "stop hook failed");
            }
        }
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if matches!(
            self.state.current(),
            AgentState::Ready | AgentState::Processing
        ) {
            self.state.transition(AgentState::Shutdown)?;
        }
        info!(agent = %self.ctx.name, "agent stopped");
        Ok(())
    }

    /// Full restart: stop, re-initialize, start.
    ///
    /// Returns a boxed future: the run loop can trigger a restart through
    /// the control command, and boxing keeps that recursion out of the
    /// opaque future `start` spawns.
    pub fn restart(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(agent = %self.ctx.name, "restarting agent");
            self.stop().await?;
            self.initialize().await?;
            self.start().await
        })
    }

    /// Enqueue an envelope for the run loop. Never blocks the caller.
    pub fn receive(&self, envelope: Envelope) -> Result<()> {
        self.inbox_tx
            .send(envelope)
            .map_err(|_| CallCenterError::agent(format!("agent {} inbox closed", self.ctx.name)))
    }

    async fn dispatch(&self, envelope: Envelope) {
        if self.state.transition(AgentState::Processing).is_err() {
            // Shutting down or faulted; the message is dropped with a trace.
            debug!(agent = %self.ctx.name, id = %envelope.id, "not ready, message dropped");
            return;
        }
        let started = Instant::now();
        let outcome = match envelope.kind {
            MessageKind::Status => self.handle_status(&envelope).await,
            MessageKind::Control => self.handle_control(&envelope).await,
            MessageKind::CallIntake
            | MessageKind::Transcription
            | MessageKind::Summary
            | MessageKind::QualityScore
            | MessageKind::Routing
            | MessageKind::Error => self.behavior.handle_message(&self.ctx, envelope.clone()).await,
        };
        let latency = started.elapsed();
        match outcome {
            Ok(()) => self.metrics.record_success(latency),
            Err(e) => {
                self.metrics.record_failure(latency);
                error!(agent = %self.ctx.name, id = %envelope.id, kind = %envelope.kind,
                    error = %e, "message handler failed");
            }
        }
        if let Err(e) = self.state.transition(AgentState::Ready) {
            debug!(agent = %self.ctx.name, error = %e, "post-dispatch transition skipped");
        }
    }

    async fn handle_status(&self, request: &Envelope) -> Result<()> {
        let metrics = self.metrics.snapshot();
        let reply = request
            .reply(MessageKind::Status, self.ctx.name.clone())
            .with_entry("agent_id", json!(self.ctx.id))
            .with_entry("name", json!(self.ctx.name))
            .with_entry("agent_type", json!(self.ctx.agent_type))
            .with_entry("state", json!(self.state.current().as_str()))
            .with_entry(
                "metrics",
                serde_json::to_value(metrics).map_err(callgrid_comms_core::CommsError::from)?,
            );
        self.ctx.send(reply).await
    }

    async fn handle_control(&self, request: &Envelope) -> Result<()> {
        let command = request
            .payload
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match command {
            "restart" => {
                // Detached so the run loop can be joined by stop().
                if let Some(agent) = self.weak.upgrade() {
                    tokio::spawn(async move {
                        if let Err(e) = agent.restart().await {
                            error!(agent = %agent.ctx.name, error = %e, "restart failed");
                        }
                    });
                }
                Ok(())
            }
            "reset_metrics" => {
                self.metrics.reset();
                Ok(())
            }
            "clear_state" => {
                self.ctx.clear_state_data();
                Ok(())
            }
            other => {
                warn!(agent = %self.ctx.name, command = other, "unknown control command");
                Err(CallCenterError::agent(format!(
                    "unknown control command: {other}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callgrid_comms_core::MemoryBroker;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::Mutex as AsyncMutex;

    struct Recorder {
        handled: Arc<AsyncMutex<Vec<Envelope>>>,
        init_failures: AtomicU64,
    }

    impl Recorder {
        fn new() -> Self {
            Recorder {
                handled: Arc::new(AsyncMutex::new(Vec::new())),
                init_failures: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl AgentBehavior for Recorder {
        async fn initialize(&self, _ctx: &AgentContext) -> Result<()> {
            if self.init_failures.load(Ordering::SeqCst) > 0 {
                self.init_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(CallCenterError::agent("init failed"));
            }
            Ok(())
        }

        async fn handle_message(&self, _ctx: &AgentContext, envelope: Envelope) -> Result<()> {
            self.handled.lock().await.push(envelope);
            Ok(())
        }
    }

    fn test_agent(behavior: Arc<dyn AgentBehavior>) -> Arc<Agent> {
        let bus = Arc::new(MessageBus::new(Arc::new(MemoryBroker::new())));
        let events = Arc::new(EventSystem::new(100));
        Agent::new(
            AgentConfig::new("Tester", "test"),
            behavior,
            bus,
            events,
            Duration::from_millis(20),
        )
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 1s");
    }

    #[tokio::test]
    async fn lifecycle_and_message_dispatch() {
        let recorder = Arc::new(Recorder::new());
        let handled = recorder.handled.clone();
        let agent = test_agent(recorder);

        assert_eq!(agent.state(), AgentState::Idle);
        agent.initialize().await.unwrap();
        assert_eq!(agent.state(), AgentState::Ready);
        agent.start().await.unwrap();

        agent
            .receive(Envelope::new(MessageKind::Transcription, "intake", "Tester"))
            .unwrap();
        let agent_wait = agent.clone();
        wait_until(move || agent_wait.metrics().processed == 1).await;
        assert_eq!(handled.lock().await.len(), 1);

        agent.stop().await.unwrap();
        assert_eq!(agent.state(), AgentState::Shutdown);
        // Idempotent.
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_requires_ready() {
        let agent = test_agent(Arc::new(Recorder::new()));
        assert!(matches!(
            agent.start().await,
            Err(CallCenterError::Agent(_))
        ));
    }

    #[tokio::test]
    async fn failed_initialize_enters_error_and_restart_recovers() {
        let recorder = Arc::new(Recorder::new());
        recorder.init_failures.store(1, Ordering::SeqCst);
        let agent = test_agent(recorder);

        assert!(agent.initialize().await.is_err());
        assert_eq!(agent.state(), AgentState::Error);

        // Second attempt succeeds; Error -> Initializing is legal.
        agent.initialize().await.unwrap();
        assert_eq!(agent.state(), AgentState::Ready);
    }

    #[tokio::test]
    async fn control_reset_metrics_and_clear_state() {
        let agent = test_agent(Arc::new(Recorder::new()));
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        agent.context().set_state_data("cursor", json!(42));

        agent
            .receive(Envelope::new(MessageKind::Summary, "x", "Tester"))
            .unwrap();
        let agent_wait = agent.clone();
        wait_until(move || agent_wait.metrics().processed == 1).await;

        let reset = Envelope::new(MessageKind::Control, "operator", "Tester")
            .with_entry("command", json!("reset_metrics"));
        agent.receive(reset).unwrap();
        let clear = Envelope::new(MessageKind::Control, "operator", "Tester")
            .with_entry("command", json!("clear_state"));
        agent.receive(clear).unwrap();

        let agent_wait = agent.clone();
        wait_until(move || agent_wait.context().get_state_data("cursor").is_none()).await;
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_control_command_recovers_the_loop() {
        let recorder = Arc::new(Recorder::new());
        let handled = recorder.handled.clone();
        let agent = test_agent(recorder);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        let restart = Envelope::new(MessageKind::Control, "operator", "Tester")
            .with_entry("command", json!("restart"));
        agent.receive(restart).unwrap();

        // The detached restart cycles Shutdown -> Initializing -> Ready.
        let agent_wait = agent.clone();
        wait_until(move || {
            agent_wait
                .state_history()
                .iter()
                .filter(|c| c.to == AgentState::Ready)
                .count()
                >= 2
        })
        .await;
        assert_eq!(agent.state(), AgentState::Ready);

        // The fresh loop still dispatches messages.
        agent
            .receive(Envelope::new(MessageKind::Summary, "intake", "Tester"))
            .unwrap();
        let handled_wait = handled.clone();
        wait_until(move || handled_wait.try_lock().map(|v| v.len() == 1).unwrap_or(false)).await;

        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn handler_failure_never_kills_the_loop() {
        struct Failing;
        #[async_trait]
        impl AgentBehavior for Failing {
            async fn initialize(&self, _ctx: &AgentContext) -> Result<()> {
                Ok(())
            }
            async fn handle_message(&self, _ctx: &AgentContext, _e: Envelope) -> Result<()> {
                Err(CallCenterError::agent("boom"))
            }
        }

        let agent = test_agent(Arc::new(Failing));
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        for _ in 0..3 {
            agent
                .receive(Envelope::new(MessageKind::Routing, "x", "Tester"))
                .unwrap();
        }
        let agent_wait = agent.clone();
        wait_until(move || agent_wait.metrics().processed == 3).await;
        assert_eq!(agent.metrics().failed, 3);
        assert_eq!(agent.state(), AgentState::Ready);
        agent.stop().await.unwrap();
    }

    #[test]
    fn topic_naming_is_lowercased() {
        assert_eq!(agent_topic("Routing"), "agent_routing");
        assert_eq!(agent_topic("system"), "agent_system");
    }
}
