//! System-wide event distribution with bounded history.
//!
//! Events are the observability side-channel: agents publish facts about
//! what happened (a call started, a score was produced, an escalation
//! fired) and interested parties listen without participating in the
//! message flow. One background loop drains the queue, records history,
//! and fans out to listeners; `publish` never blocks the caller.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CommsError, Result};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Closed set of system event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CallStarted,
    CallEnded,
    TranscriptionCompleted,
    SummaryGenerated,
    QualityScored,
    CallRouted,
    AgentAssigned,
    EscalationTriggered,
    SystemAlert,
    PerformanceMetric,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CallStarted => "call_started",
            EventType::CallEnded => "call_ended",
            EventType::TranscriptionCompleted => "transcription_completed",
            EventType::SummaryGenerated => "summary_generated",
            EventType::QualityScored => "quality_scored",
            EventType::CallRouted => "call_routed",
            EventType::AgentAssigned => "agent_assigned",
            EventType::EscalationTriggered => "escalation_triggered",
            EventType::SystemAlert => "system_alert",
            EventType::PerformanceMetric => "performance_metric",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A system event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>) -> Self {
        Event {
            id: Uuid::new_v4().to_string(),
            event_type,
            source: source.into(),
            timestamp: Utc::now(),
            data: HashMap::new(),
            correlation_id: None,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn call_started(source: impl Into<String>, call_id: &str, caller: &str) -> Self {
        Event::new(EventType::CallStarted, source)
            .with_data("call_id", json!(call_id))
            .with_data("caller", json!(caller))
            .with_correlation_id(call_id)
    }

    pub fn call_ended(source: impl Into<String>, call_id: &str, duration_secs: u64) -> Self {
        Event::new(EventType::CallEnded, source)
            .with_data("call_id", json!(call_id))
            .with_data("duration_secs", json!(duration_secs))
            .with_correlation_id(call_id)
    }

    pub fn quality_scored(source: impl Into<String>, call_id: &str, score: f64) -> Self {
        Event::new(EventType::QualityScored, source)
            .with_data("call_id", json!(call_id))
            .with_data("score", json!(score))
            .with_correlation_id(call_id)
    }

    pub fn call_routed(source: impl Into<String>, call_id: &str, action: &str) -> Self {
        Event::new(EventType::CallRouted, source)
            .with_data("call_id", json!(call_id))
            .with_data("action", json!(action))
            .with_correlation_id(call_id)
    }

    pub fn system_alert(source: impl Into<String>, severity: &str, message: &str) -> Self {
        Event::new(EventType::SystemAlert, source)
            .with_data("severity", json!(severity))
            .with_data("message", json!(message))
    }
}

/// Opaque listener token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Predicate applied before a listener's handler runs.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
struct Listener {
    id: ListenerId,
    types: Vec<EventType>,
    filter: Option<EventFilter>,
    handler: EventHandler,
    invoked: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

/// Point-in-time event system counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventMetrics {
    pub published: u64,
    pub processed: u64,
    pub history_len: usize,
    pub listeners: usize,
}

/// Per-listener delivery stats.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStats {
    #[serde(skip)]
    pub id: ListenerId,
    pub types: Vec<EventType>,
    pub invoked: u64,
    pub failed: u64,
}

/// In-process event fan-out with bounded history.
pub struct EventSystem {
    tx: mpsc::UnboundedSender<Event>,
    /// Receiver parked here while the loop is stopped, so the system can
    /// be restarted without losing queued events.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    listeners: RwLock<Vec<Listener>>,
    history: Mutex<VecDeque<Event>>,
    max_history: usize,
    running: Arc<AtomicBool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    next_listener_id: AtomicU64,
    published: AtomicU64,
    processed: Arc<AtomicU64>,
}

impl EventSystem {
    pub fn new(max_history: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        EventSystem {
            tx,
            rx: Mutex::new(Some(rx)),
            listeners: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            max_history: max_history.max(1),
            running: Arc::new(AtomicBool::new(false)),
            loop_handle: Mutex::new(None),
            next_listener_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the processing loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mut rx) = self.rx.lock().take() else {
            // Loop already owns the receiver.
            self.running.store(false, Ordering::Release);
            return;
        };
        let system = self.clone();
        let handle = tokio::spawn(async move {
            info!("event system started");
            while system.running.load(Ordering::Acquire) {
                match tokio::time::timeout(POLL_TIMEOUT, rx.recv()).await {
                    Ok(Some(event)) => system.process(event).await,
                    Ok(None) => break,
                    Err(_) => continue, // poll timeout, re-check stop flag
                }
            }
            *system.rx.lock() = Some(rx);
            info!("event system stopped");
        });
        *self.loop_handle.lock() = Some(handle);
    }

    /// Stop the processing loop and wait for it to exit.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue an event for processing. Never blocks.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| CommsError::communication("event queue closed"))?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Register a listener for the given event types.
    ///
    /// The optional filter runs before the handler; events it rejects are
    /// skipped silently.
    pub fn subscribe<F, Fut>(
        &self,
        types: Vec<EventType>,
        handler: F,
        filter: Option<EventFilter>,
    ) -> ListenerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let handler = Arc::new(handler);
        let handler: EventHandler = Arc::new(move |event| {
            let handler = handler.clone();
            Box::pin(async move { handler(event).await })
        });
        self.listeners.write().push(Listener {
            id,
            types,
            filter,
            handler,
            invoked: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        });
        debug!(%id, "event listener registered");
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.write().retain(|l| l.id != id);
    }

    async fn process(&self, event: Event) {
        {
            let mut history = self.history.lock();
            if history.len() == self.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        self.processed.fetch_add(1, Ordering::Relaxed);

        // Snapshot matching listeners so no lock is held across the awaits.
        let matching: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|l| l.types.contains(&event.event_type))
            .cloned()
            .collect();

        for listener in matching {
            if let Some(filter) = &listener.filter {
                if !filter(&event) {
                    continue;
                }
            }
            listener.invoked.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = (listener.handler)(event.clone()).await {
                listener.failed.fetch_add(1, Ordering::Relaxed);
                warn!(listener = %listener.id, event_type = %event.event_type, error = %e,
                    "event listener failed");
            }
        }
    }

    /// Filtered, time-ordered snapshot of recent events (oldest first).
    pub fn history(
        &self,
        event_type: Option<EventType>,
        source: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<Event> {
        let history = self.history.lock();
        let filtered: Vec<Event> = history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| source.map_or(true, |s| e.source == s))
            .cloned()
            .collect();
        match limit {
            Some(n) => {
                let skip = filtered.len().saturating_sub(n);
                filtered.into_iter().skip(skip).collect()
            }
            None => filtered,
        }
    }

    pub fn metrics(&self) -> EventMetrics {
        EventMetrics {
            published: self.published.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            history_len: self.history.lock().len(),
            listeners: self.listeners.read().len(),
        }
    }

    pub fn listener_stats(&self) -> Vec<ListenerStats> {
        self.listeners
            .read()
            .iter()
            .map(|l| ListenerStats {
                id: l.id,
                types: l.types.clone(),
                invoked: l.invoked.load(Ordering::Relaxed),
                failed: l.failed.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl Default for EventSystem {
    fn default() -> Self {
        Self::new(1000)
    }
}
