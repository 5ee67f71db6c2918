//! The routing agent: glue between the bus and the routing engine.

use std::sync::Arc;

use async_trait::async_trait;
use callgrid_comms_core::{Envelope, Event, MessageKind};
use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{AgentBehavior, AgentContext};
use crate::config::RoutingConfig;
use crate::error::Result;
use crate::routing::engine::{RoutingDecision, RoutingEngine};
use crate::routing::profile::{SkillTier, WorkerProfile};
use crate::routing::rules::{default_rules, CallAttributes, RouteAction};

/// Recipient for routing outcome envelopes.
const SYSTEM_RECIPIENT: &str = "system";

/// Routes calls by rules, pool state, and confidence fallbacks.
pub struct RoutingAgent {
    engine: Arc<AsyncMutex<RoutingEngine>>,
    config: RoutingConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoutingAgent {
    pub fn new(config: RoutingConfig) -> Self {
        RoutingAgent {
            engine: Arc::new(AsyncMutex::new(RoutingEngine::new(config.clone()))),
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Shared handle to the engine, for pool management and inspection.
    pub fn engine(&self) -> Arc<AsyncMutex<RoutingEngine>> {
        self.engine.clone()
    }

    async fn handle_routing_request(&self, ctx: &AgentContext, envelope: &Envelope) -> Result<()> {
        let Some(call_id) = envelope.payload.get("call_id").and_then(Value::as_str) else {
            warn!(id = %envelope.id, "routing request without call_id");
            ctx.reply_error(envelope, "routing request is missing call_id")
                .await?;
            return Ok(());
        };
        let call_id = call_id.to_string();

        let empty = Map::new();
        let metadata = envelope
            .payload
            .get("metadata")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let summary = envelope
            .payload
            .get("summary")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let quality_score = envelope.payload.get("quality_score").and_then(Value::as_f64);

        let attributes = derive_attributes(metadata, summary);
        let resolution_confidence = summary
            .get("resolution_confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);

        let decision = {
            let mut engine = self.engine.lock().await;
            engine.decide(&call_id, &attributes, resolution_confidence, quality_score)
        };
        info!(call_id = %decision.call_id, action = %decision.action,
            target = decision.target.as_deref().unwrap_or("-"), "routing decision");

        execute_decision(ctx, &decision, &envelope.payload).await
    }
}

#[async_trait]
impl AgentBehavior for RoutingAgent {
    async fn initialize(&self, _ctx: &AgentContext) -> Result<()> {
        let mut engine = self.engine.lock().await;
        if engine.rules().is_empty() {
            engine.load_rules(default_rules());
        }
        Ok(())
    }

    async fn on_start(&self, ctx: &AgentContext) -> Result<()> {
        let mut tasks = self.tasks.lock();

        // Queue sweep: free workers drain the queue, stale entries degrade
        // to callbacks.
        let engine = self.engine.clone();
        let sweep_ctx = ctx.clone();
        let sweep_every = std::time::Duration::from_secs(self.config.queue_sweep_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let resolved = {
                    let mut engine = engine.lock().await;
                    engine.sweep_queue(Utc::now())
                };
                let no_payload = std::collections::HashMap::new();
                for decision in resolved {
                    if let Err(e) = execute_decision(&sweep_ctx, &decision, &no_payload).await {
                        warn!(call_id = %decision.call_id, error = %e, "sweep outcome failed");
                    }
                }
            }
        }));

        // Utilization: observability only, no decisions depend on it.
        let engine = self.engine.clone();
        let util_ctx = ctx.clone();
        let util_every = std::time::Duration::from_secs(self.config.utilization_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(util_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = engine.lock().await.pool_stats();
                debug!(utilization_pct = stats.utilization_pct, queued = stats.queue_len,
                    "pool utilization");
                let event = Event::new(
                    callgrid_comms_core::EventType::PerformanceMetric,
                    util_ctx.name.clone(),
                )
                .with_data("utilization_pct", json!(stats.utilization_pct))
                .with_data("available_workers", json!(stats.available_workers))
                .with_data("queue_len", json!(stats.queue_len));
                if let Err(e) = util_ctx.emit(event) {
                    warn!(error = %e, "utilization event dropped");
                }
            }
        }));
        Ok(())
    }

    async fn on_stop(&self, _ctx: &AgentContext) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    async fn handle_message(&self, ctx: &AgentContext, envelope: Envelope) -> Result<()> {
        match envelope.kind {
            MessageKind::Routing => self.handle_routing_request(ctx, &envelope).await,
            other => {
                warn!(kind = %other, "unexpected message kind for routing agent");
                Ok(())
            }
        }
    }
}

/// Publish the outcome envelope and emit the matching events.
async fn execute_decision(
    ctx: &AgentContext,
    decision: &RoutingDecision,
    request_payload: &std::collections::HashMap<String, Value>,
) -> Result<()> {
    let mut outcome = Envelope::new(MessageKind::Routing, ctx.name.clone(), SYSTEM_RECIPIENT)
        .with_correlation_id(&decision.call_id)
        .with_entry("call_id", json!(decision.call_id))
        .with_entry("action", json!(decision.action.as_str()));

    match decision.action {
        RouteAction::AutoResolve => {
            let summary = request_payload.get("summary").cloned().unwrap_or(json!({}));
            outcome = outcome
                .with_entry("resolution", summary.get("summary").cloned().unwrap_or(json!("")))
                .with_entry(
                    "confidence",
                    summary.get("resolution_confidence").cloned().unwrap_or(json!(0)),
                );
        }
        RouteAction::Transfer => {
            if let Some(target) = &decision.target {
                outcome = outcome.with_entry("target_worker", json!(target));
            }
        }
        RouteAction::Escalate => {
            if let Some(target) = &decision.target {
                outcome = outcome.with_entry("target_supervisor", json!(target));
            }
            outcome = outcome.with_entry(
                "escalation_reason",
                request_payload
                    .get("escalation_reason")
                    .cloned()
                    .unwrap_or(json!("Quality threshold not met")),
            );
        }
        RouteAction::Callback => {
            let callback_time = Utc::now() + chrono::Duration::hours(1);
            outcome = outcome.with_entry("scheduled_time", json!(callback_time.to_rfc3339()));
            if let Some(phone) = request_payload
                .get("metadata")
                .and_then(|m| m.get("customer_phone"))
            {
                outcome = outcome.with_entry("customer_phone", phone.clone());
            }
        }
        RouteAction::EndCall => {
            outcome = outcome.with_entry("timestamp", json!(Utc::now().to_rfc3339()));
        }
    }

    ctx.send(outcome).await?;

    ctx.emit(Event::call_routed(
        ctx.name.clone(),
        &decision.call_id,
        decision.action.as_str(),
    ))?;
    match decision.action {
        RouteAction::Transfer => {
            if let Some(target) = &decision.target {
                ctx.emit(
                    Event::new(callgrid_comms_core::EventType::AgentAssigned, ctx.name.clone())
                        .with_data("call_id", json!(decision.call_id))
                        .with_data("worker_id", json!(target))
                        .with_correlation_id(&decision.call_id),
                )?;
            }
        }
        RouteAction::Escalate => {
            ctx.emit(
                Event::new(
                    callgrid_comms_core::EventType::EscalationTriggered,
                    ctx.name.clone(),
                )
                .with_data("call_id", json!(decision.call_id))
                .with_data("target", json!(decision.target))
                .with_correlation_id(&decision.call_id),
            )?;
        }
        _ => {}
    }
    Ok(())
}

/// Derive routing factors from the request's metadata and summary.
fn derive_attributes(metadata: &Map<String, Value>, summary: &Map<String, Value>) -> CallAttributes {
    CallAttributes {
        priority: metadata
            .get("priority")
            .and_then(Value::as_str)
            .unwrap_or("normal")
            .to_string(),
        category: determine_category(summary),
        complexity: assess_complexity(summary),
        sentiment: summary
            .get("sentiment")
            .and_then(Value::as_str)
            .unwrap_or("neutral")
            .to_string(),
        business_hours: metadata
            .get("business_hours")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| is_business_hours(Local::now())),
        language: metadata
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or("en")
            .to_string(),
    }
}

/// Keyword-match the summary topics into a category.
fn determine_category(summary: &Map<String, Value>) -> String {
    const CATEGORY_KEYWORDS: [(&str, &[&str]); 3] = [
        ("technical", &["technical", "error", "bug", "crash", "not working"]),
        ("billing", &["billing", "payment", "invoice", "charge", "refund"]),
        ("general", &["information", "question", "help", "support"]),
    ];

    let topics: Vec<String> = summary
        .get("topics")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(|s| s.to_lowercase())
                .collect()
        })
        .unwrap_or_default();

    for (category, keywords) in CATEGORY_KEYWORDS {
        for topic in &topics {
            if keywords.iter().any(|k| topic.contains(k)) {
                return category.to_string();
            }
        }
    }
    "general".to_string()
}

/// Complexity from the volume of action items and open issues.
fn assess_complexity(summary: &Map<String, Value>) -> String {
    let action_items = summary
        .get("action_items")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let issues = summary
        .get("customer_issues")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);

    if action_items > 3 || issues > 2 {
        "high".to_string()
    } else if action_items > 1 || issues > 0 {
        "medium".to_string()
    } else {
        "low".to_string()
    }
}

/// Monday to Friday, 09:00 to 18:00 local time.
fn is_business_hours(now: DateTime<Local>) -> bool {
    let weekday = now.weekday().num_days_from_monday();
    let hour = now.hour();
    weekday < 5 && (9..18).contains(&hour)
}

/// A small starter pool, useful for demos and tests until real worker
/// data is wired in.
pub fn default_worker_pool() -> Vec<WorkerProfile> {
    vec![
        WorkerProfile {
            worker_id: "AGT001".into(),
            name: "Senior Agent 1".into(),
            tier: SkillTier::Senior,
            specializations: vec!["technical_support".into(), "billing".into()],
            languages: vec!["en".into(), "es".into()],
            current_load: 2,
            max_capacity: 5,
            availability: true,
            performance_score: 0.92,
        },
        WorkerProfile {
            worker_id: "AGT002".into(),
            name: "Specialist Agent 1".into(),
            tier: SkillTier::Specialist,
            specializations: vec!["technical_support".into()],
            languages: vec!["en".into()],
            current_load: 3,
            max_capacity: 4,
            availability: true,
            performance_score: 0.88,
        },
        WorkerProfile {
            worker_id: "AGT003".into(),
            name: "Junior Agent 1".into(),
            tier: SkillTier::Junior,
            specializations: vec!["general".into(), "billing".into()],
            languages: vec!["en".into(), "fr".into()],
            current_load: 1,
            max_capacity: 6,
            availability: true,
            performance_score: 0.75,
        },
        WorkerProfile {
            worker_id: "SUP001".into(),
            name: "Supervisor 1".into(),
            tier: SkillTier::Supervisor,
            specializations: vec!["all".into()],
            languages: vec!["en".into(), "es".into(), "fr".into()],
            current_load: 0,
            max_capacity: 3,
            availability: true,
            performance_score: 0.95,
        },
    ]
}
