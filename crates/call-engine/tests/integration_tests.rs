//! End-to-end tests over a full server: bus, events, agents, routing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use serial_test::serial;
use tokio::sync::Mutex;

use callgrid_call_engine::prelude::*;

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

fn fast_server() -> CallCenterServer {
    let mut config = CallCenterConfig::default();
    config.general.agent_poll_interval_ms = 20;
    config.routing.queue_sweep_interval_secs = 1;
    CallCenterServer::builder().with_config(config).build()
}

async fn collect_topic(
    server: &CallCenterServer,
    topic: &str,
) -> Result<Arc<Mutex<Vec<Envelope>>>> {
    let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    server
        .bus()
        .subscribe(topic, None, move |envelope| {
            let seen = seen_cb.clone();
            async move {
                seen.lock().await.push(envelope);
                Ok(())
            }
        })
        .await?;
    Ok(seen)
}

fn routing_request(call_id: &str, payload_extra: Vec<(&str, Value)>) -> Envelope {
    let mut envelope = Envelope::new(MessageKind::Routing, "quality", "Routing")
        .with_entry("call_id", json!(call_id));
    for (key, value) in payload_extra {
        envelope = envelope.with_entry(key, value);
    }
    envelope
}

#[tokio::test]
#[serial]
async fn urgent_negative_call_is_escalated_end_to_end() -> Result<()> {
    let server = fast_server();
    let routing = Arc::new(RoutingAgent::new(server.config().routing.clone()));
    let engine = routing.engine();
    server.register_agent(AgentConfig::new("Routing", "routing"), routing)?;
    server.start().await?;

    {
        let mut engine = engine.lock().await;
        for worker in default_worker_pool() {
            engine.add_worker(worker);
        }
    }

    let outcomes = collect_topic(&server, "agent_system").await?;
    let request = routing_request(
        "call-100",
        vec![
            ("metadata", json!({"priority": "urgent", "language": "en"})),
            ("summary", json!({"sentiment": "negative", "topics": []})),
        ],
    );
    server.bus().publish("agent_routing", request).await?;

    let outcomes_wait = outcomes.clone();
    wait_for(move || outcomes_wait.try_lock().map(|v| !v.is_empty()).unwrap_or(false)).await;

    let outcomes = outcomes.lock().await;
    assert_eq!(outcomes[0].payload["action"], json!("escalate"));
    assert_eq!(outcomes[0].payload["target_supervisor"], json!("SUP001"));
    assert_eq!(outcomes[0].correlation_id.as_deref(), Some("call-100"));
    assert_eq!(engine.lock().await.worker("SUP001").unwrap().current_load, 1);

    // The escalation shows up on the event side too.
    let events = server.events();
    wait_for(move || {
        !events
            .history(Some(EventType::EscalationTriggered), None, None)
            .is_empty()
    })
    .await;

    server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn confident_summary_is_auto_resolved() -> Result<()> {
    let server = fast_server();
    let routing = Arc::new(RoutingAgent::new(server.config().routing.clone()));
    server.register_agent(AgentConfig::new("Routing", "routing"), routing)?;
    server.start().await?;

    let outcomes = collect_topic(&server, "agent_system").await?;
    let request = routing_request(
        "call-200",
        vec![
            ("metadata", json!({"business_hours": true})),
            (
                "summary",
                json!({
                    "topics": ["password help"],
                    "summary": "Reset instructions sent",
                    "resolution_confidence": 0.9,
                    "action_items": ["send email", "confirm reset"],
                }),
            ),
        ],
    );
    server.bus().publish("agent_routing", request).await?;

    let outcomes_wait = outcomes.clone();
    wait_for(move || outcomes_wait.try_lock().map(|v| !v.is_empty()).unwrap_or(false)).await;

    let outcomes = outcomes.lock().await;
    assert_eq!(outcomes[0].payload["action"], json!("auto_resolve"));
    assert_eq!(outcomes[0].payload["resolution"], json!("Reset instructions sent"));

    server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn queued_call_degrades_to_callback_after_timeout() -> Result<()> {
    let mut config = CallCenterConfig::default();
    config.general.agent_poll_interval_ms = 20;
    config.routing.queue_sweep_interval_secs = 1;
    config.routing.max_queue_time_secs = 0; // expire on the first sweep
    let server = CallCenterServer::builder().with_config(config).build();

    let routing = Arc::new(RoutingAgent::new(server.config().routing.clone()));
    server.register_agent(AgentConfig::new("Routing", "routing"), routing)?;
    server.start().await?;

    let outcomes = collect_topic(&server, "agent_system").await?;
    // Technical/high with an empty pool: no specialist will ever free up.
    let request = routing_request(
        "call-300",
        vec![(
            "summary",
            json!({
                "topics": ["application crash"],
                "action_items": ["a", "b", "c", "d"],
            }),
        )],
    );
    server.bus().publish("agent_routing", request).await?;

    // Immediate decision queues the call and answers with a callback; the
    // sweep then expires the entry into a second callback outcome.
    let outcomes_wait = outcomes.clone();
    wait_for(move || outcomes_wait.try_lock().map(|v| v.len() >= 2).unwrap_or(false)).await;

    let outcomes = outcomes.lock().await;
    assert!(outcomes
        .iter()
        .all(|o| o.payload["action"] == json!("callback")));

    server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn status_request_gets_a_reply_with_metrics() -> Result<()> {
    let server = fast_server();
    let routing = Arc::new(RoutingAgent::new(server.config().routing.clone()));
    server.register_agent(AgentConfig::new("Routing", "routing"), routing)?;
    server.start().await?;

    let replies = collect_topic(&server, "agent_monitor").await?;
    let request = Envelope::new(MessageKind::Status, "monitor", "Routing");
    let request_id = request.id.clone();
    server.bus().publish("agent_routing", request).await?;

    let replies_wait = replies.clone();
    wait_for(move || replies_wait.try_lock().map(|v| !v.is_empty()).unwrap_or(false)).await;

    let replies = replies.lock().await;
    assert_eq!(replies[0].kind, MessageKind::Status);
    assert_eq!(replies[0].reply_to.as_deref(), Some(request_id.as_str()));
    assert_eq!(replies[0].payload["name"], json!("Routing"));
    assert_eq!(replies[0].payload["state"], json!("processing"));
    assert!(replies[0].payload["metrics"].is_object());

    server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn malformed_routing_request_gets_an_error_reply() -> Result<()> {
    let server = fast_server();
    let routing = Arc::new(RoutingAgent::new(server.config().routing.clone()));
    server.register_agent(AgentConfig::new("Routing", "routing"), routing)?;
    server.start().await?;

    // Error replies go back to the sender's point-to-point topic.
    let replies = collect_topic(&server, "agent_quality").await?;
    let request = Envelope::new(MessageKind::Routing, "quality", "Routing");
    let request_id = request.id.clone();
    server.bus().publish("agent_routing", request).await?;

    let replies_wait = replies.clone();
    wait_for(move || replies_wait.try_lock().map(|v| !v.is_empty()).unwrap_or(false)).await;

    let replies = replies.lock().await;
    assert_eq!(replies[0].kind, MessageKind::Error);
    assert_eq!(replies[0].reply_to.as_deref(), Some(request_id.as_str()));
    assert_eq!(
        replies[0].payload["original_message_id"],
        json!(request_id)
    );

    server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn broadcast_reaches_every_agent() -> Result<()> {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counting(Arc<AtomicU64>);

    #[async_trait]
    impl AgentBehavior for Counting {
        async fn initialize(&self, _ctx: &AgentContext) -> callgrid_call_engine::Result<()> {
            Ok(())
        }
        async fn handle_message(
            &self,
            _ctx: &AgentContext,
            _envelope: Envelope,
        ) -> callgrid_call_engine::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let server = fast_server();
    let count_a = Arc::new(AtomicU64::new(0));
    let count_b = Arc::new(AtomicU64::new(0));
    server.register_agent(
        AgentConfig::new("Intake", "intake"),
        Arc::new(Counting(count_a.clone())),
    )?;
    server.register_agent(
        AgentConfig::new("Quality", "quality"),
        Arc::new(Counting(count_b.clone())),
    )?;
    server.start().await?;

    let announcement = Envelope::new(MessageKind::Summary, "operator", "all");
    server.bus().publish(BROADCAST_TOPIC, announcement).await?;

    let (a, b) = (count_a.clone(), count_b.clone());
    wait_for(move || a.load(Ordering::SeqCst) == 1 && b.load(Ordering::SeqCst) == 1).await;

    server.stop().await?;
    Ok(())
}
