//! Rule evaluation, pool matching, and wait-queue management.
//!
//! The engine is deliberately synchronous: all state lives behind one
//! `tokio::sync::Mutex` owned by the routing agent, and no method awaits,
//! so a decision and its load mutation are atomic with respect to every
//! other decision.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RoutingConfig;
use crate::routing::profile::{SkillTier, WorkerProfile};
use crate::routing::rules::{CallAttributes, RouteAction, RoutingRule};

/// One recorded routing outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub call_id: String,
    pub action: RouteAction,
    pub target: Option<String>,
    /// Rule that produced the outcome, if any ("default" for the
    /// confidence fallback).
    pub rule_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A call parked until a matching worker frees up.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub call_id: String,
    pub attributes: CallAttributes,
    pub rule_id: String,
    pub target_tier: Option<SkillTier>,
    pub target_specialization: Option<String>,
    pub queued_at: DateTime<Utc>,
}

/// Aggregate pool view recomputed by the utilization task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_workers: usize,
    pub available_workers: usize,
    pub total_load: u32,
    pub total_capacity: u32,
    pub utilization_pct: f64,
    pub queue_len: usize,
}

/// Rule-based routing over a live worker pool.
pub struct RoutingEngine {
    workers: HashMap<String, WorkerProfile>,
    /// Kept priority-sorted; ties preserve load order.
    rules: Vec<RoutingRule>,
    wait_queue: VecDeque<QueueEntry>,
    history: Vec<RoutingDecision>,
    config: RoutingConfig,
}

impl RoutingEngine {
    pub fn new(config: RoutingConfig) -> Self {
        RoutingEngine {
            workers: HashMap::new(),
            rules: Vec::new(),
            wait_queue: VecDeque::new(),
            history: Vec::new(),
            config,
        }
    }

    /// Replace the rule set. Sorted by ascending priority; the sort is
    /// stable so equal priorities keep their load order.
    pub fn load_rules(&mut self, mut rules: Vec<RoutingRule>) {
        rules.sort_by_key(|r| r.priority);
        info!(count = rules.len(), "routing rules loaded");
        self.rules = rules;
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn add_worker(&mut self, worker: WorkerProfile) {
        debug!(worker = %worker.worker_id, tier = %worker.tier, "worker added to pool");
        self.workers.insert(worker.worker_id.clone(), worker);
    }

    pub fn remove_worker(&mut self, worker_id: &str) -> Option<WorkerProfile> {
        self.workers.remove(worker_id)
    }

    pub fn worker(&self, worker_id: &str) -> Option<&WorkerProfile> {
        self.workers.get(worker_id)
    }

    pub fn queue_len(&self) -> usize {
        self.wait_queue.len()
    }

    pub fn history(&self) -> &[RoutingDecision] {
        &self.history
    }

    /// Decide what to do with a call.
    ///
    /// Rules are evaluated in priority order; the first full match wins.
    /// If no rule matches, the confidence-based default applies. Applying
    /// a transfer or escalation increments the chosen worker's load in the
    /// same call.
    pub fn decide(
        &mut self,
        call_id: &str,
        attributes: &CallAttributes,
        resolution_confidence: f64,
        quality_score: Option<f64>,
    ) -> RoutingDecision {
        let matched = self
            .rules
            .iter()
            .find(|rule| rule.matches(attributes))
            .cloned();

        let decision = match matched {
            Some(rule) => {
                debug!(call_id, rule = %rule.rule_id, action = %rule.action, "rule matched");
                match rule.action {
                    RouteAction::Transfer | RouteAction::Escalate => self.place_with_worker(
                        call_id,
                        attributes,
                        rule.action,
                        &rule.rule_id,
                        rule.target_tier,
                        rule.target_specialization.clone(),
                    ),
                    action => self.outcome(call_id, action, None, Some(rule.rule_id)),
                }
            }
            None => self.default_decision(call_id, attributes, resolution_confidence, quality_score),
        };

        self.history.push(decision.clone());
        decision
    }

    /// Confidence-based fallback when no rule matches.
    fn default_decision(
        &mut self,
        call_id: &str,
        attributes: &CallAttributes,
        resolution_confidence: f64,
        quality_score: Option<f64>,
    ) -> RoutingDecision {
        if resolution_confidence >= self.config.auto_resolve_threshold {
            return self.outcome(call_id, RouteAction::AutoResolve, None, Some("default".into()));
        }
        if quality_score.is_some_and(|q| q < self.config.escalation_threshold) {
            return self.place_with_worker(
                call_id,
                attributes,
                RouteAction::Escalate,
                "default",
                Some(SkillTier::Supervisor),
                None,
            );
        }
        // Best available match for the call's category, widening to any
        // worker before giving up.
        let target = self
            .find_best_match(None, Some(&attributes.category), &attributes.language)
            .or_else(|| self.find_best_match(None, None, &attributes.language));
        match target {
            Some(worker_id) => {
                self.assign(&worker_id);
                self.outcome(
                    call_id,
                    RouteAction::Transfer,
                    Some(worker_id),
                    Some("default".into()),
                )
            }
            None => {
                self.enqueue(call_id, attributes, "default", None, None);
                self.outcome(call_id, RouteAction::Callback, None, Some("default".into()))
            }
        }
    }

    /// Resolve a worker for a transfer/escalation, queueing on a dead end.
    fn place_with_worker(
        &mut self,
        call_id: &str,
        attributes: &CallAttributes,
        action: RouteAction,
        rule_id: &str,
        tier: Option<SkillTier>,
        specialization: Option<String>,
    ) -> RoutingDecision {
        match self.find_best_match(tier, specialization.as_deref(), &attributes.language) {
            Some(worker_id) => {
                self.assign(&worker_id);
                self.outcome(call_id, action, Some(worker_id), Some(rule_id.to_string()))
            }
            None => {
                self.enqueue(call_id, attributes, rule_id, tier, specialization);
                self.outcome(call_id, RouteAction::Callback, None, Some(rule_id.to_string()))
            }
        }
    }

    fn outcome(
        &self,
        call_id: &str,
        action: RouteAction,
        target: Option<String>,
        rule_id: Option<String>,
    ) -> RoutingDecision {
        RoutingDecision {
            call_id: call_id.to_string(),
            action,
            target,
            rule_id,
            timestamp: Utc::now(),
        }
    }

    /// Best available worker: performance score descending, then load
    /// percentage ascending.
    fn find_best_match(
        &self,
        tier: Option<SkillTier>,
        specialization: Option<&str>,
        language: &str,
    ) -> Option<String> {
        let mut candidates: Vec<&WorkerProfile> = self
            .workers
            .values()
            .filter(|w| w.is_available())
            .filter(|w| tier.map_or(true, |t| w.tier == t))
            .filter(|w| specialization.map_or(true, |s| w.has_specialization(s)))
            .filter(|w| w.speaks(language))
            .collect();
        candidates.sort_by(|a, b| {
            b.performance_score
                .partial_cmp(&a.performance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.load_percentage()
                        .partial_cmp(&b.load_percentage())
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        candidates.first().map(|w| w.worker_id.clone())
    }

    /// Increment a worker's load. The availability check in
    /// `find_best_match` guarantees headroom, so this never overshoots.
    fn assign(&mut self, worker_id: &str) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            if worker.current_load < worker.max_capacity {
                worker.current_load += 1;
            } else {
                warn!(worker = worker_id, "assignment refused, worker at capacity");
            }
        }
    }

    /// Decrement a worker's load when its call ends.
    pub fn release_worker(&mut self, worker_id: &str) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.current_load = worker.current_load.saturating_sub(1);
        }
    }

    fn enqueue(
        &mut self,
        call_id: &str,
        attributes: &CallAttributes,
        rule_id: &str,
        tier: Option<SkillTier>,
        specialization: Option<String>,
    ) {
        self.wait_queue.push_back(QueueEntry {
            call_id: call_id.to_string(),
            attributes: attributes.clone(),
            rule_id: rule_id.to_string(),
            target_tier: tier,
            target_specialization: specialization,
            queued_at: Utc::now(),
        });
        info!(call_id, position = self.wait_queue.len(), "call queued");
    }

    /// Re-evaluate every queued call.
    ///
    /// A freed matching worker turns the entry into a transfer; an entry
    /// older than `max_queue_time_secs` degrades to a callback. Both
    /// outcomes dequeue the entry and are recorded.
    pub fn sweep_queue(&mut self, now: DateTime<Utc>) -> Vec<RoutingDecision> {
        let mut resolved = Vec::new();
        let mut remaining = VecDeque::new();

        while let Some(entry) = self.wait_queue.pop_front() {
            if let Some(worker_id) = self.find_best_match(
                entry.target_tier,
                entry.target_specialization.as_deref(),
                &entry.attributes.language,
            ) {
                self.assign(&worker_id);
                resolved.push(self.outcome(
                    &entry.call_id,
                    RouteAction::Transfer,
                    Some(worker_id),
                    Some(entry.rule_id.clone()),
                ));
            } else if (now - entry.queued_at).num_seconds()
                > self.config.max_queue_time_secs as i64
            {
                info!(call_id = %entry.call_id, "queue wait expired, scheduling callback");
                resolved.push(self.outcome(
                    &entry.call_id,
                    RouteAction::Callback,
                    None,
                    Some(entry.rule_id.clone()),
                ));
            } else {
                remaining.push_back(entry);
            }
        }
        self.wait_queue = remaining;
        self.history.extend(resolved.iter().cloned());
        resolved
    }

    pub fn pool_stats(&self) -> PoolStats {
        let total_load: u32 = self.workers.values().map(|w| w.current_load).sum();
        let total_capacity: u32 = self.workers.values().map(|w| w.max_capacity).sum();
        PoolStats {
            total_workers: self.workers.len(),
            available_workers: self.workers.values().filter(|w| w.is_available()).count(),
            total_load,
            total_capacity,
            utilization_pct: if total_capacity == 0 {
                0.0
            } else {
                (total_load as f64 / total_capacity as f64) * 100.0
            },
            queue_len: self.wait_queue.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::rules::default_rules;
    use chrono::Duration;

    fn worker(
        id: &str,
        tier: SkillTier,
        specs: &[&str],
        load: u32,
        capacity: u32,
        score: f64,
    ) -> WorkerProfile {
        WorkerProfile {
            worker_id: id.to_string(),
            name: id.to_string(),
            tier,
            specializations: specs.iter().map(|s| s.to_string()).collect(),
            languages: vec!["en".to_string()],
            current_load: load,
            max_capacity: capacity,
            availability: true,
            performance_score: score,
        }
    }

    fn engine_with_default_rules() -> RoutingEngine {
        let mut engine = RoutingEngine::new(RoutingConfig::default());
        engine.load_rules(default_rules());
        engine
    }

    #[test]
    fn urgent_negative_call_escalates_to_supervisor_and_loads_them() {
        let mut engine = engine_with_default_rules();
        engine.add_worker(worker("SUP001", SkillTier::Supervisor, &["all"], 0, 3, 0.95));

        let attrs = CallAttributes {
            priority: "urgent".into(),
            sentiment: "negative".into(),
            ..Default::default()
        };
        let decision = engine.decide("call-1", &attrs, 0.5, None);

        assert_eq!(decision.action, RouteAction::Escalate);
        assert_eq!(decision.target.as_deref(), Some("SUP001"));
        assert_eq!(engine.worker("SUP001").unwrap().current_load, 1);
    }

    #[test]
    fn high_confidence_auto_resolves_without_touching_the_pool() {
        let mut engine = engine_with_default_rules();
        engine.add_worker(worker("AGT001", SkillTier::Senior, &["billing"], 0, 5, 0.9));

        // Attributes no rule matches.
        let attrs = CallAttributes {
            category: "technical".into(),
            complexity: "medium".into(),
            ..Default::default()
        };
        let decision = engine.decide("call-2", &attrs, 0.85, None);

        assert_eq!(decision.action, RouteAction::AutoResolve);
        assert!(decision.target.is_none());
        assert_eq!(engine.worker("AGT001").unwrap().current_load, 0);
    }

    #[test]
    fn no_specialist_enqueues_then_callback_after_max_queue_time() {
        let mut config = RoutingConfig::default();
        config.max_queue_time_secs = 60;
        let mut engine = RoutingEngine::new(config);
        engine.load_rules(default_rules());
        // No technical_support specialists at all.
        engine.add_worker(worker("AGT003", SkillTier::Junior, &["general"], 0, 6, 0.75));

        let attrs = CallAttributes {
            category: "technical".into(),
            complexity: "high".into(),
            ..Default::default()
        };
        let decision = engine.decide("call-3", &attrs, 0.5, None);
        assert_eq!(decision.action, RouteAction::Callback);
        assert_eq!(engine.queue_len(), 1);

        // Still nobody free before the deadline.
        let swept = engine.sweep_queue(Utc::now() + Duration::seconds(30));
        assert!(swept.is_empty());
        assert_eq!(engine.queue_len(), 1);

        // Past the deadline the entry degrades to a callback.
        let swept = engine.sweep_queue(Utc::now() + Duration::seconds(61));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].action, RouteAction::Callback);
        assert_eq!(engine.queue_len(), 0);
    }

    #[test]
    fn clock_stepping_backwards_does_not_expire_fresh_entries() {
        let mut engine = engine_with_default_rules();
        // No specialists, so the technical call lands on the queue.
        let attrs = CallAttributes {
            category: "technical".into(),
            complexity: "high".into(),
            ..Default::default()
        };
        engine.decide("call-10", &attrs, 0.5, None);
        assert_eq!(engine.queue_len(), 1);

        // A sweep timestamp behind the enqueue time must not count as age.
        let swept = engine.sweep_queue(Utc::now() - Duration::seconds(2));
        assert!(swept.is_empty());
        assert_eq!(engine.queue_len(), 1);
    }

    #[test]
    fn freed_worker_drains_the_queue_on_sweep() {
        let mut engine = engine_with_default_rules();
        engine.add_worker(worker(
            "AGT002",
            SkillTier::Specialist,
            &["technical_support"],
            4,
            4,
            0.88,
        ));

        let attrs = CallAttributes {
            category: "technical".into(),
            complexity: "high".into(),
            ..Default::default()
        };
        assert_eq!(
            engine.decide("call-4", &attrs, 0.5, None).action,
            RouteAction::Callback
        );
        assert_eq!(engine.queue_len(), 1);

        engine.release_worker("AGT002");
        let swept = engine.sweep_queue(Utc::now());
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].action, RouteAction::Transfer);
        assert_eq!(swept[0].target.as_deref(), Some("AGT002"));
        assert_eq!(engine.worker("AGT002").unwrap().current_load, 4);
        assert_eq!(engine.queue_len(), 0);
    }

    #[test]
    fn lower_priority_number_wins_when_both_rules_match() {
        let mut engine = engine_with_default_rules();
        engine.add_worker(worker("SUP001", SkillTier::Supervisor, &["all"], 0, 3, 0.95));

        // Matches both R001 (escalate, priority 1) and R005 would need
        // business_hours=false; make one that matches R001 and R003.
        let attrs = CallAttributes {
            priority: "urgent".into(),
            sentiment: "negative".into(),
            category: "billing".into(),
            ..Default::default()
        };
        let decision = engine.decide("call-5", &attrs, 0.5, None);
        assert_eq!(decision.rule_id.as_deref(), Some("R001"));
        assert_eq!(decision.action, RouteAction::Escalate);
    }

    #[test]
    fn selection_prefers_performance_then_lower_load() {
        let mut engine = engine_with_default_rules();
        engine.add_worker(worker("A", SkillTier::Senior, &["billing"], 4, 5, 0.92));
        engine.add_worker(worker("B", SkillTier::Junior, &["billing"], 0, 6, 0.75));
        engine.add_worker(worker("C", SkillTier::Senior, &["billing"], 1, 5, 0.92));

        let attrs = CallAttributes {
            category: "billing".into(),
            ..Default::default()
        };
        let decision = engine.decide("call-6", &attrs, 0.5, None);
        // A and C tie on score; C has less load.
        assert_eq!(decision.target.as_deref(), Some("C"));
    }

    #[test]
    fn load_never_exceeds_capacity() {
        let mut engine = engine_with_default_rules();
        engine.add_worker(worker("A", SkillTier::Junior, &["billing"], 0, 2, 0.8));

        let attrs = CallAttributes {
            category: "billing".into(),
            ..Default::default()
        };
        for i in 0..5 {
            engine.decide(&format!("call-{i}"), &attrs, 0.5, None);
        }
        assert_eq!(engine.worker("A").unwrap().current_load, 2);
        // Overflow went to the queue.
        assert_eq!(engine.queue_len(), 3);
    }

    #[test]
    fn low_quality_score_escalates_by_default() {
        let mut engine = engine_with_default_rules();
        engine.add_worker(worker("SUP001", SkillTier::Supervisor, &["all"], 0, 3, 0.95));

        let attrs = CallAttributes {
            category: "technical".into(),
            complexity: "medium".into(),
            ..Default::default()
        };
        let decision = engine.decide("call-7", &attrs, 0.4, Some(0.2));
        assert_eq!(decision.action, RouteAction::Escalate);
        assert_eq!(decision.target.as_deref(), Some("SUP001"));
    }

    #[test]
    fn pool_stats_reflect_load_and_queue() {
        let mut engine = engine_with_default_rules();
        engine.add_worker(worker("A", SkillTier::Senior, &["billing"], 1, 4, 0.9));
        engine.add_worker(worker("B", SkillTier::Junior, &["general"], 3, 4, 0.7));

        let stats = engine.pool_stats();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.available_workers, 2);
        assert_eq!(stats.total_load, 4);
        assert_eq!(stats.total_capacity, 8);
        assert!((stats.utilization_pct - 50.0).abs() < f64::EPSILON);
    }
}
