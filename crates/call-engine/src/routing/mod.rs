//! Call routing: rules, worker pool, wait queue, and the routing agent.
//!
//! The [`RoutingEngine`] is pure decision logic over in-memory state; the
//! [`RoutingAgent`] wraps it in the agent frame, translating bus envelopes
//! into decisions and decisions back into outcome envelopes and events.

pub mod agent;
pub mod engine;
pub mod profile;
pub mod rules;

pub use agent::{default_worker_pool, RoutingAgent};
pub use engine::{PoolStats, QueueEntry, RoutingDecision, RoutingEngine};
pub use profile::{SkillTier, WorkerProfile};
pub use rules::{default_rules, CallAttributes, RouteAction, RoutingRule};
