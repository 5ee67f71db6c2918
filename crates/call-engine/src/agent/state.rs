//! Agent lifecycle state machine.
//!
//! Legal transitions:
//!
//! ```text
//! Idle ─────────► Initializing ─────► Ready ◄────► Processing
//!                    ▲    ▲             │               │
//! Shutdown ──────────┘    │             └──► Shutdown ◄─┘
//! Error ──────────────────┘
//! any ──► Error
//! ```
//!
//! `Error` is not auto-recoverable; only an explicit restart re-enters
//! `Initializing`. An agent never reaches `Processing` without first
//! passing through `Ready`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CallCenterError, Result};

/// Lifecycle state of an agent. Exactly one live value per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Initializing,
    Ready,
    Processing,
    Error,
    Shutdown,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Processing => "processing",
            AgentState::Error => "error",
            AgentState::Shutdown => "shutdown",
        }
    }

    /// Whether moving to `next` is legal from this state.
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        // Any state may fail.
        if next == AgentState::Error {
            return true;
        }
        match (self, next) {
            (AgentState::Idle, AgentState::Initializing) => true,
            (AgentState::Shutdown, AgentState::Initializing) => true,
            (AgentState::Error, AgentState::Initializing) => true,
            (AgentState::Initializing, AgentState::Ready) => true,
            (AgentState::Ready, AgentState::Processing) => true,
            (AgentState::Processing, AgentState::Ready) => true,
            (AgentState::Ready, AgentState::Shutdown) => true,
            (AgentState::Processing, AgentState::Shutdown) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub from: AgentState,
    pub to: AgentState,
    pub at: DateTime<Utc>,
}

/// Current state plus an append-only transition history for diagnostics.
pub struct StateTracker {
    current: RwLock<AgentState>,
    history: RwLock<Vec<StateChange>>,
}

impl StateTracker {
    pub fn new() -> Self {
        StateTracker {
            current: RwLock::new(AgentState::Idle),
            history: RwLock::new(Vec::new()),
        }
    }

    pub fn current(&self) -> AgentState {
        *self.current.read()
    }

    /// Apply a transition, rejecting illegal ones.
    pub fn transition(&self, next: AgentState) -> Result<()> {
        let mut current = self.current.write();
        if !current.can_transition_to(next) {
            return Err(CallCenterError::agent(format!(
                "illegal state transition {} -> {}",
                *current, next
            )));
        }
        self.history.write().push(StateChange {
            from: *current,
            to: next,
            at: Utc::now(),
        });
        *current = next;
        Ok(())
    }

    pub fn history(&self) -> Vec<StateChange> {
        self.history.read().clone()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
