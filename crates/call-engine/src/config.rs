//! Configuration for the call center engine.
//!
//! Everything is deserializable from TOML with per-section defaults, so a
//! partial file only overrides what it names.

use std::collections::HashMap;
use std::path::Path;

use callgrid_comms_core::BrokerConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CallCenterError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallCenterConfig {
    pub general: GeneralConfig,
    pub broker: BrokerConfig,
    pub routing: RoutingConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub app_name: String,
    pub log_level: String,
    /// Inbox poll interval for every agent run loop, in milliseconds.
    pub agent_poll_interval_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            app_name: "callgrid".to_string(),
            log_level: "info".to_string(),
            agent_poll_interval_ms: 250,
        }
    }
}

/// Thresholds and timers for the routing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Minimum resolution confidence for an automatic resolution.
    pub auto_resolve_threshold: f64,
    /// Quality score below which a call escalates to a supervisor.
    pub escalation_threshold: f64,
    /// Seconds a call may wait before it degrades to a callback.
    pub max_queue_time_secs: u64,
    /// How often the wait queue is re-evaluated.
    pub queue_sweep_interval_secs: u64,
    /// How often pool utilization is recomputed.
    pub utilization_interval_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig {
            auto_resolve_threshold: 0.8,
            escalation_threshold: 0.3,
            max_queue_time_secs: 300,
            queue_sweep_interval_secs: 5,
            utilization_interval_secs: 30,
        }
    }
}

/// Immutable per-agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub agent_type: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// Arbitrary behavior-specific options.
    pub options: HashMap<String, Value>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            name: "agent".to_string(),
            agent_type: "generic".to_string(),
            max_retries: 3,
            timeout_secs: 300,
            options: HashMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        AgentConfig {
            name: name.into(),
            agent_type: agent_type.into(),
            ..Default::default()
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

impl CallCenterConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CallCenterError::config(e.to_string()))
    }

    /// Load a configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CallCenterError::config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&text)
    }
}
