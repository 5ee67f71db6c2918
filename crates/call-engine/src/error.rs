//! Error types for the call engine.

use callgrid_comms_core::CommsError;
use thiserror::Error;

/// Errors raised by agents, routing, and the server facade.
#[derive(Debug, Error)]
pub enum CallCenterError {
    /// Agent lifecycle failure (illegal transition, hook failure).
    #[error("agent error: {0}")]
    Agent(String),

    /// No viable routing decision path.
    #[error("routing error: {0}")]
    Routing(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Failure in the messaging substrate.
    #[error("communication error: {0}")]
    Comms(#[from] CommsError),
}

pub type Result<T> = std::result::Result<T, CallCenterError>;

impl CallCenterError {
    pub fn agent(msg: impl Into<String>) -> Self {
        CallCenterError::Agent(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        CallCenterError::Routing(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CallCenterError::Configuration(msg.into())
    }
}
