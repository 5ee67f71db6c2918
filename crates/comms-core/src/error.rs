//! Error types for the messaging substrate.

use thiserror::Error;

/// Errors raised by brokers, the message bus, and the event system.
#[derive(Debug, Error)]
pub enum CommsError {
    /// A publish or subscribe was attempted against a disconnected broker.
    #[error("broker not connected")]
    NotConnected,

    /// A transport-level failure (connect, publish, subscribe, deliver).
    #[error("communication error: {0}")]
    Communication(String),

    /// A malformed envelope or payload was rejected before transport.
    #[error("validation error: {0}")]
    Validation(String),

    /// Envelope serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration (log level, broker settings, ...).
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CommsError>;

impl CommsError {
    /// Shorthand for a communication error with a formatted message.
    pub fn communication(msg: impl Into<String>) -> Self {
        CommsError::Communication(msg.into())
    }

    /// Shorthand for a validation error with a formatted message.
    pub fn validation(msg: impl Into<String>) -> Self {
        CommsError::Validation(msg.into())
    }
}
