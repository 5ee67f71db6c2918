//! The envelope is the atomic unit of inter-agent communication.
//!
//! Every broker variant carries envelopes in the same JSON wire shape, and
//! every field must round-trip losslessly through serialization. Envelopes
//! are immutable once constructed; the builder-style constructors below are
//! the only way to populate one.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CommsError, Result};

/// Closed set of message kinds exchanged between agents.
///
/// Adding a kind is a compile-time-checked change: dispatch sites match
/// exhaustively on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    CallIntake,
    Transcription,
    Summary,
    QualityScore,
    Routing,
    Error,
    Status,
    Control,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::CallIntake => "call_intake",
            MessageKind::Transcription => "transcription",
            MessageKind::Summary => "summary",
            MessageKind::QualityScore => "quality_score",
            MessageKind::Routing => "routing",
            MessageKind::Error => "error",
            MessageKind::Status => "status",
            MessageKind::Control => "control",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Standard message record for inter-agent communication.
///
/// `id` is globally unique and is used for correlation and reply tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub kind: MessageKind,
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Envelope {
    /// Create a new envelope with a fresh id and the current timestamp.
    pub fn new(
        kind: MessageKind,
        sender: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Envelope {
            id: Uuid::new_v4().to_string(),
            kind,
            sender: sender.into(),
            recipient: recipient.into(),
            payload: HashMap::new(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Replace the payload wholesale.
    pub fn with_payload(mut self, payload: HashMap<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Insert a single payload entry.
    pub fn with_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Insert a single metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Build a reply to this envelope, addressed back to its sender.
    ///
    /// The reply carries `reply_to = self.id` and inherits the correlation
    /// id so the whole exchange stays traceable.
    pub fn reply(&self, kind: MessageKind, sender: impl Into<String>) -> Envelope {
        let mut reply = Envelope::new(kind, sender, self.sender.clone()).with_reply_to(&self.id);
        reply.correlation_id = self.correlation_id.clone();
        reply
    }

    /// Reject envelopes that cannot be routed.
    pub fn validate(&self) -> Result<()> {
        if self.sender.trim().is_empty() {
            return Err(CommsError::validation("envelope sender must not be empty"));
        }
        if self.recipient.trim().is_empty() {
            return Err(CommsError::validation(
                "envelope recipient must not be empty",
            ));
        }
        Ok(())
    }

    /// Serialize to the JSON wire shape shared by all broker variants.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from the JSON wire shape.
    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
