//! Inter-agent envelopes — the wire form of every message in the system.
//!
//! An [`Envelope`] couples routing fields (sender, recipient, correlation)
//! with a typed [`Payload`]. Responses always carry `parent_msg_id` equal to
//! the id of the request they answer; consumers discard anything else as
//! stale.

pub mod correlation;
pub mod payload;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use payload::{
    ApprovalRequest, ApprovalResponse, ApprovalStatus, ApprovalType, MergeRequest, MergeResponse,
    MergeStatus, Payload, QuestionRequest, QuestionResponse, RequeueRequest, Urgency,
};

/// The six envelope types the dispatcher routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    Story,
    Spec,
    Request,
    Response,
    Error,
    Shutdown,
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Story => write!(f, "STORY"),
            Self::Spec => write!(f, "SPEC"),
            Self::Request => write!(f, "REQUEST"),
            Self::Response => write!(f, "RESPONSE"),
            Self::Error => write!(f, "ERROR"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Errors raised while building, validating, or decoding envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope field `{field}` must not be empty")]
    EmptyField { field: &'static str },

    #[error("envelope timestamp is zero")]
    ZeroTimestamp,

    #[error("payload tag mismatch: expected `{expected}`, got `{actual}`")]
    PayloadMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("envelope decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

impl EnvelopeError {
    /// Error-taxonomy kind used in logs and ERROR envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PayloadMismatch { .. } => "effect_payload_mismatch",
            _ => "validation",
        }
    }
}

/// One inter-agent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    pub from_agent: String,
    pub to_agent: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_msg_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Envelope {
    /// Build an envelope with a fresh process-unique id and the current time.
    pub fn new(
        msg_type: MsgType,
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: correlation::next_message_id(),
            msg_type,
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            timestamp: Utc::now(),
            parent_msg_id: None,
            retry_count: 0,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// A SHUTDOWN envelope carries no semantic payload.
    pub fn shutdown(from_agent: impl Into<String>, to_agent: impl Into<String>) -> Self {
        Self::new(
            MsgType::Shutdown,
            from_agent,
            to_agent,
            Payload::Generic(BTreeMap::new()),
        )
    }

    /// Build a RESPONSE envelope correlated to `request` (sets
    /// `parent_msg_id = request.id` and swaps sender/recipient).
    pub fn response_to(request: &Envelope, payload: Payload) -> Self {
        let mut env = Self::new(
            MsgType::Response,
            request.to_agent.clone(),
            request.from_agent.clone(),
            payload,
        );
        env.parent_msg_id = Some(request.id.clone());
        if let Some(story) = request.metadata.get("story_id") {
            env.metadata.insert("story_id".into(), story.clone());
        }
        env
    }

    pub fn with_parent(mut self, parent_msg_id: impl Into<String>) -> Self {
        self.parent_msg_id = Some(parent_msg_id.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Reject structurally invalid envelopes.
    ///
    /// Unknown `type` values and unknown payload tags never reach this point:
    /// serde rejects them during decode.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.is_empty() {
            return Err(EnvelopeError::EmptyField { field: "id" });
        }
        if self.from_agent.is_empty() {
            return Err(EnvelopeError::EmptyField { field: "from_agent" });
        }
        if self.to_agent.is_empty() {
            return Err(EnvelopeError::EmptyField { field: "to_agent" });
        }
        if self.timestamp.timestamp_nanos_opt().unwrap_or(0) == 0 {
            return Err(EnvelopeError::ZeroTimestamp);
        }
        Ok(())
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate an envelope from its JSON wire form.
    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        let env: Envelope = serde_json::from_str(raw)?;
        env.validate()?;
        Ok(env)
    }
}
