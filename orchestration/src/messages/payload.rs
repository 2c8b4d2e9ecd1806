//! Typed payload union carried by every envelope.
//!
//! The wire form is externally tagged: the payload object has exactly one
//! key, the variant name. Extractors fail explicitly on a tag mismatch; there
//! is no silent coercion between variants.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Envelope, EnvelopeError};

/// How urgently a coder needs an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// What an approval request is gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Plan,
    Code,
    BudgetReview,
    Completion,
}

impl fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Code => write!(f, "code"),
            Self::BudgetReview => write!(f, "budget_review"),
            Self::Completion => write!(f, "completion"),
        }
    }
}

/// Architect verdict on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
    NeedsChanges,
    Pending,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "APPROVED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::NeedsChanges => write!(f, "NEEDS_CHANGES"),
            Self::Pending => write!(f, "PENDING"),
        }
    }
}

impl ApprovalStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "NEEDS_CHANGES" => Some(Self::NeedsChanges),
            "PENDING" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Outcome of a merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Merged,
    Conflict,
    Failed,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merged => write!(f, "merged"),
            Self::Conflict => write!(f, "conflict"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl MergeStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "merged" => Some(Self::Merged),
            "conflict" => Some(Self::Conflict),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub text: String,
    pub urgency: Urgency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResponse {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_type: ApprovalType,
    pub content: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub status: ApprovalStatus,
    pub feedback: String,
    pub reviewed_by: String,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub story_id: String,
    pub branch_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResponse {
    pub status: MergeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequeueRequest {
    pub story_id: String,
    pub agent_id: String,
    pub reason: String,
}

/// The payload union. STORY, SPEC, and ERROR envelopes use `generic`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    QuestionRequest(QuestionRequest),
    QuestionResponse(QuestionResponse),
    ApprovalRequest(ApprovalRequest),
    ApprovalResponse(ApprovalResponse),
    MergeRequest(MergeRequest),
    MergeResponse(MergeResponse),
    RequeueRequest(RequeueRequest),
    Generic(BTreeMap<String, serde_json::Value>),
}

impl Payload {
    /// The wire tag of the active variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QuestionRequest(_) => "question_request",
            Self::QuestionResponse(_) => "question_response",
            Self::ApprovalRequest(_) => "approval_request",
            Self::ApprovalResponse(_) => "approval_response",
            Self::MergeRequest(_) => "merge_request",
            Self::MergeResponse(_) => "merge_response",
            Self::RequeueRequest(_) => "requeue_request",
            Self::Generic(_) => "generic",
        }
    }

    /// Build a `generic` payload from string pairs.
    pub fn generic<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        Self::Generic(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

macro_rules! extractor {
    ($name:ident, $variant:ident, $ty:ty, $tag:literal) => {
        /// Extract the payload variant; errors on any other tag.
        pub fn $name(&self) -> Result<&$ty, EnvelopeError> {
            match &self.payload {
                Payload::$variant(inner) => Ok(inner),
                other => Err(EnvelopeError::PayloadMismatch {
                    expected: $tag,
                    actual: other.kind(),
                }),
            }
        }
    };
}

impl Envelope {
    extractor!(
        extract_question_request,
        QuestionRequest,
        QuestionRequest,
        "question_request"
    );
    extractor!(
        extract_question_response,
        QuestionResponse,
        QuestionResponse,
        "question_response"
    );
    extractor!(
        extract_approval_request,
        ApprovalRequest,
        ApprovalRequest,
        "approval_request"
    );
    extractor!(
        extract_approval_response,
        ApprovalResponse,
        ApprovalResponse,
        "approval_response"
    );
    extractor!(
        extract_merge_request,
        MergeRequest,
        MergeRequest,
        "merge_request"
    );
    extractor!(
        extract_merge_response,
        MergeResponse,
        MergeResponse,
        "merge_response"
    );
    extractor!(
        extract_requeue_request,
        RequeueRequest,
        RequeueRequest,
        "requeue_request"
    );

    /// Extract the `generic` payload map; errors on any other tag.
    pub fn extract_generic(&self) -> Result<&BTreeMap<String, serde_json::Value>, EnvelopeError> {
        match &self.payload {
            Payload::Generic(map) => Ok(map),
            other => Err(EnvelopeError::PayloadMismatch {
                expected: "generic",
                actual: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MsgType;

    fn all_payloads() -> Vec<Payload> {
        vec![
            Payload::QuestionRequest(QuestionRequest {
                text: "q".into(),
                urgency: Urgency::High,
                context: None,
            }),
            Payload::QuestionResponse(QuestionResponse {
                answer: "a".into(),
                confidence: None,
            }),
            Payload::ApprovalRequest(ApprovalRequest {
                approval_type: ApprovalType::BudgetReview,
                content: "plan".into(),
                reason: "loop exceeded".into(),
                context: None,
            }),
            Payload::ApprovalResponse(ApprovalResponse {
                status: ApprovalStatus::NeedsChanges,
                feedback: "tighten scope".into(),
                reviewed_by: "architect-001".into(),
                reviewed_at: Utc::now(),
            }),
            Payload::MergeRequest(MergeRequest {
                story_id: "s1".into(),
                branch_name: "story-s1".into(),
                pr_url: Some("https://example.test/pr/1".into()),
            }),
            Payload::MergeResponse(MergeResponse {
                status: MergeStatus::Conflict,
                merge_commit: None,
                conflict_details: Some("both modified src/main.rs".into()),
                error_details: None,
            }),
            Payload::RequeueRequest(RequeueRequest {
                story_id: "s1".into(),
                agent_id: "coder-001".into(),
                reason: "coder hit error state".into(),
            }),
            Payload::generic([("story_id", "s1")]),
        ]
    }

    fn envelope_with(payload: Payload) -> Envelope {
        Envelope::new(MsgType::Request, "a", "b", payload)
    }

    #[test]
    fn prop_extraction_succeeds_only_on_matching_tag() {
        for payload in all_payloads() {
            let tag = payload.kind();
            let env = envelope_with(payload);

            let results: [(&str, bool); 8] = [
                ("question_request", env.extract_question_request().is_ok()),
                ("question_response", env.extract_question_response().is_ok()),
                ("approval_request", env.extract_approval_request().is_ok()),
                ("approval_response", env.extract_approval_response().is_ok()),
                ("merge_request", env.extract_merge_request().is_ok()),
                ("merge_response", env.extract_merge_response().is_ok()),
                ("requeue_request", env.extract_requeue_request().is_ok()),
                ("generic", env.extract_generic().is_ok()),
            ];
            for (name, ok) in results {
                assert_eq!(
                    ok,
                    name == tag,
                    "payload `{tag}` vs extractor `{name}` disagreed"
                );
            }
        }
    }

    #[test]
    fn mismatch_error_names_both_tags() {
        let env = envelope_with(Payload::generic([("k", "v")]));
        match env.extract_merge_response() {
            Err(EnvelopeError::PayloadMismatch { expected, actual }) => {
                assert_eq!(expected, "merge_response");
                assert_eq!(actual, "generic");
            }
            other => panic!("expected PayloadMismatch, got {other:?}"),
        }
    }

    #[test]
    fn prop_payload_serde_round_trip() {
        for payload in all_payloads() {
            let json = serde_json::to_string(&payload).unwrap();
            let restored: Payload = serde_json::from_str(&json).unwrap();
            assert_eq!(restored.kind(), payload.kind());
        }
    }

    #[test]
    fn enum_wire_spellings() {
        assert_eq!(
            serde_json::to_string(&ApprovalStatus::NeedsChanges).unwrap(),
            "\"NEEDS_CHANGES\""
        );
        assert_eq!(
            serde_json::to_string(&ApprovalType::BudgetReview).unwrap(),
            "\"budget_review\""
        );
        assert_eq!(
            serde_json::to_string(&MergeStatus::Conflict).unwrap(),
            "\"conflict\""
        );
        assert_eq!(serde_json::to_string(&Urgency::Low).unwrap(), "\"low\"");
    }

    #[test]
    fn status_parse_round_trip() {
        for status in [
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::NeedsChanges,
            ApprovalStatus::Pending,
        ] {
            assert_eq!(ApprovalStatus::parse(&status.to_string()), Some(status));
        }
        assert_eq!(ApprovalStatus::parse("approved"), None);
    }
}
