//! Effects — blocking request/response primitives.
//!
//! An effect is the only sanctioned way for a role to talk to another agent.
//! It sends one REQUEST envelope, then parks in a correlation-filtered
//! receive until the matching RESPONSE arrives or the timeout fires. Stale
//! responses (wrong `parent_msg_id`) are discarded, never surfaced.
//!
//! Each effect may carry a routing table mapping the response status to the
//! FSM state the caller must transition to, so the role code stays
//! sequential: build the effect, let the driver execute it, read the folded
//! outcome on the next step.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::messages::correlation;
use crate::messages::{
    ApprovalRequest, ApprovalStatus, ApprovalType, Envelope, MergeRequest, MergeStatus, MsgType,
    Payload, QuestionRequest, Urgency,
};

/// Default timeout for question effects.
pub const QUESTION_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Default timeout for approval, budget-review, and merge effects.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// Keys under which effect outcomes are folded into state data.
pub const KEY_QUESTION_ANSWER: &str = "question_answer";
pub const KEY_QUESTION_CONFIDENCE: &str = "question_confidence";
pub const KEY_APPROVAL_STATUS: &str = "approval_status";
pub const KEY_APPROVAL_FEEDBACK: &str = "approval_feedback";
pub const KEY_BUDGET_DECISION: &str = "budget_decision";
pub const KEY_MERGE_STATUS: &str = "merge_status";
pub const KEY_MERGE_COMMIT: &str = "merge_commit";
pub const KEY_MERGE_DETAILS: &str = "merge_details";
pub const KEY_COMPLETION_MESSAGE: &str = "completion_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    Question,
    Approval,
    BudgetReview,
    Merge,
    Completion,
}

impl std::fmt::Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Question => write!(f, "question"),
            Self::Approval => write!(f, "approval"),
            Self::BudgetReview => write!(f, "budget_review"),
            Self::Merge => write!(f, "merge"),
            Self::Completion => write!(f, "completion"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EffectError {
    #[error("effect send failed: {0}")]
    SendFailed(String),

    #[error("{kind} effect timed out after {waited:?}")]
    Timeout { kind: EffectKind, waited: Duration },

    #[error("response payload mismatch: expected `{expected}`, got `{actual}`")]
    PayloadMismatch { expected: String, actual: String },

    #[error("shutdown observed while awaiting response")]
    Shutdown,
}

impl EffectError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendFailed(_) => "transient_io",
            Self::Timeout { .. } => "effect_timeout",
            Self::PayloadMismatch { .. } => "effect_payload_mismatch",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Capability surface an effect needs from its host agent.
#[async_trait]
pub trait Runtime: Send {
    fn agent_id(&self) -> &str;

    /// Agent that receives effects when no explicit target is set.
    fn default_target(&self) -> &str;

    /// Arm reply correlation for `envelope.id`, then route the envelope.
    async fn send_request(&mut self, envelope: Envelope) -> Result<(), EffectError>;

    /// Route a fire-and-forget envelope.
    async fn send(&mut self, envelope: Envelope) -> Result<(), EffectError>;

    /// Next envelope from the reply channel; `None` when the channel closed
    /// (the dispatcher shut down).
    async fn recv_reply(&mut self) -> Option<Envelope>;

    /// Next inbox envelope, or `Ok(None)` when `timeout` elapses idle.
    /// Observing a SHUTDOWN envelope returns `Err(EffectError::Shutdown)`.
    async fn recv_inbox(&mut self, timeout: Duration) -> Result<Option<Envelope>, EffectError>;
}

/// What an executed effect hands back to the driver.
#[derive(Debug, Default, Clone)]
pub struct EffectOutcome {
    /// Entries folded into the role's state data.
    pub data: BTreeMap<String, serde_json::Value>,
    /// When set, the FSM must transition to this state.
    pub target_state: Option<String>,
    /// Human-readable one-liner for logs and telemetry.
    pub summary: String,
}

impl EffectOutcome {
    fn with(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    fn set(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.data.insert(key.to_string(), value.into());
    }
}

/// A blocking primitive the driver executes on the role's behalf.
#[async_trait]
pub trait Effect: Send {
    fn kind(&self) -> EffectKind;
    async fn execute(&self, rt: &mut dyn Runtime) -> Result<EffectOutcome, EffectError>;
}

/// Correlation-filtered receive: keep reading the reply channel until the
/// RESPONSE matching `request_id` arrives, discarding stale envelopes.
async fn await_response(
    rt: &mut dyn Runtime,
    kind: EffectKind,
    request_id: &str,
    timeout: Duration,
) -> Result<Envelope, EffectError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EffectError::Timeout {
                kind,
                waited: timeout,
            });
        }
        let env = match tokio::time::timeout(remaining, rt.recv_reply()).await {
            Err(_) => {
                return Err(EffectError::Timeout {
                    kind,
                    waited: timeout,
                })
            }
            Ok(None) => return Err(EffectError::Shutdown),
            Ok(Some(env)) => env,
        };

        if env.msg_type != MsgType::Response {
            warn!(msg = %env.id, msg_type = %env.msg_type, "non-response on reply channel, discarding");
            continue;
        }
        if env.parent_msg_id.as_deref() != Some(request_id) {
            debug!(
                msg = %env.id,
                parent = ?env.parent_msg_id,
                expected = request_id,
                "stale response discarded"
            );
            continue;
        }
        return Ok(env);
    }
}

fn mismatch(expected: &str, actual: &str) -> EffectError {
    EffectError::PayloadMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Question
// ---------------------------------------------------------------------------

/// Ask the architect a clarification question and wait for the answer.
pub struct QuestionEffect {
    pub text: String,
    pub urgency: Urgency,
    pub context: Option<String>,
    pub story_id: Option<String>,
    pub target: Option<String>,
    pub timeout: Duration,
}

impl QuestionEffect {
    pub fn new(text: impl Into<String>, urgency: Urgency) -> Self {
        Self {
            text: text.into(),
            urgency,
            context: None,
            story_id: None,
            target: None,
            timeout: QUESTION_TIMEOUT,
        }
    }

    pub fn for_story(mut self, story_id: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Effect for QuestionEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::Question
    }

    async fn execute(&self, rt: &mut dyn Runtime) -> Result<EffectOutcome, EffectError> {
        let to = self
            .target
            .clone()
            .unwrap_or_else(|| rt.default_target().to_string());
        let mut req = Envelope::new(
            MsgType::Request,
            rt.agent_id(),
            to,
            Payload::QuestionRequest(QuestionRequest {
                text: self.text.clone(),
                urgency: self.urgency,
                context: self.context.clone(),
            }),
        )
        .with_meta("correlation_id", correlation::generate_question_id());
        if let Some(story) = &self.story_id {
            req = req.with_meta("story_id", story.clone());
        }
        let request_id = req.id.clone();
        rt.send_request(req).await?;

        let resp = await_response(rt, self.kind(), &request_id, self.timeout).await?;
        let answer = resp
            .extract_question_response()
            .map_err(|_| mismatch("question_response", resp.payload.kind()))?;

        let mut outcome = EffectOutcome::with(format!("question answered ({})", self.urgency));
        outcome.set(KEY_QUESTION_ANSWER, answer.answer.clone());
        if let Some(confidence) = answer.confidence {
            outcome.set(KEY_QUESTION_CONFIDENCE, confidence as f64);
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// Per-status FSM routing for approval effects.
#[derive(Debug, Clone, Default)]
pub struct StatusRoutes {
    pub approved: Option<String>,
    pub rejected: Option<String>,
    pub needs_changes: Option<String>,
    pub pending: Option<String>,
}

impl StatusRoutes {
    pub fn route_for(&self, status: ApprovalStatus) -> Option<&str> {
        match status {
            ApprovalStatus::Approved => self.approved.as_deref(),
            ApprovalStatus::Rejected => self.rejected.as_deref(),
            ApprovalStatus::NeedsChanges => self.needs_changes.as_deref(),
            ApprovalStatus::Pending => self.pending.as_deref(),
        }
    }
}

/// Request a plan/code/completion approval and route on the verdict.
pub struct ApprovalEffect {
    pub approval_type: ApprovalType,
    pub content: String,
    pub reason: String,
    pub context: Option<String>,
    pub story_id: Option<String>,
    pub routes: StatusRoutes,
    pub target: Option<String>,
    pub timeout: Duration,
}

impl ApprovalEffect {
    pub fn new(
        approval_type: ApprovalType,
        content: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            approval_type,
            content: content.into(),
            reason: reason.into(),
            context: None,
            story_id: None,
            routes: StatusRoutes::default(),
            target: None,
            timeout: APPROVAL_TIMEOUT,
        }
    }

    pub fn for_story(mut self, story_id: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self
    }

    pub fn with_routes(mut self, routes: StatusRoutes) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Effect for ApprovalEffect {
    fn kind(&self) -> EffectKind {
        if self.approval_type == ApprovalType::BudgetReview {
            EffectKind::BudgetReview
        } else {
            EffectKind::Approval
        }
    }

    async fn execute(&self, rt: &mut dyn Runtime) -> Result<EffectOutcome, EffectError> {
        let to = self
            .target
            .clone()
            .unwrap_or_else(|| rt.default_target().to_string());
        let mut req = Envelope::new(
            MsgType::Request,
            rt.agent_id(),
            to,
            Payload::ApprovalRequest(ApprovalRequest {
                approval_type: self.approval_type,
                content: self.content.clone(),
                reason: self.reason.clone(),
                context: self.context.clone(),
            }),
        )
        .with_meta("correlation_id", correlation::generate_approval_id());
        if let Some(story) = &self.story_id {
            req = req.with_meta("story_id", story.clone());
        }
        let request_id = req.id.clone();
        rt.send_request(req).await?;

        let resp = await_response(rt, self.kind(), &request_id, self.timeout).await?;
        let verdict = resp
            .extract_approval_response()
            .map_err(|_| mismatch("approval_response", resp.payload.kind()))?;

        let mut outcome = EffectOutcome::with(format!(
            "{} approval: {}",
            self.approval_type, verdict.status
        ));
        outcome.set(KEY_APPROVAL_STATUS, verdict.status.to_string());
        outcome.set(KEY_APPROVAL_FEEDBACK, verdict.feedback.clone());
        outcome.target_state = self.routes.route_for(verdict.status).map(String::from);
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Budget review
// ---------------------------------------------------------------------------

/// What the architect decided about a loop that hit its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Continue,
    Pivot,
    Abandon,
}

impl BudgetDecision {
    /// Approval verdicts double as budget decisions: APPROVED keeps going,
    /// NEEDS_CHANGES pivots, anything else abandons.
    pub fn from_status(status: ApprovalStatus) -> Self {
        match status {
            ApprovalStatus::Approved => Self::Continue,
            ApprovalStatus::NeedsChanges => Self::Pivot,
            ApprovalStatus::Rejected | ApprovalStatus::Pending => Self::Abandon,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Pivot => "PIVOT",
            Self::Abandon => "ABANDON",
        }
    }
}

/// Escalate a budget-exceeded (or repeated empty-response) condition.
pub struct BudgetReviewEffect {
    pub state_name: String,
    pub issue_type: String,
    pub detail: String,
    pub story_id: Option<String>,
    /// State to enter when the decision is PIVOT.
    pub pivot_state: Option<String>,
    /// State to enter when the decision is ABANDON; defaults to the role's
    /// error state via the driver.
    pub abandon_state: Option<String>,
    pub target: Option<String>,
    pub timeout: Duration,
}

impl BudgetReviewEffect {
    pub fn new(
        state_name: impl Into<String>,
        issue_type: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            state_name: state_name.into(),
            issue_type: issue_type.into(),
            detail: detail.into(),
            story_id: None,
            pivot_state: None,
            abandon_state: None,
            target: None,
            timeout: APPROVAL_TIMEOUT,
        }
    }

    pub fn for_story(mut self, story_id: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self
    }

    pub fn pivot_to(mut self, state: impl Into<String>) -> Self {
        self.pivot_state = Some(state.into());
        self
    }

    pub fn abandon_to(mut self, state: impl Into<String>) -> Self {
        self.abandon_state = Some(state.into());
        self
    }
}

#[async_trait]
impl Effect for BudgetReviewEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::BudgetReview
    }

    async fn execute(&self, rt: &mut dyn Runtime) -> Result<EffectOutcome, EffectError> {
        let to = self
            .target
            .clone()
            .unwrap_or_else(|| rt.default_target().to_string());
        let mut req = Envelope::new(
            MsgType::Request,
            rt.agent_id(),
            to,
            Payload::ApprovalRequest(ApprovalRequest {
                approval_type: ApprovalType::BudgetReview,
                content: self.detail.clone(),
                reason: format!("budget exceeded in {}", self.state_name),
                context: Some(self.state_name.clone()),
            }),
        )
        .with_meta("correlation_id", correlation::generate_approval_id())
        .with_meta("issue_type", self.issue_type.clone());
        if let Some(story) = &self.story_id {
            req = req.with_meta("story_id", story.clone());
        }
        let request_id = req.id.clone();
        rt.send_request(req).await?;

        let resp = await_response(rt, self.kind(), &request_id, self.timeout).await?;
        let verdict = resp
            .extract_approval_response()
            .map_err(|_| mismatch("approval_response", resp.payload.kind()))?;

        let decision = BudgetDecision::from_status(verdict.status);
        let mut outcome =
            EffectOutcome::with(format!("budget review: {}", decision.as_str()));
        outcome.set(KEY_BUDGET_DECISION, decision.as_str());
        outcome.set(KEY_APPROVAL_FEEDBACK, verdict.feedback.clone());
        outcome.target_state = match decision {
            BudgetDecision::Continue => None,
            BudgetDecision::Pivot => self.pivot_state.clone(),
            BudgetDecision::Abandon => self.abandon_state.clone(),
        };
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Per-outcome FSM routing for the merge effect.
#[derive(Debug, Clone, Default)]
pub struct MergeRoutes {
    pub merged: Option<String>,
    pub conflict: Option<String>,
    pub failed: Option<String>,
}

impl MergeRoutes {
    pub fn route_for(&self, status: MergeStatus) -> Option<&str> {
        match status {
            MergeStatus::Merged => self.merged.as_deref(),
            MergeStatus::Conflict => self.conflict.as_deref(),
            MergeStatus::Failed => self.failed.as_deref(),
        }
    }
}

/// Ask the architect to merge the story branch.
pub struct MergeEffect {
    pub story_id: String,
    pub branch_name: String,
    pub pr_url: Option<String>,
    pub routes: MergeRoutes,
    pub target: Option<String>,
    pub timeout: Duration,
}

impl MergeEffect {
    pub fn new(story_id: impl Into<String>, branch_name: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            branch_name: branch_name.into(),
            pr_url: None,
            routes: MergeRoutes::default(),
            target: None,
            timeout: APPROVAL_TIMEOUT,
        }
    }

    pub fn with_pr_url(mut self, pr_url: Option<String>) -> Self {
        self.pr_url = pr_url;
        self
    }

    pub fn with_routes(mut self, routes: MergeRoutes) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Effect for MergeEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::Merge
    }

    async fn execute(&self, rt: &mut dyn Runtime) -> Result<EffectOutcome, EffectError> {
        let to = self
            .target
            .clone()
            .unwrap_or_else(|| rt.default_target().to_string());
        let req = Envelope::new(
            MsgType::Request,
            rt.agent_id(),
            to,
            Payload::MergeRequest(MergeRequest {
                story_id: self.story_id.clone(),
                branch_name: self.branch_name.clone(),
                pr_url: self.pr_url.clone(),
            }),
        )
        .with_meta("correlation_id", correlation::generate_correlation_id())
        .with_meta("story_id", self.story_id.clone());
        let request_id = req.id.clone();
        rt.send_request(req).await?;

        let resp = await_response(rt, self.kind(), &request_id, self.timeout).await?;
        let merge = resp
            .extract_merge_response()
            .map_err(|_| mismatch("merge_response", resp.payload.kind()))?;

        let mut outcome = EffectOutcome::with(format!("merge: {}", merge.status));
        outcome.set(KEY_MERGE_STATUS, merge.status.to_string());
        if let Some(commit) = &merge.merge_commit {
            outcome.set(KEY_MERGE_COMMIT, commit.clone());
        }
        if let Some(details) = merge
            .conflict_details
            .as_ref()
            .or(merge.error_details.as_ref())
        {
            outcome.set(KEY_MERGE_DETAILS, details.clone());
        }
        outcome.target_state = self.routes.route_for(merge.status).map(String::from);
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Local effect: no message, resolves immediately with a mandated target
/// state. Exists so "I am done" reads like every other effect.
pub struct CompletionEffect {
    pub target_state: String,
    pub message: String,
}

impl CompletionEffect {
    pub fn new(target_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target_state: target_state.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Effect for CompletionEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::Completion
    }

    async fn execute(&self, _rt: &mut dyn Runtime) -> Result<EffectOutcome, EffectError> {
        let mut outcome = EffectOutcome::with(self.message.clone());
        outcome.set(KEY_COMPLETION_MESSAGE, self.message.clone());
        outcome.target_state = Some(self.target_state.clone());
        Ok(outcome)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRuntime;
    use super::*;
    use crate::messages::{ApprovalResponse, MergeResponse, QuestionResponse};
    use chrono::Utc;

    fn approval_response(status: ApprovalStatus) -> Payload {
        Payload::ApprovalResponse(ApprovalResponse {
            status,
            feedback: "noted".into(),
            reviewed_by: "architect-001".into(),
            reviewed_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn question_effect_round_trip() {
        let mut rt = ScriptedRuntime::new("coder-001");
        rt.push_answer(Payload::QuestionResponse(QuestionResponse {
            answer: "use port 8080".into(),
            confidence: Some(0.8),
        }));

        let effect = QuestionEffect::new("which port?", Urgency::High).for_story("s1");
        let outcome = effect.execute(&mut rt).await.unwrap();

        assert_eq!(
            outcome.data[KEY_QUESTION_ANSWER].as_str(),
            Some("use port 8080")
        );
        assert!(outcome.target_state.is_none());

        let req = &rt.sent[0];
        assert_eq!(req.msg_type, MsgType::Request);
        assert_eq!(req.to_agent, "architect-001");
        assert_eq!(req.meta("story_id"), Some("s1"));
        assert!(req.meta("correlation_id").unwrap().starts_with("question-"));
    }

    #[tokio::test]
    async fn stale_responses_are_discarded() {
        let mut rt = ScriptedRuntime::new("coder-001");
        // A response correlated to some long-gone request arrives first.
        let stale = Envelope::new(
            MsgType::Response,
            "architect-001",
            "coder-001",
            approval_response(ApprovalStatus::Rejected),
        )
        .with_parent("msg-ancient");
        rt.push_raw(stale);
        rt.push_answer(approval_response(ApprovalStatus::Approved));

        let effect = ApprovalEffect::new(ApprovalType::Plan, "the plan", "review please")
            .with_routes(StatusRoutes {
                approved: Some("CODING".into()),
                rejected: Some("ERROR".into()),
                needs_changes: Some("PLANNING".into()),
                pending: None,
            });
        let outcome = effect.execute(&mut rt).await.unwrap();

        // The stale REJECTED was skipped; the correlated APPROVED won.
        assert_eq!(outcome.data[KEY_APPROVAL_STATUS].as_str(), Some("APPROVED"));
        assert_eq!(outcome.target_state.as_deref(), Some("CODING"));
    }

    #[tokio::test]
    async fn payload_mismatch_is_fatal() {
        let mut rt = ScriptedRuntime::new("coder-001");
        rt.push_answer(Payload::QuestionResponse(QuestionResponse {
            answer: "not an approval".into(),
            confidence: None,
        }));

        let effect = ApprovalEffect::new(ApprovalType::Code, "diff", "review");
        let err = effect.execute(&mut rt).await.unwrap_err();
        assert_eq!(err.kind(), "effect_payload_mismatch");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_effect_times_out() {
        let mut rt = ScriptedRuntime::new("coder-001");
        let effect = QuestionEffect::new("anyone there?", Urgency::Low)
            .with_timeout(Duration::from_secs(5));

        let err = effect.execute(&mut rt).await.unwrap_err();
        assert_eq!(err.kind(), "effect_timeout");
    }

    #[tokio::test]
    async fn merge_effect_routes_on_conflict() {
        let mut rt = ScriptedRuntime::new("coder-001");
        rt.push_answer(Payload::MergeResponse(MergeResponse {
            status: MergeStatus::Conflict,
            merge_commit: None,
            conflict_details: Some("both modified src/api.rs".into()),
            error_details: None,
        }));

        let effect = MergeEffect::new("s1", "story-s1").with_routes(MergeRoutes {
            merged: Some("DONE".into()),
            conflict: Some("CODING".into()),
            failed: Some("CODING".into()),
        });
        let outcome = effect.execute(&mut rt).await.unwrap();

        assert_eq!(outcome.data[KEY_MERGE_STATUS].as_str(), Some("conflict"));
        assert_eq!(
            outcome.data[KEY_MERGE_DETAILS].as_str(),
            Some("both modified src/api.rs")
        );
        assert_eq!(outcome.target_state.as_deref(), Some("CODING"));
    }

    #[tokio::test]
    async fn budget_review_maps_status_to_decision() {
        for (status, decision, expect_state) in [
            (ApprovalStatus::Approved, "CONTINUE", None),
            (ApprovalStatus::NeedsChanges, "PIVOT", Some("PLANNING")),
            (ApprovalStatus::Rejected, "ABANDON", Some("ERROR")),
        ] {
            let mut rt = ScriptedRuntime::new("coder-001");
            rt.push_answer(approval_response(status));

            let effect = BudgetReviewEffect::new("CODING", "max_iterations", "8 rounds no progress")
                .pivot_to("PLANNING")
                .abandon_to("ERROR");
            let outcome = effect.execute(&mut rt).await.unwrap();

            assert_eq!(outcome.data[KEY_BUDGET_DECISION].as_str(), Some(decision));
            assert_eq!(outcome.target_state.as_deref(), expect_state);

            let req = &rt.sent[0];
            assert_eq!(req.meta("issue_type"), Some("max_iterations"));
            let approval = req.extract_approval_request().unwrap();
            assert_eq!(approval.approval_type, ApprovalType::BudgetReview);
        }
    }

    #[tokio::test]
    async fn completion_effect_is_local() {
        let mut rt = ScriptedRuntime::new("coder-001");
        let effect = CompletionEffect::new("DONE", "story implemented and merged");
        let outcome = effect.execute(&mut rt).await.unwrap();

        assert!(rt.sent.is_empty(), "completion must not send messages");
        assert_eq!(outcome.target_state.as_deref(), Some("DONE"));
        assert_eq!(
            outcome.data[KEY_COMPLETION_MESSAGE].as_str(),
            Some("story implemented and merged")
        );
    }
}
