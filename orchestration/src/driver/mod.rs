//! Generic agent driver — runs a role's finite-state machine.
//!
//! The driver owns the loop; roles only decide transitions. Per step it
//! loads the persisted snapshot, invokes the role's `transition`, executes
//! any effect the step produced (folding the outcome into state data and
//! honoring a mandated target state), and persists the transition **before**
//! the step completes, so a crash between steps resumes from the last
//! persisted state.
//!
//! Every state carries an iteration budget. Re-entering a state past its
//! budget raises a budget-exceeded condition the role may convert into a
//! budget-review effect; the review decision dictates CONTINUE, PIVOT, or
//! ABANDON.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::effects::{Effect, EffectError, Runtime, KEY_BUDGET_DECISION};
use crate::messages::{Envelope, MsgType, Payload};
use crate::state::{AgentSnapshot, StateData, StateStore, StoreError};

/// A role's state space.
pub trait FsmState:
    Copy + Eq + Hash + fmt::Display + Send + Sync + 'static
{
    /// Parse a persisted state name; `None` for unknown names.
    fn parse(name: &str) -> Option<Self>;
    fn is_terminal(self) -> bool;
    fn done_state() -> Self;
    fn error_state() -> Self;
}

/// One transition decision from a role.
pub struct Step<S> {
    pub next: S,
    pub effect: Option<Box<dyn Effect>>,
    pub reason: Option<String>,
}

impl<S> Step<S> {
    pub fn to(next: S) -> Self {
        Self {
            next,
            effect: None,
            reason: None,
        }
    }

    pub fn with_effect(mut self, effect: impl Effect + 'static) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Errors a role surfaces from `transition`.
#[derive(Debug, Error)]
pub enum RoleError {
    /// Unrecoverable; the FSM goes to its error state.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Recoverable within the state's iteration budget; the FSM stays put.
    #[error("transient: {0}")]
    Transient(String),

    /// Shutdown was observed; the FSM unwinds.
    #[error("shutdown observed")]
    Shutdown,
}

impl From<EffectError> for RoleError {
    fn from(e: EffectError) -> Self {
        match e {
            EffectError::Shutdown => RoleError::Shutdown,
            EffectError::PayloadMismatch { .. } => RoleError::Fatal(e.to_string()),
            EffectError::Timeout { .. } | EffectError::SendFailed(_) => {
                RoleError::Transient(e.to_string())
            }
        }
    }
}

/// The capability set a concrete role provides.
#[async_trait]
pub trait Role: Send {
    type State: FsmState;

    fn initial_state(&self) -> Self::State;

    /// Decide the next state, optionally with a blocking effect.
    async fn transition(
        &mut self,
        current: Self::State,
        data: &mut StateData,
        rt: &mut dyn Runtime,
    ) -> Result<Step<Self::State>, RoleError>;

    /// Convert a budget-exceeded condition into a review effect.
    /// `None` sends the FSM to its error state.
    fn on_budget_exceeded(
        &mut self,
        _state: Self::State,
        _data: &StateData,
    ) -> Option<Box<dyn Effect>> {
        None
    }
}

/// Per-state iteration budgets, keyed by state name.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    per_state: HashMap<String, u32>,
    default_max: u32,
}

impl BudgetConfig {
    pub fn new(default_max: u32) -> Self {
        Self {
            per_state: HashMap::new(),
            default_max,
        }
    }

    pub fn with_state(mut self, state: impl fmt::Display, max_iterations: u32) -> Self {
        self.per_state.insert(state.to_string(), max_iterations);
        self
    }

    pub fn max_for(&self, state: &str) -> u32 {
        self.per_state
            .get(state)
            .copied()
            .unwrap_or(self.default_max)
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Tracks consecutive re-entries per state.
#[derive(Debug, Default)]
struct BudgetTracker {
    counts: HashMap<String, u32>,
}

impl BudgetTracker {
    /// Count a re-entry of `state`, returning the new consecutive count.
    fn re_enter(&mut self, state: &str) -> u32 {
        let count = self.counts.entry(state.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Progress to a different state resets that state's streak.
    fn leave(&mut self, state: &str) {
        self.counts.remove(state);
    }

    fn reset(&mut self, state: &str) {
        self.counts.remove(state);
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub budgets: BudgetConfig,
    /// Hard cap on total steps; a runaway FSM fails instead of spinning.
    pub max_total_steps: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            budgets: BudgetConfig::default(),
            max_total_steps: 1000,
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("state store failure: {0}")]
    Store(#[from] StoreError),
}

/// Terminal result of a driver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Error { reason: String },
}

pub struct AgentDriver<R: Role> {
    agent_id: String,
    role: R,
    store: Arc<dyn StateStore>,
    config: DriverConfig,
    cancel: CancellationToken,
}

impl<R: Role> AgentDriver<R> {
    pub fn new(
        agent_id: impl Into<String>,
        role: R,
        store: Arc<dyn StateStore>,
        config: DriverConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            store,
            config,
            cancel,
        }
    }

    /// Load the persisted snapshot, or start fresh at the initial state.
    fn load_snapshot(&self) -> Result<(AgentSnapshot, R::State), DriverError> {
        let initial = self.role.initial_state();
        match self.store.get(&self.agent_id)? {
            Some(snapshot) => match R::State::parse(&snapshot.current_state) {
                Some(state) => Ok((snapshot, state)),
                None => {
                    warn!(
                        agent = %self.agent_id,
                        stored = %snapshot.current_state,
                        "persisted state unknown to role, restarting fresh"
                    );
                    Ok((AgentSnapshot::new(initial.to_string()), initial))
                }
            },
            None => Ok((AgentSnapshot::new(initial.to_string()), initial)),
        }
    }

    /// Persist a transition; a `put` failure is fatal to the step.
    fn persist(
        &self,
        snapshot: &mut AgentSnapshot,
        from: R::State,
        to: R::State,
        reason: Option<String>,
        data: &StateData,
    ) -> Result<(), DriverError> {
        snapshot.state_data = data.clone();
        if snapshot.story_id.is_none() {
            if let Some(story) = data.get_str("story_id") {
                snapshot.story_id = Some(story.to_string());
            }
        }
        if to.is_terminal() {
            // Ownership is released only on terminal transitions.
            snapshot.story_id = None;
        }
        snapshot.record_transition(from.to_string(), to.to_string(), reason);
        self.store.put(&self.agent_id, snapshot)?;
        Ok(())
    }

    /// Best-effort ERROR envelope to whoever dispatched the story.
    async fn emit_error_envelope(
        &self,
        rt: &mut dyn Runtime,
        data: &StateData,
        last_state: &str,
        reason: &str,
    ) {
        let to = data
            .get_str("requester")
            .unwrap_or(rt.default_target())
            .to_string();
        let mut payload = vec![
            ("reason".to_string(), serde_json::Value::from(reason)),
            (
                "current_state".to_string(),
                serde_json::Value::from(last_state),
            ),
        ];
        if let Some(story) = data.get_str("story_id") {
            payload.push(("story_id".to_string(), serde_json::Value::from(story)));
        }
        let env = Envelope::new(
            MsgType::Error,
            self.agent_id.clone(),
            to,
            Payload::Generic(payload.into_iter().collect()),
        );
        if let Err(e) = rt.send(env).await {
            warn!(agent = %self.agent_id, error = %e, "error envelope not delivered");
        }
    }

    /// Run the FSM to a terminal state.
    pub async fn run(&mut self, rt: &mut dyn Runtime) -> Result<RunOutcome, DriverError> {
        let (mut snapshot, mut current) = self.load_snapshot()?;
        let mut data = snapshot.state_data.clone();
        let mut tracker = BudgetTracker::default();
        let mut steps: u32 = 0;

        if current.is_terminal() {
            return Ok(self.outcome_for(current, &data));
        }

        info!(agent = %self.agent_id, state = %current, "driver starting");

        loop {
            if self.cancel.is_cancelled() {
                let reason = "shutdown: cancellation requested".to_string();
                self.persist(
                    &mut snapshot,
                    current,
                    R::State::error_state(),
                    Some(reason.clone()),
                    &data,
                )?;
                self.emit_error_envelope(rt, &data, &current.to_string(), &reason)
                    .await;
                return Ok(RunOutcome::Error { reason });
            }

            steps += 1;
            if steps > self.config.max_total_steps {
                let reason = format!("budget_exceeded: {} total steps", steps - 1);
                self.persist(
                    &mut snapshot,
                    current,
                    R::State::error_state(),
                    Some(reason.clone()),
                    &data,
                )?;
                self.emit_error_envelope(rt, &data, &current.to_string(), &reason)
                    .await;
                return Ok(RunOutcome::Error { reason });
            }

            let cancel = self.cancel.clone();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RoleError::Shutdown),
                step = self.role.transition(current, &mut data, rt) => step,
            };

            let (mut next, mut reason) = match step {
                Ok(step) => {
                    let mut next = step.next;
                    let mut reason = step.reason;
                    if let Some(effect) = step.effect {
                        match effect.execute(rt).await {
                            Ok(outcome) => {
                                debug!(
                                    agent = %self.agent_id,
                                    kind = %effect.kind(),
                                    summary = %outcome.summary,
                                    "effect resolved"
                                );
                                data.merge(outcome.data);
                                if let Some(target) = outcome.target_state {
                                    match R::State::parse(&target) {
                                        Some(state) => next = state,
                                        None => {
                                            next = R::State::error_state();
                                            reason = Some(format!(
                                                "effect mandated unknown state `{target}`"
                                            ));
                                        }
                                    }
                                }
                                if reason.is_none() {
                                    reason = Some(outcome.summary);
                                }
                            }
                            Err(EffectError::Shutdown) => {
                                let reason = "shutdown while awaiting response".to_string();
                                self.persist(
                                    &mut snapshot,
                                    current,
                                    R::State::error_state(),
                                    Some(reason.clone()),
                                    &data,
                                )?;
                                return Ok(RunOutcome::Error { reason });
                            }
                            Err(e @ EffectError::PayloadMismatch { .. }) => {
                                next = R::State::error_state();
                                reason = Some(e.to_string());
                            }
                            Err(e) => {
                                // Timeout or send failure: retry within the
                                // state's budget.
                                warn!(agent = %self.agent_id, error = %e, "effect failed, retrying in state");
                                data.set("last_effect_error", e.to_string());
                                next = current;
                                reason = Some(e.to_string());
                            }
                        }
                    }
                    (next, reason)
                }
                Err(RoleError::Shutdown) => {
                    let reason = "shutdown envelope observed".to_string();
                    self.persist(
                        &mut snapshot,
                        current,
                        R::State::error_state(),
                        Some(reason.clone()),
                        &data,
                    )?;
                    self.emit_error_envelope(rt, &data, &current.to_string(), &reason)
                        .await;
                    return Ok(RunOutcome::Error { reason });
                }
                Err(RoleError::Fatal(why)) => (R::State::error_state(), Some(why)),
                Err(RoleError::Transient(why)) => (current, Some(why)),
            };

            // Budget accounting: staying put consumes the state's budget.
            if next == current && !next.is_terminal() {
                let used = tracker.re_enter(&current.to_string());
                let max = self.config.budgets.max_for(&current.to_string());
                if used > max {
                    warn!(
                        agent = %self.agent_id,
                        state = %current,
                        used,
                        max,
                        "iteration budget exceeded"
                    );
                    match self.role.on_budget_exceeded(current, &data) {
                        Some(review) => match review.execute(rt).await {
                            Ok(outcome) => {
                                data.merge(outcome.data);
                                tracker.reset(&current.to_string());
                                match data.get_str(KEY_BUDGET_DECISION) {
                                    Some("ABANDON") => {
                                        next = match outcome
                                            .target_state
                                            .as_deref()
                                            .and_then(R::State::parse)
                                        {
                                            Some(state) => state,
                                            None => R::State::error_state(),
                                        };
                                        reason = Some("budget review: ABANDON".into());
                                    }
                                    Some("PIVOT") => {
                                        if let Some(state) = outcome
                                            .target_state
                                            .as_deref()
                                            .and_then(R::State::parse)
                                        {
                                            next = state;
                                        }
                                        reason = Some("budget review: PIVOT".into());
                                    }
                                    _ => {
                                        reason = Some("budget review: CONTINUE".into());
                                    }
                                }
                            }
                            Err(e) => {
                                next = R::State::error_state();
                                reason = Some(format!("budget review failed: {e}"));
                            }
                        },
                        None => {
                            next = R::State::error_state();
                            reason =
                                Some(format!("budget_exceeded: {used} iterations in {current}"));
                        }
                    }
                }
            } else {
                tracker.leave(&current.to_string());
            }

            self.persist(&mut snapshot, current, next, reason.clone(), &data)?;
            debug!(
                agent = %self.agent_id,
                from = %current,
                to = %next,
                reason = reason.as_deref().unwrap_or(""),
                "transition persisted"
            );

            if next.is_terminal() {
                let outcome = self.outcome_for(next, &data);
                if let RunOutcome::Error { reason } = &outcome {
                    error!(agent = %self.agent_id, reason = %reason, "driver finished in error state");
                    self.emit_error_envelope(rt, &data, &current.to_string(), reason)
                        .await;
                } else {
                    info!(agent = %self.agent_id, "driver finished");
                }
                return Ok(outcome);
            }
            current = next;
        }
    }

    fn outcome_for(&self, state: R::State, data: &StateData) -> RunOutcome {
        if state == R::State::done_state() {
            RunOutcome::Done
        } else {
            RunOutcome::Error {
                reason: data
                    .get_str("last_effect_error")
                    .unwrap_or("reached error state")
                    .to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::testing::ScriptedRuntime;
    use crate::effects::{BudgetReviewEffect, CompletionEffect};
    use crate::messages::{ApprovalResponse, ApprovalStatus};
    use crate::state::InMemoryStateStore;
    use chrono::Utc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestState {
        Start,
        Work,
        Done,
        Error,
    }

    impl fmt::Display for TestState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Start => write!(f, "START"),
                Self::Work => write!(f, "WORK"),
                Self::Done => write!(f, "DONE"),
                Self::Error => write!(f, "ERROR"),
            }
        }
    }

    impl FsmState for TestState {
        fn parse(name: &str) -> Option<Self> {
            match name {
                "START" => Some(Self::Start),
                "WORK" => Some(Self::Work),
                "DONE" => Some(Self::Done),
                "ERROR" => Some(Self::Error),
                _ => None,
            }
        }
        fn is_terminal(self) -> bool {
            matches!(self, Self::Done | Self::Error)
        }
        fn done_state() -> Self {
            Self::Done
        }
        fn error_state() -> Self {
            Self::Error
        }
    }

    /// Spins in WORK until `rounds_needed` is hit, then completes.
    struct SpinningRole {
        rounds_needed: u64,
        review_on_budget: bool,
    }

    #[async_trait]
    impl Role for SpinningRole {
        type State = TestState;

        fn initial_state(&self) -> TestState {
            TestState::Start
        }

        async fn transition(
            &mut self,
            current: TestState,
            data: &mut StateData,
            _rt: &mut dyn Runtime,
        ) -> Result<Step<TestState>, RoleError> {
            match current {
                TestState::Start => Ok(Step::to(TestState::Work).because("begin")),
                TestState::Work => {
                    let rounds = data.incr("rounds");
                    if rounds >= self.rounds_needed {
                        Ok(Step::to(TestState::Work)
                            .with_effect(CompletionEffect::new("DONE", "work complete")))
                    } else {
                        Ok(Step::to(TestState::Work).because("still working"))
                    }
                }
                _ => Err(RoleError::Fatal("transition from terminal".into())),
            }
        }

        fn on_budget_exceeded(
            &mut self,
            state: TestState,
            _data: &StateData,
        ) -> Option<Box<dyn Effect>> {
            if self.review_on_budget {
                Some(Box::new(
                    BudgetReviewEffect::new(state.to_string(), "max_iterations", "spinning")
                        .abandon_to("ERROR"),
                ))
            } else {
                None
            }
        }
    }

    fn store() -> Arc<InMemoryStateStore> {
        Arc::new(InMemoryStateStore::new())
    }

    #[tokio::test]
    async fn happy_path_persists_every_transition() {
        let store = store();
        let mut driver = AgentDriver::new(
            "coder-001",
            SpinningRole {
                rounds_needed: 2,
                review_on_budget: false,
            },
            store.clone(),
            DriverConfig::default(),
            CancellationToken::new(),
        );
        let mut rt = ScriptedRuntime::new("coder-001");

        let outcome = driver.run(&mut rt).await.unwrap();
        assert_eq!(outcome, RunOutcome::Done);

        let snap = store.get("coder-001").unwrap().unwrap();
        assert_eq!(snap.current_state, "DONE");
        // START→WORK, WORK→WORK, WORK→DONE.
        assert_eq!(snap.transitions.len(), 3);
        assert_eq!(snap.transitions.last().unwrap().to, "DONE");
    }

    #[tokio::test]
    async fn budget_exceeded_without_review_goes_to_error() {
        let store = store();
        let config = DriverConfig {
            budgets: BudgetConfig::new(3),
            max_total_steps: 100,
        };
        let mut driver = AgentDriver::new(
            "coder-001",
            SpinningRole {
                rounds_needed: u64::MAX,
                review_on_budget: false,
            },
            store.clone(),
            config,
            CancellationToken::new(),
        );
        let mut rt = ScriptedRuntime::new("coder-001");

        let outcome = driver.run(&mut rt).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Error { .. }));

        let snap = store.get("coder-001").unwrap().unwrap();
        assert_eq!(snap.current_state, "ERROR");
        let last = snap.transitions.last().unwrap();
        assert!(last.reason.as_deref().unwrap().contains("budget_exceeded"));

        // The ERROR envelope reached the default target.
        assert!(rt
            .sent
            .iter()
            .any(|e| e.msg_type == MsgType::Error && e.to_agent == "architect-001"));
    }

    #[tokio::test]
    async fn budget_review_abandon_terminates() {
        let store = store();
        let config = DriverConfig {
            budgets: BudgetConfig::new(2),
            max_total_steps: 100,
        };
        let mut driver = AgentDriver::new(
            "coder-001",
            SpinningRole {
                rounds_needed: u64::MAX,
                review_on_budget: true,
            },
            store.clone(),
            config,
            CancellationToken::new(),
        );
        let mut rt = ScriptedRuntime::new("coder-001");
        // First review says keep going, second abandons.
        for status in [ApprovalStatus::Approved, ApprovalStatus::Rejected] {
            rt.push_answer(Payload::ApprovalResponse(ApprovalResponse {
                status,
                feedback: "review".into(),
                reviewed_by: "architect-001".into(),
                reviewed_at: Utc::now(),
            }));
        }

        let outcome = driver.run(&mut rt).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Error { .. }));

        let snap = store.get("coder-001").unwrap().unwrap();
        assert_eq!(snap.current_state, "ERROR");
        assert_eq!(snap.state_data.get_str("budget_decision"), Some("ABANDON"));
    }

    #[tokio::test]
    async fn cancellation_unwinds_to_error_and_persists() {
        let store = store();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut driver = AgentDriver::new(
            "coder-001",
            SpinningRole {
                rounds_needed: u64::MAX,
                review_on_budget: false,
            },
            store.clone(),
            DriverConfig::default(),
            cancel,
        );
        let mut rt = ScriptedRuntime::new("coder-001");

        let outcome = driver.run(&mut rt).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Error { .. }));

        let snap = store.get("coder-001").unwrap().unwrap();
        assert_eq!(snap.current_state, "ERROR");
    }

    #[tokio::test]
    async fn story_ownership_released_on_terminal() {
        struct StoryRole;

        #[async_trait]
        impl Role for StoryRole {
            type State = TestState;
            fn initial_state(&self) -> TestState {
                TestState::Start
            }
            async fn transition(
                &mut self,
                current: TestState,
                data: &mut StateData,
                _rt: &mut dyn Runtime,
            ) -> Result<Step<TestState>, RoleError> {
                match current {
                    TestState::Start => {
                        data.set("story_id", "story-5");
                        Ok(Step::to(TestState::Work))
                    }
                    TestState::Work => Ok(Step::to(TestState::Done)),
                    _ => Err(RoleError::Fatal("done".into())),
                }
            }
        }

        let store = store();
        let mut driver = AgentDriver::new(
            "coder-001",
            StoryRole,
            store.clone(),
            DriverConfig::default(),
            CancellationToken::new(),
        );
        let mut rt = ScriptedRuntime::new("coder-001");
        driver.run(&mut rt).await.unwrap();

        let snap = store.get("coder-001").unwrap().unwrap();
        // Mid-run transitions owned the story; the terminal snapshot does not.
        assert!(snap.story_id.is_none());
        assert_eq!(snap.state_data.get_str("story_id"), Some("story-5"));
    }

    #[tokio::test]
    async fn resumes_from_persisted_state() {
        let store = store();
        let mut snap = AgentSnapshot::new("WORK");
        snap.state_data.set("rounds", 1u64);
        store.put("coder-001", &snap).unwrap();

        let mut driver = AgentDriver::new(
            "coder-001",
            SpinningRole {
                rounds_needed: 2,
                review_on_budget: false,
            },
            store.clone(),
            DriverConfig::default(),
            CancellationToken::new(),
        );
        let mut rt = ScriptedRuntime::new("coder-001");
        let outcome = driver.run(&mut rt).await.unwrap();
        assert_eq!(outcome, RunOutcome::Done);

        // Resumed mid-FSM: no START transition in the new records.
        let snap = store.get("coder-001").unwrap().unwrap();
        assert!(snap.transitions.iter().all(|t| t.from != "START"));
    }
}
