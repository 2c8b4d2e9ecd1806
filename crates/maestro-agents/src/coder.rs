//! The coder role: one story at a time, plan → code → test → review →
//! merge, inside an isolated container on a dedicated git branch.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use orchestration::container::{ContainerCli, ContainerSpec, StartedContainer};
use orchestration::driver::{BudgetConfig, DriverConfig, FsmState, Role, RoleError, Step};
use orchestration::effects::{
    ApprovalEffect, BudgetReviewEffect, Effect, EffectError, EffectOutcome, MergeEffect,
    MergeRoutes, QuestionEffect, Runtime, StatusRoutes, KEY_APPROVAL_FEEDBACK,
    KEY_APPROVAL_STATUS, KEY_MERGE_DETAILS, KEY_QUESTION_ANSWER,
};
use orchestration::git::{story_branch, MirrorManager, WorkspaceManager};
use orchestration::messages::{ApprovalType, MsgType, Urgency};
use orchestration::runtime::{pinned_image, ImageRole, RuntimeRegistry, TrackedContainer};
use orchestration::state::StateData;

use crate::config::MaestroConfig;
use crate::llm::{CompletionClient, LlmError};
use crate::stories::{parse_story_envelope, Story};

const PLAN_SYSTEM: &str =
    "You are a software implementation planner. Produce a concrete, reviewable plan \
     for the story. Use the ask_architect tool when requirements are ambiguous.";
const CODE_SYSTEM: &str =
    "You are a software implementer working in a container workspace. Apply the plan, \
     fix the reported failures. Use ask_architect for questions and request_approval \
     for risky changes.";

/// Feedback fed back into the next LLM turn is capped to the tail of the
/// failing output.
const FEEDBACK_MAX_LINES: usize = 30;
const FEEDBACK_MAX_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoderState {
    Waiting,
    Setup,
    Planning,
    Coding,
    Testing,
    Reviewing,
    Merging,
    Done,
    Error,
}

impl fmt::Display for CoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "WAITING"),
            Self::Setup => write!(f, "SETUP"),
            Self::Planning => write!(f, "PLANNING"),
            Self::Coding => write!(f, "CODING"),
            Self::Testing => write!(f, "TESTING"),
            Self::Reviewing => write!(f, "REVIEWING"),
            Self::Merging => write!(f, "MERGING"),
            Self::Done => write!(f, "DONE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl FsmState for CoderState {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "WAITING" => Some(Self::Waiting),
            "SETUP" => Some(Self::Setup),
            "PLANNING" => Some(Self::Planning),
            "CODING" => Some(Self::Coding),
            "TESTING" => Some(Self::Testing),
            "REVIEWING" => Some(Self::Reviewing),
            "MERGING" => Some(Self::Merging),
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

/// Compact classification of a test-stage failure, fed back to CODING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestFailureKind {
    ContainerBuildFix,
    ContainerRuntimeFix,
    TestFix,
    ContainerConfigSetup,
    LoopbackLintFix,
}

impl TestFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContainerBuildFix => "container_build_fix",
            Self::ContainerRuntimeFix => "container_runtime_fix",
            Self::TestFix => "test_fix",
            Self::ContainerConfigSetup => "container_config_setup",
            Self::LoopbackLintFix => "loopback_lint_fix",
        }
    }
}

/// Map failing test output onto a fix category.
pub fn classify_test_failure(output: &str) -> TestFailureKind {
    let lower = output.to_lowercase();
    if lower.contains("dockerfile") || lower.contains("failed to build") {
        TestFailureKind::ContainerBuildFix
    } else if lower.contains("oci runtime") || lower.contains("container exited") {
        TestFailureKind::ContainerRuntimeFix
    } else if lower.contains("no such file") && lower.contains("config") {
        TestFailureKind::ContainerConfigSetup
    } else if lower.contains("loopback") {
        TestFailureKind::LoopbackLintFix
    } else {
        TestFailureKind::TestFix
    }
}

/// Keep the last lines of a failing command's output, capped in size.
pub fn condense(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let tail_start = lines.len().saturating_sub(FEEDBACK_MAX_LINES);
    let tail = lines[tail_start..].join("\n");
    if tail.chars().count() <= FEEDBACK_MAX_CHARS {
        return tail;
    }
    let skip = tail.chars().count() - FEEDBACK_MAX_CHARS;
    tail.chars().skip(skip).collect()
}

/// Local effect converting a test failure into a mandated return to CODING.
struct TestFailureEffect {
    kind: TestFailureKind,
    details: String,
}

#[async_trait]
impl Effect for TestFailureEffect {
    fn kind(&self) -> orchestration::effects::EffectKind {
        orchestration::effects::EffectKind::Completion
    }

    async fn execute(&self, _rt: &mut dyn Runtime) -> Result<EffectOutcome, EffectError> {
        let mut outcome = EffectOutcome::default();
        outcome.summary = format!("test failure: {}", self.kind.as_str());
        outcome
            .data
            .insert("failure_type".into(), self.kind.as_str().into());
        outcome
            .data
            .insert("test_feedback".into(), self.details.clone().into());
        outcome.target_state = Some(CoderState::Coding.to_string());
        Ok(outcome)
    }
}

fn llm_err(e: LlmError) -> RoleError {
    match e {
        LlmError::MissingCredentials(_) | LlmError::ScriptExhausted => {
            RoleError::Fatal(e.to_string())
        }
        _ => RoleError::Transient(e.to_string()),
    }
}

/// Driver configuration matching the coder's per-state budgets.
pub fn coder_driver_config(config: &MaestroConfig) -> DriverConfig {
    DriverConfig {
        budgets: BudgetConfig::new(5)
            .with_state(CoderState::Waiting, u32::MAX)
            .with_state(CoderState::Planning, config.planning_budget)
            .with_state(CoderState::Coding, config.coding_budget)
            .with_state(CoderState::Testing, config.testing_budget)
            .with_state(CoderState::Reviewing, 3)
            .with_state(CoderState::Merging, 2),
        max_total_steps: 10_000,
    }
}

pub struct CoderRole {
    llm: Arc<dyn CompletionClient>,
    docker: ContainerCli,
    mirror: MirrorManager,
    workspace: WorkspaceManager,
    registry: Arc<RuntimeRegistry>,
    config: MaestroConfig,
    repo_url: String,
    repo_name: String,
    story: Option<Story>,
    workspace_path: Option<PathBuf>,
    container: Option<StartedContainer>,
}

impl CoderRole {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn CompletionClient>,
        docker: ContainerCli,
        mirror: MirrorManager,
        workspace: WorkspaceManager,
        registry: Arc<RuntimeRegistry>,
        config: MaestroConfig,
        repo_url: impl Into<String>,
        repo_name: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            docker,
            mirror,
            workspace,
            registry,
            config,
            repo_url: repo_url.into(),
            repo_name: repo_name.into(),
            story: None,
            workspace_path: None,
            container: None,
        }
    }

    fn story(&self) -> Result<&Story, RoleError> {
        self.story
            .as_ref()
            .ok_or_else(|| RoleError::Fatal("no story owned in a working state".into()))
    }

    fn container_id(&self) -> Result<&str, RoleError> {
        self.container
            .as_ref()
            .map(|c| c.cid.as_str())
            .ok_or_else(|| RoleError::Fatal("no container in a working state".into()))
    }

    /// The image a story container runs: the pinned target image, falling
    /// back to the safe image, then the configured default.
    fn story_image(&self) -> String {
        pinned_image(ImageRole::Target)
            .or_else(|| pinned_image(ImageRole::Safe))
            .unwrap_or_else(|| self.config.default_image.clone())
    }

    async fn run_in_container(
        &self,
        cmd: &str,
    ) -> Result<orchestration::exec::CommandOutput, RoleError> {
        let cid = self.container_id()?;
        self.docker
            .exec_capture(cid, &["sh", "-c", cmd])
            .await
            .map_err(|e| RoleError::Transient(e.to_string()))
    }

    async fn waiting(
        &mut self,
        data: &mut StateData,
        rt: &mut dyn Runtime,
    ) -> Result<Step<CoderState>, RoleError> {
        match rt.recv_inbox(self.config.idle_poll).await {
            Ok(None) => Ok(Step::to(CoderState::Waiting)),
            Ok(Some(env)) if env.msg_type == MsgType::Story => {
                let story = parse_story_envelope(&env)
                    .map_err(|e| RoleError::Fatal(e.to_string()))?;
                info!(agent = rt.agent_id(), story = %story.id, "story accepted");
                data.set("story_id", story.id.clone());
                data.set("story_title", story.title.clone());
                data.set("branch_name", story_branch(&story.id));
                data.set("requester", env.from_agent.clone());
                self.story = Some(story);
                Ok(Step::to(CoderState::Setup).because("story received"))
            }
            Ok(Some(env)) => {
                warn!(msg_type = %env.msg_type, "unexpected envelope while waiting");
                Ok(Step::to(CoderState::Waiting))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn setup(
        &mut self,
        data: &mut StateData,
        rt: &mut dyn Runtime,
    ) -> Result<Step<CoderState>, RoleError> {
        let story = self.story()?.clone();
        let fatal = |e: orchestration::git::WorkspaceError| RoleError::Fatal(e.to_string());

        let mirror = self
            .mirror
            .ensure_mirror(&self.repo_url, &self.repo_name)
            .await
            .map_err(fatal)?;
        self.mirror.refresh(&mirror).await.map_err(fatal)?;

        let workspace = self
            .workspace
            .provision_story_workspace(
                rt.agent_id(),
                &story.id,
                &self.config.target_branch,
                &mirror,
            )
            .await
            .map_err(fatal)?;

        let image = self.story_image();
        let name = format!("maestro-{}", rt.agent_id());
        self.docker
            .remove(&name)
            .await
            .map_err(|e| RoleError::Fatal(e.to_string()))?;
        let spec = ContainerSpec::new(image.clone(), name).mount(&workspace, "/workspace");
        let started = self
            .docker
            .start(&spec)
            .await
            .map_err(|e| RoleError::Fatal(e.to_string()))?;
        self.registry.register_container(TrackedContainer {
            cid: started.cid.clone(),
            name: started.name.clone(),
            network: None,
            started_at: chrono::Utc::now(),
        });

        info!(
            agent = rt.agent_id(),
            story = %story.id,
            image = %image,
            cid = %started.cid,
            "workspace and container ready"
        );
        data.set("image", image);
        self.workspace_path = Some(workspace);
        self.container = Some(started);
        Ok(Step::to(CoderState::Planning).because("workspace ready"))
    }

    async fn planning(
        &mut self,
        data: &mut StateData,
        _rt: &mut dyn Runtime,
    ) -> Result<Step<CoderState>, RoleError> {
        let story = self.story()?.clone();

        let mut prompt = format!("Story {}: {}\n\n{}\n", story.id, story.title, story.description);
        if let Some(answer) = data.get_str(KEY_QUESTION_ANSWER) {
            prompt.push_str(&format!("\nArchitect answered: {answer}\n"));
        }
        if data.get_str(KEY_APPROVAL_STATUS) == Some("NEEDS_CHANGES") {
            if let Some(feedback) = data.get_str(KEY_APPROVAL_FEEDBACK) {
                prompt.push_str(&format!("\nPrevious plan needs changes: {feedback}\n"));
            }
        }

        let resp = self
            .llm
            .complete(PLAN_SYSTEM, &prompt)
            .await
            .map_err(llm_err)?;

        if let Some(call) = resp.find_tool("ask_architect") {
            let question = call
                .arg_str("question")
                .map(String::from)
                .unwrap_or_else(|| resp.text.clone());
            return Ok(Step::to(CoderState::Planning)
                .with_effect(
                    QuestionEffect::new(question, Urgency::Medium)
                        .for_story(story.id.clone())
                        .with_timeout(self.config.question_timeout),
                )
                .because("clarification needed"));
        }
        if resp.is_empty() {
            return Err(RoleError::Transient("empty planning response".into()));
        }

        data.set("plan", resp.text.clone());
        data.remove(KEY_APPROVAL_STATUS);
        Ok(Step::to(CoderState::Planning)
            .with_effect(
                ApprovalEffect::new(ApprovalType::Plan, resp.text, "plan for review")
                    .for_story(story.id.clone())
                    .with_routes(StatusRoutes {
                        approved: Some(CoderState::Coding.to_string()),
                        needs_changes: Some(CoderState::Planning.to_string()),
                        rejected: Some(CoderState::Error.to_string()),
                        pending: Some(CoderState::Planning.to_string()),
                    })
                    .with_timeout(self.config.approval_timeout),
            )
            .because("plan submitted"))
    }

    async fn coding(
        &mut self,
        data: &mut StateData,
        _rt: &mut dyn Runtime,
    ) -> Result<Step<CoderState>, RoleError> {
        let story = self.story()?.clone();

        let mut prompt = format!("Story {}: {}\n", story.id, story.title);
        if let Some(plan) = data.get_str("plan") {
            prompt.push_str(&format!("\nPlan:\n{plan}\n"));
        }
        for (label, key) in [
            ("Build/lint failure", "build_feedback"),
            ("Test failure", "test_feedback"),
            ("Merge failure", KEY_MERGE_DETAILS),
            ("Architect answer", KEY_QUESTION_ANSWER),
            ("Review feedback", KEY_APPROVAL_FEEDBACK),
        ] {
            if let Some(value) = data.get_str(key) {
                prompt.push_str(&format!("\n{label}:\n{value}\n"));
            }
        }

        let resp = self
            .llm
            .complete(CODE_SYSTEM, &prompt)
            .await
            .map_err(llm_err)?;

        if let Some(call) = resp.find_tool("ask_architect") {
            let question = call
                .arg_str("question")
                .map(String::from)
                .unwrap_or_else(|| resp.text.clone());
            data.remove(KEY_QUESTION_ANSWER);
            return Ok(Step::to(CoderState::Coding)
                .with_effect(
                    QuestionEffect::new(question, Urgency::Medium)
                        .for_story(story.id.clone())
                        .with_timeout(self.config.question_timeout),
                )
                .because("question pending"));
        }
        if let Some(call) = resp.find_tool("request_approval") {
            let content = call
                .arg_str("summary")
                .map(String::from)
                .unwrap_or_else(|| resp.text.clone());
            return Ok(Step::to(CoderState::Coding)
                .with_effect(
                    ApprovalEffect::new(ApprovalType::Code, content, "code review requested")
                        .for_story(story.id.clone())
                        .with_routes(StatusRoutes {
                            approved: Some(CoderState::Coding.to_string()),
                            needs_changes: Some(CoderState::Coding.to_string()),
                            rejected: Some(CoderState::Error.to_string()),
                            pending: Some(CoderState::Coding.to_string()),
                        })
                        .with_timeout(self.config.approval_timeout),
                )
                .because("code approval pending"));
        }

        if resp.is_empty() {
            let empty = data.incr("consecutive_empty");
            if empty >= u64::from(self.config.empty_response_limit) {
                data.remove("consecutive_empty");
                return Ok(Step::to(CoderState::Coding)
                    .with_effect(
                        BudgetReviewEffect::new(
                            CoderState::Coding.to_string(),
                            "no_tool_calls",
                            format!("{empty} consecutive responses without tool calls"),
                        )
                        .for_story(story.id.clone())
                        .pivot_to(CoderState::Planning.to_string())
                        .abandon_to(CoderState::Error.to_string()),
                    )
                    .because("empty-response escalation"));
            }
            return Err(RoleError::Transient("empty coding response".into()));
        }
        data.remove("consecutive_empty");

        let build = self.run_in_container(&self.config.build_cmd.clone()).await?;
        if !build.success() {
            data.set("build_feedback", condense(&build.combined()));
            return Ok(Step::to(CoderState::Coding).because("build failed"));
        }
        let lint = self.run_in_container(&self.config.lint_cmd.clone()).await?;
        if !lint.success() {
            data.set("build_feedback", condense(&lint.combined()));
            return Ok(Step::to(CoderState::Coding).because("lint failed"));
        }

        data.remove("build_feedback");
        Ok(Step::to(CoderState::Testing).because("build and lint clean"))
    }

    async fn testing(
        &mut self,
        data: &mut StateData,
        _rt: &mut dyn Runtime,
    ) -> Result<Step<CoderState>, RoleError> {
        let out = self.run_in_container(&self.config.test_cmd.clone()).await?;
        if out.success() {
            data.remove("test_feedback");
            return Ok(Step::to(CoderState::Reviewing).because("tests green"));
        }
        let combined = out.combined();
        let kind = classify_test_failure(&combined);
        Ok(Step::to(CoderState::Testing)
            .with_effect(TestFailureEffect {
                kind,
                details: condense(&combined),
            })
            .because("tests failed"))
    }

    async fn reviewing(
        &mut self,
        data: &mut StateData,
        _rt: &mut dyn Runtime,
    ) -> Result<Step<CoderState>, RoleError> {
        let story = self.story()?.clone();
        let branch = data
            .get_str("branch_name")
            .map(String::from)
            .unwrap_or_else(|| story_branch(&story.id));

        if !data.contains("branch_pushed") {
            let workspace = self
                .workspace_path
                .clone()
                .ok_or_else(|| RoleError::Fatal("no workspace in REVIEWING".into()))?;
            self.workspace
                .push_branch(&workspace, &branch)
                .await
                .map_err(|e| RoleError::Transient(e.to_string()))?;
            data.set("branch_pushed", true);
        }

        let summary = format!(
            "Story {} implemented on {branch}; build, lint, and tests green.",
            story.id
        );
        data.remove(KEY_APPROVAL_STATUS);
        Ok(Step::to(CoderState::Reviewing)
            .with_effect(
                ApprovalEffect::new(ApprovalType::Completion, summary, "completion review")
                    .for_story(story.id.clone())
                    .with_routes(StatusRoutes {
                        approved: Some(CoderState::Merging.to_string()),
                        needs_changes: Some(CoderState::Coding.to_string()),
                        rejected: Some(CoderState::Error.to_string()),
                        pending: Some(CoderState::Reviewing.to_string()),
                    })
                    .with_timeout(self.config.approval_timeout),
            )
            .because("completion review requested"))
    }

    async fn merging(
        &mut self,
        data: &mut StateData,
        _rt: &mut dyn Runtime,
    ) -> Result<Step<CoderState>, RoleError> {
        let story = self.story()?.clone();
        let branch = data
            .get_str("branch_name")
            .map(String::from)
            .unwrap_or_else(|| story_branch(&story.id));

        // One retry through CODING after a conflict or failure; a second
        // non-merged outcome is terminal.
        let attempts = data.get_u64("merge_attempts").unwrap_or(0);
        let retry_state = if attempts >= 1 {
            CoderState::Error
        } else {
            CoderState::Coding
        };
        data.incr("merge_attempts");

        let pr_url = data.get_str("pr_url").map(String::from);
        Ok(Step::to(CoderState::Merging)
            .with_effect(
                MergeEffect::new(story.id.clone(), branch)
                    .with_pr_url(pr_url)
                    .with_routes(MergeRoutes {
                        merged: Some(CoderState::Done.to_string()),
                        conflict: Some(retry_state.to_string()),
                        failed: Some(retry_state.to_string()),
                    })
                    .with_timeout(self.config.approval_timeout),
            )
            .because("merge requested"))
    }
}

#[async_trait]
impl Role for CoderRole {
    type State = CoderState;

    fn initial_state(&self) -> CoderState {
        CoderState::Waiting
    }

    async fn transition(
        &mut self,
        current: CoderState,
        data: &mut StateData,
        rt: &mut dyn Runtime,
    ) -> Result<Step<CoderState>, RoleError> {
        match current {
            CoderState::Waiting => self.waiting(data, rt).await,
            CoderState::Setup => self.setup(data, rt).await,
            CoderState::Planning => self.planning(data, rt).await,
            CoderState::Coding => self.coding(data, rt).await,
            CoderState::Testing => self.testing(data, rt).await,
            CoderState::Reviewing => self.reviewing(data, rt).await,
            CoderState::Merging => self.merging(data, rt).await,
            CoderState::Done | CoderState::Error => {
                Err(RoleError::Fatal("transition from terminal state".into()))
            }
        }
    }

    fn on_budget_exceeded(
        &mut self,
        state: CoderState,
        data: &StateData,
    ) -> Option<Box<dyn Effect>> {
        let pivot = match state {
            CoderState::Planning => CoderState::Coding,
            CoderState::Coding => CoderState::Planning,
            CoderState::Testing | CoderState::Reviewing | CoderState::Merging => CoderState::Coding,
            _ => return None,
        };
        let story_id = data.get_str("story_id").unwrap_or_default().to_string();
        Some(Box::new(
            BudgetReviewEffect::new(
                state.to_string(),
                "max_iterations",
                format!("iteration budget exceeded in {state}"),
            )
            .for_story(story_id)
            .pivot_to(pivot.to_string())
            .abandon_to(CoderState::Error.to_string()),
        ))
    }
}
