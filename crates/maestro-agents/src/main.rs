//! `agentctl` — standalone agent runner.
//!
//! Runs a single role against a JSON input file. With `scripted_turns` in
//! the input the LLM is replayed offline and no credentials are needed;
//! otherwise `ANTHROPIC_API_KEY` is required (exit code 2 when missing).
//!
//! Exit codes: 0 success, 1 usage or runtime error, 2 missing credentials.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tracing::info;

use orchestration::dispatch::Dispatcher;
use orchestration::driver::RunOutcome;
use orchestration::exec::SystemRunner;
use orchestration::git::{MirrorManager, WorkspaceManager};
use orchestration::messages::{
    ApprovalResponse, ApprovalStatus, Envelope, MsgType, Payload, QuestionResponse,
};
use orchestration::state::FileStateStore;

use maestro_agents::architect::{architect_driver_config, ArchitectRole};
use maestro_agents::coder::{coder_driver_config, CoderRole};
use maestro_agents::config::MaestroConfig;
use maestro_agents::gateway::{GitCliGateway, MergeGateway, ScriptedGateway};
use maestro_agents::kernel::Kernel;
use maestro_agents::llm::{AnthropicClient, CompletionClient, CompletionResponse, LlmError, ScriptedClient};
use maestro_agents::stories::{story_envelope, MarkdownSpecParser, Story};
use maestro_agents::telemetry;
use maestro_agents::{coder_id, ARCHITECT_ID};

const EXIT_OK: i32 = 0;
const EXIT_RUNTIME: i32 = 1;
const EXIT_MISSING_CREDENTIALS: i32 = 2;

#[derive(Parser)]
#[command(name = "agentctl", about = "Standalone agent runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a role against an input file.
    Run {
        #[arg(value_enum)]
        role: RoleArg,
        /// JSON input: repo, spec or story, optional scripted LLM turns.
        #[arg(long)]
        input: PathBuf,
        /// Working directory for state, mirrors, and workspaces.
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Tear down containers and stacks on exit.
        #[arg(long)]
        cleanup: bool,
    },
    /// Atomically switch the active container to a new image.
    Promote {
        /// Role slot to promote into.
        #[arg(long, default_value = "target")]
        role: String,
        /// Image to promote; defaults to the last built image.
        #[arg(long)]
        image: Option<String>,
        /// Project directory holding the pinned-image config.
        #[arg(long)]
        project_dir: Option<PathBuf>,
        /// Health command run inside the candidate.
        #[arg(long)]
        health_cmd: Option<String>,
    },
    /// Run the built artifact as a demo and report its exposure.
    Demo {
        /// Image to run.
        #[arg(long)]
        image: String,
        /// Project directory (compose file, persisted demo config).
        #[arg(long)]
        project_dir: Option<PathBuf>,
        /// Force a specific container port instead of discovery.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Coder,
    Architect,
}

/// The runner's input file.
#[derive(Debug, Deserialize)]
struct InputFile {
    repo_url: String,
    #[serde(default)]
    repo_name: Option<String>,
    /// Architect mode: the specification to decompose.
    #[serde(default)]
    spec_markdown: Option<String>,
    /// Coder mode: the story to implement.
    #[serde(default)]
    story: Option<Story>,
    /// Offline mode: canned LLM turns, replayed in order.
    #[serde(default)]
    scripted_turns: Option<Vec<CompletionResponse>>,
}

fn main() {
    telemetry::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                EXIT_OK
            } else {
                EXIT_RUNTIME
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let code = match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("agentctl: {e:#}");
            EXIT_RUNTIME
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            role,
            input,
            workdir,
            cleanup,
        } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("reading input file {}", input.display()))?;
            let input: InputFile = serde_json::from_str(&raw).context("parsing input file")?;
            let workdir = workdir.unwrap_or_else(|| PathBuf::from("."));

            let llm: Arc<dyn CompletionClient> = match &input.scripted_turns {
                Some(turns) => Arc::new(ScriptedClient::new(turns.clone())),
                None => match AnthropicClient::from_env() {
                    Ok(client) => Arc::new(client),
                    Err(LlmError::MissingCredentials(var)) => {
                        eprintln!("agentctl: missing credentials: set {var}");
                        return Ok(EXIT_MISSING_CREDENTIALS);
                    }
                    Err(e) => return Err(e.into()),
                },
            };

            let outcome = match role {
                RoleArg::Coder => run_coder(&input, &workdir, llm, cleanup).await?,
                RoleArg::Architect => run_architect(&input, &workdir, llm, cleanup).await?,
            };
            Ok(match outcome {
                RunOutcome::Done => EXIT_OK,
                RunOutcome::Error { reason } => {
                    eprintln!("agentctl: agent finished in error state: {reason}");
                    EXIT_RUNTIME
                }
            })
        }
        Command::Promote {
            role,
            image,
            project_dir,
            health_cmd,
        } => {
            use orchestration::runtime::{
                switch_container, DockerOrchestrator, ImageRole, RuntimeState, SwitchStatus,
            };

            let role = match role.as_str() {
                "safe" => ImageRole::Safe,
                "target" => ImageRole::Target,
                other => bail!("unknown role `{other}` (expected safe|target)"),
            };
            let project_dir = project_dir.unwrap_or_else(|| PathBuf::from("."));
            let runner = Arc::new(SystemRunner);
            let mut orc = DockerOrchestrator::new(
                orchestration::container::ContainerCli::new(runner),
                &project_dir,
            );
            if let Some(cmd) = health_cmd {
                orc = orc.with_health_cmd(
                    ["sh", "-c"]
                        .into_iter()
                        .map(String::from)
                        .chain(std::iter::once(cmd))
                        .collect(),
                );
            }
            let image = match image.or_else(|| {
                orchestration::runtime::Orchestrator::last_built_image(&orc)
            }) {
                Some(image) => image,
                None => bail!("no image given and no last-built image recorded"),
            };

            let state = RuntimeState::new();
            let report = switch_container(&orc, &state, role, &image).await;
            println!(
                "promotion {}: role={} image={}",
                match report.status {
                    SwitchStatus::Switched => "switched",
                    SwitchStatus::Noop => "noop",
                    SwitchStatus::Failed => "failed",
                },
                report.role,
                report.active_image_id.as_deref().unwrap_or("-"),
            );
            if let Some(error) = &report.error {
                eprintln!("agentctl: promotion error: {error}");
                return Ok(EXIT_RUNTIME);
            }
            Ok(EXIT_OK)
        }
        Command::Demo {
            image,
            project_dir,
            port,
        } => {
            let project_dir = project_dir.unwrap_or_else(|| PathBuf::from("."));
            let runner = Arc::new(SystemRunner);
            let registry = orchestration::runtime::RuntimeRegistry::new();
            let mut demo = orchestration::demo::DemoRunner::new(
                orchestration::container::ContainerCli::new(runner.clone()),
                orchestration::container::ComposeCli::new(runner),
                &project_dir,
            );
            demo.user_port_override = port;

            let report = demo.start(&image, &registry).await?;
            println!(
                "demo up: mode={} container_port={} host_port={}",
                report.mode,
                report
                    .container_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".into()),
                report
                    .host_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".into()),
            );
            Ok(EXIT_OK)
        }
    }
}

fn repo_name(input: &InputFile) -> String {
    input.repo_name.clone().unwrap_or_else(|| {
        input
            .repo_url
            .rsplit('/')
            .next()
            .unwrap_or("repo")
            .trim_end_matches(".git")
            .to_string()
    })
}

async fn run_coder(
    input: &InputFile,
    workdir: &std::path::Path,
    llm: Arc<dyn CompletionClient>,
    cleanup: bool,
) -> Result<RunOutcome> {
    let story = input
        .story
        .clone()
        .context("coder mode requires `story` in the input file")?;
    let config = MaestroConfig::default();
    let runner = Arc::new(SystemRunner);
    let kernel = Kernel::new(runner.clone(), config.inbox_capacity);
    let store = Arc::new(FileStateStore::in_workdir(workdir)?);

    // Standalone coder runs answer their own approvals: an auto-architect
    // approves everything and resolves merges through the scripted gateway.
    spawn_auto_architect(kernel.dispatcher.clone(), Arc::new(ScriptedGateway::new())).await?;

    let agent = coder_id(1);
    let role = CoderRole::new(
        llm,
        orchestration::container::ContainerCli::new(runner.clone()),
        MirrorManager::new(runner.clone(), workdir),
        WorkspaceManager::new(runner.clone(), workdir),
        kernel.registry.clone(),
        config.clone(),
        input.repo_url.clone(),
        repo_name(input),
    );
    let handle = kernel
        .spawn_role(&agent, role, store, coder_driver_config(&config))
        .await?;

    kernel
        .dispatcher
        .dispatch(story_envelope(ARCHITECT_ID, &agent, &story))
        .await?;

    let outcome = handle.await.context("coder task panicked")?;
    info!(outcome = ?outcome, "coder run complete");
    if cleanup {
        kernel.stop().await;
    }
    Ok(outcome)
}

async fn run_architect(
    input: &InputFile,
    workdir: &std::path::Path,
    llm: Arc<dyn CompletionClient>,
    cleanup: bool,
) -> Result<RunOutcome> {
    let Some(spec) = input.spec_markdown.clone() else {
        bail!("architect mode requires `spec_markdown` in the input file");
    };
    let config = MaestroConfig::default();
    let runner = Arc::new(SystemRunner);
    let kernel = Kernel::new(runner.clone(), config.inbox_capacity);
    let store = Arc::new(FileStateStore::in_workdir(workdir)?);

    let coders: Vec<String> = (1..=config.coder_count).map(coder_id).collect();
    for agent in &coders {
        let role = CoderRole::new(
            llm.clone(),
            orchestration::container::ContainerCli::new(runner.clone()),
            MirrorManager::new(runner.clone(), workdir),
            WorkspaceManager::new(runner.clone(), workdir),
            kernel.registry.clone(),
            config.clone(),
            input.repo_url.clone(),
            repo_name(input),
        );
        kernel
            .spawn_role(agent, role, store.clone(), coder_driver_config(&config))
            .await?;
    }

    let gateway: Arc<dyn MergeGateway> = Arc::new(GitCliGateway::new(
        runner.clone(),
        workdir.join("pm-001"),
        config.target_branch.clone(),
    ));
    let role = ArchitectRole::new(
        llm,
        Arc::new(MarkdownSpecParser),
        gateway,
        MirrorManager::new(runner.clone(), workdir),
        WorkspaceManager::new(runner.clone(), workdir),
        config.clone(),
        input.repo_url.clone(),
        repo_name(input),
        spec,
        coders,
    );
    let handle = kernel
        .spawn_role(ARCHITECT_ID, role, store, architect_driver_config())
        .await?;

    let outcome = handle.await.context("architect task panicked")?;
    info!(outcome = ?outcome, "architect run complete");
    if cleanup {
        kernel.stop().await;
    }
    Ok(outcome)
}

/// Answer every request approvingly so a solo coder can finish its FSM.
async fn spawn_auto_architect(
    dispatcher: Arc<Dispatcher>,
    gateway: Arc<dyn MergeGateway>,
) -> Result<()> {
    let mut channels = dispatcher.register(ARCHITECT_ID).await?;
    tokio::spawn(async move {
        while let Some(env) = channels.inbox.recv().await {
            if env.msg_type == MsgType::Shutdown {
                break;
            }
            let reply = match &env.payload {
                Payload::QuestionRequest(_) => Some(Payload::QuestionResponse(QuestionResponse {
                    answer: "Proceed with the simplest approach.".into(),
                    confidence: Some(0.5),
                })),
                Payload::ApprovalRequest(_) => {
                    Some(Payload::ApprovalResponse(ApprovalResponse {
                        status: ApprovalStatus::Approved,
                        feedback: "auto-approved".into(),
                        reviewed_by: ARCHITECT_ID.into(),
                        reviewed_at: Utc::now(),
                    }))
                }
                Payload::MergeRequest(req) => Some(Payload::MergeResponse(
                    gateway
                        .merge_story(&req.story_id, &req.branch_name, req.pr_url.as_deref())
                        .await,
                )),
                _ => None,
            };
            if let Some(payload) = reply {
                if dispatcher
                    .dispatch(Envelope::response_to(&env, payload))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });
    Ok(())
}
