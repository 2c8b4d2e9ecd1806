//! Git mirror and per-story workspace management.
//!
//! One bare mirror per upstream repo under `<project>/.mirrors/`; every
//! story gets a worktree cloned from the mirror on branch `story-<id>`.
//! Workspaces are only ever populated through a temp clone plus
//! [`atomic_replace`], so a reader never observes a half-written tree.

pub mod mirror;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::exec::{CommandOutput, CommandRunner, ExecError};

pub use mirror::MirrorManager;

/// Read-only project-manager workspace directory name.
pub const PM_WORKSPACE: &str = "pm-001";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git {operation} failed: {stderr}")]
    GitFailed { operation: String, stderr: String },

    #[error("workspace io failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl WorkspaceError {
    pub fn kind(&self) -> &'static str {
        "transient_io"
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn check(operation: &str, out: CommandOutput) -> Result<CommandOutput, WorkspaceError> {
    if out.success() {
        Ok(out)
    } else {
        Err(WorkspaceError::GitFailed {
            operation: operation.to_string(),
            stderr: out.combined().trim().to_string(),
        })
    }
}

/// Branch name for a story's worktree.
pub fn story_branch(story_id: &str) -> String {
    format!("story-{story_id}")
}

/// Replace `target` with `source` atomically.
///
/// rename target → target.old, rename source → target, remove target.old.
/// If the second rename fails, target.old is restored so `target` is
/// unchanged.
pub fn atomic_replace(target: &Path, source: &Path) -> Result<(), WorkspaceError> {
    let old = target.with_extension("old");
    if old.exists() {
        std::fs::remove_dir_all(&old).map_err(WorkspaceError::io(&old))?;
    }

    let had_target = target.exists();
    if had_target {
        std::fs::rename(target, &old).map_err(WorkspaceError::io(target))?;
    }

    if let Err(source_err) = std::fs::rename(source, target) {
        if had_target {
            if let Err(restore_err) = std::fs::rename(&old, target) {
                warn!(
                    target = %target.display(),
                    error = %restore_err,
                    "restore of previous workspace failed"
                );
            }
        }
        return Err(WorkspaceError::Io {
            path: source.to_path_buf(),
            source: source_err,
        });
    }

    if had_target {
        if let Err(e) = std::fs::remove_dir_all(&old) {
            warn!(path = %old.display(), error = %e, "stale workspace not removed");
        }
    }
    debug!(target = %target.display(), "workspace replaced");
    Ok(())
}

/// Per-story worktrees and the read-only PM workspace, all rooted under one
/// project directory.
pub struct WorkspaceManager {
    runner: Arc<dyn CommandRunner>,
    project_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            project_root: project_root.into(),
        }
    }

    pub fn workspace_path(&self, agent_id: &str) -> PathBuf {
        self.project_root.join(agent_id)
    }

    pub fn pm_workspace_path(&self) -> PathBuf {
        self.project_root.join(PM_WORKSPACE)
    }

    fn temp_clone_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        self.project_root.join(".tmp").join(format!("clone-{nanos}"))
    }

    async fn git(
        &self,
        operation: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, WorkspaceError> {
        check(operation, self.runner.run("git", args, cwd).await?)
    }

    /// Provision `<project>/<agent_id>/` on branch `story-<id>` from the
    /// mirror's tip of `target_branch`, replacing any previous workspace
    /// atomically.
    pub async fn provision_story_workspace(
        &self,
        agent_id: &str,
        story_id: &str,
        target_branch: &str,
        mirror: &Path,
    ) -> Result<PathBuf, WorkspaceError> {
        let temp = self.temp_clone_path();
        if let Some(parent) = temp.parent() {
            std::fs::create_dir_all(parent).map_err(WorkspaceError::io(parent))?;
        }
        let branch = story_branch(story_id);

        self.git(
            "clone",
            &[
                "clone",
                "--branch",
                target_branch,
                &mirror.display().to_string(),
                &temp.display().to_string(),
            ],
            None,
        )
        .await?;
        self.git("checkout", &["checkout", "-b", &branch], Some(&temp))
            .await?;

        let target = self.workspace_path(agent_id);
        atomic_replace(&target, &temp)?;
        info!(
            agent = agent_id,
            story = story_id,
            branch = %branch,
            path = %target.display(),
            "story workspace provisioned"
        );
        Ok(target)
    }

    /// Create or refresh the read-only PM workspace at the target branch tip.
    pub async fn refresh_pm_workspace(
        &self,
        target_branch: &str,
        mirror: &Path,
    ) -> Result<PathBuf, WorkspaceError> {
        let pm = self.pm_workspace_path();
        if !pm.exists() {
            let temp = self.temp_clone_path();
            if let Some(parent) = temp.parent() {
                std::fs::create_dir_all(parent).map_err(WorkspaceError::io(parent))?;
            }
            self.git(
                "clone",
                &[
                    "clone",
                    "--branch",
                    target_branch,
                    &mirror.display().to_string(),
                    &temp.display().to_string(),
                ],
                None,
            )
            .await?;
            atomic_replace(&pm, &temp)?;
            return Ok(pm);
        }

        self.git("fetch", &["fetch", "--all", "--prune"], Some(&pm))
            .await?;
        self.git(
            "reset",
            &["reset", "--hard", &format!("origin/{target_branch}")],
            Some(&pm),
        )
        .await?;
        debug!(branch = target_branch, "pm workspace refreshed");
        Ok(pm)
    }

    /// HEAD commit of a workspace.
    pub async fn current_commit(&self, workspace: &Path) -> Result<String, WorkspaceError> {
        let out = self
            .git("rev-parse", &["rev-parse", "HEAD"], Some(workspace))
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Paths changed between two commits.
    pub async fn changed_files(
        &self,
        workspace: &Path,
        from: &str,
        to: &str,
    ) -> Result<Vec<String>, WorkspaceError> {
        let range = format!("{from}..{to}");
        let out = self
            .git("diff", &["diff", "--name-only", &range], Some(workspace))
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Push the story branch to the upstream remote.
    pub async fn push_branch(
        &self,
        workspace: &Path,
        branch: &str,
    ) -> Result<(), WorkspaceError> {
        self.git(
            "push",
            &["push", "--set-upstream", "origin", branch],
            Some(workspace),
        )
        .await?;
        Ok(())
    }
}
