//! The git/GitHub merge collaborator.
//!
//! The architect resolves merge requests through this trait; the production
//! implementation shells out to git through the command-runner seam, and
//! tests script outcomes directly.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use orchestration::exec::CommandRunner;
use orchestration::messages::{MergeResponse, MergeStatus};
use tracing::{info, warn};

#[async_trait]
pub trait MergeGateway: Send + Sync {
    /// Merge the story branch into the target branch. Never errors at the
    /// type level: every failure mode is a [`MergeStatus`].
    async fn merge_story(
        &self,
        story_id: &str,
        branch: &str,
        pr_url: Option<&str>,
    ) -> MergeResponse;
}

fn merged(commit: String) -> MergeResponse {
    MergeResponse {
        status: MergeStatus::Merged,
        merge_commit: Some(commit),
        conflict_details: None,
        error_details: None,
    }
}

fn conflict(details: String) -> MergeResponse {
    MergeResponse {
        status: MergeStatus::Conflict,
        merge_commit: None,
        conflict_details: Some(details),
        error_details: None,
    }
}

fn failed(details: String) -> MergeResponse {
    MergeResponse {
        status: MergeStatus::Failed,
        merge_commit: None,
        conflict_details: None,
        error_details: Some(details),
    }
}

/// Merges via the git CLI inside a checkout of the target branch.
pub struct GitCliGateway {
    runner: Arc<dyn CommandRunner>,
    repo_dir: PathBuf,
    target_branch: String,
}

impl GitCliGateway {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        repo_dir: impl Into<PathBuf>,
        target_branch: impl Into<String>,
    ) -> Self {
        let mut target_branch = target_branch.into();
        if target_branch.is_empty() {
            target_branch = "main".into();
        }
        Self {
            runner,
            repo_dir: repo_dir.into(),
            target_branch,
        }
    }

    async fn git(&self, args: &[&str]) -> Result<orchestration::exec::CommandOutput, String> {
        self.runner
            .run("git", args, Some(&self.repo_dir))
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl MergeGateway for GitCliGateway {
    async fn merge_story(
        &self,
        story_id: &str,
        branch: &str,
        pr_url: Option<&str>,
    ) -> MergeResponse {
        info!(story = story_id, branch, pr_url = ?pr_url, "merging story branch");

        for prep in [
            vec!["fetch", "--all", "--prune"],
            vec!["checkout", self.target_branch.as_str()],
        ] {
            match self.git(&prep).await {
                Ok(out) if out.success() => {}
                Ok(out) => return failed(out.combined().trim().to_string()),
                Err(e) => return failed(e),
            }
        }

        let message = format!("merge story {story_id}");
        let merge = self
            .git(&[
                "merge",
                "--no-ff",
                &format!("origin/{branch}"),
                "-m",
                &message,
            ])
            .await;
        match merge {
            Ok(out) if out.success() => {}
            Ok(out) => {
                let detail = out.combined().trim().to_string();
                // Leave the tree clean for the next merge attempt.
                if let Ok(abort) = self.git(&["merge", "--abort"]).await {
                    if !abort.success() {
                        warn!(story = story_id, "merge --abort failed");
                    }
                }
                return if detail.contains("CONFLICT") {
                    conflict(detail)
                } else {
                    failed(detail)
                };
            }
            Err(e) => return failed(e),
        }

        match self.git(&["push", "origin", &self.target_branch]).await {
            Ok(out) if out.success() => {}
            Ok(out) => return failed(out.combined().trim().to_string()),
            Err(e) => return failed(e),
        }

        match self.git(&["rev-parse", "HEAD"]).await {
            Ok(out) if out.success() => merged(out.stdout.trim().to_string()),
            Ok(out) => failed(out.combined().trim().to_string()),
            Err(e) => failed(e),
        }
    }
}

/// Replays scripted merge outcomes; defaults to `merged` when empty.
#[derive(Default)]
pub struct ScriptedGateway {
    outcomes: Mutex<VecDeque<MergeResponse>>,
    pub requests: Mutex<Vec<(String, String)>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: MergeResponse) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn push_conflict(&self, details: &str) {
        self.push(conflict(details.to_string()));
    }

    pub fn push_failed(&self, details: &str) {
        self.push(failed(details.to_string()));
    }
}

#[async_trait]
impl MergeGateway for ScriptedGateway {
    async fn merge_story(
        &self,
        story_id: &str,
        branch: &str,
        _pr_url: Option<&str>,
    ) -> MergeResponse {
        self.requests
            .lock()
            .unwrap()
            .push((story_id.to_string(), branch.to_string()));
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| merged(format!("commit-for-{story_id}")))
    }
}
