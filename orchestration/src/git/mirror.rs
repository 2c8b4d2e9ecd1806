//! Bare mirror clones shared by every workspace of a project.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::WorkspaceError;
use crate::exec::CommandRunner;

/// Directory under the project root holding bare mirrors.
pub const MIRRORS_DIR: &str = ".mirrors";

pub struct MirrorManager {
    runner: Arc<dyn CommandRunner>,
    project_root: PathBuf,
}

impl MirrorManager {
    pub fn new(runner: Arc<dyn CommandRunner>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            project_root: project_root.into(),
        }
    }

    /// `<project>/.mirrors/<repo>.git`
    pub fn mirror_path(&self, repo_name: &str) -> PathBuf {
        self.project_root
            .join(MIRRORS_DIR)
            .join(format!("{repo_name}.git"))
    }

    /// Clone the mirror if absent, then return its path.
    pub async fn ensure_mirror(
        &self,
        repo_url: &str,
        repo_name: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = self.mirror_path(repo_name);
        if path.exists() {
            debug!(mirror = %path.display(), "mirror present");
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WorkspaceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let out = self
            .runner
            .run(
                "git",
                &["clone", "--mirror", repo_url, &path.display().to_string()],
                None,
            )
            .await?;
        if !out.success() {
            return Err(WorkspaceError::GitFailed {
                operation: "clone --mirror".into(),
                stderr: out.combined().trim().to_string(),
            });
        }
        info!(repo = repo_url, mirror = %path.display(), "mirror cloned");
        Ok(path)
    }

    /// `git fetch --all --prune` against the mirror.
    pub async fn refresh(&self, mirror: &Path) -> Result<(), WorkspaceError> {
        let out = self
            .runner
            .run("git", &["fetch", "--all", "--prune"], Some(mirror))
            .await?;
        if !out.success() {
            return Err(WorkspaceError::GitFailed {
                operation: "fetch".into(),
                stderr: out.combined().trim().to_string(),
            });
        }
        debug!(mirror = %mirror.display(), "mirror refreshed");
        Ok(())
    }
}
