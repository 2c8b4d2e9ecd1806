//! Injectable subprocess seam.
//!
//! Every external-command wrapper (git, docker, compose) takes a
//! [`CommandRunner`] so tests can script outputs instead of spawning
//! processes. [`SystemRunner`] is the production implementation;
//! [`ScriptedRunner`] is the test double.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn err(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout and stderr joined, for condensed failure feedback.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    pub fn kind(&self) -> &'static str {
        "transient_io"
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ExecError>;
}

/// Spawns real subprocesses via tokio.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ExecError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        debug!(program, ?args, cwd = ?cwd, "exec");
        let output = cmd.output().await.map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Resolve a path to absolute form without requiring it to exist.
///
/// Container mounts must always receive absolute paths.
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::fs::canonicalize(path) {
        Ok(abs) => abs,
        Err(_) => std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf()),
    }
}

/// A scripted command entry: matched by prefix against the full command line.
struct ScriptEntry {
    prefix: String,
    output: CommandOutput,
}

/// Test double that replays scripted outputs and records every invocation.
///
/// Commands with no matching script entry succeed with empty output, which
/// keeps tolerant-teardown paths quiet in tests.
#[derive(Default)]
pub struct ScriptedRunner {
    entries: Mutex<Vec<ScriptEntry>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the output for the first future command line starting with
    /// `prefix` (program and args joined by spaces).
    pub fn expect(&self, prefix: impl Into<String>, output: CommandOutput) {
        self.entries.lock().unwrap().push(ScriptEntry {
            prefix: prefix.into(),
            output,
        });
    }

    /// Every command line this runner has executed, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn saw(&self, fragment: &str) -> bool {
        self.calls().iter().any(|c| c.contains(fragment))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        _cwd: Option<&Path>,
    ) -> Result<CommandOutput, ExecError> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(line.clone());

        let mut entries = self.entries.lock().unwrap();
        if let Some(pos) = entries.iter().position(|e| line.starts_with(&e.prefix)) {
            let entry = entries.remove(pos);
            return Ok(entry.output);
        }
        Ok(CommandOutput::ok(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_runner_matches_by_prefix_in_order() {
        let runner = ScriptedRunner::new();
        runner.expect("git fetch", CommandOutput::ok("fetched"));
        runner.expect("git fetch", CommandOutput::err(1, "network down"));

        let first = runner.run("git", &["fetch", "--all"], None).await.unwrap();
        assert!(first.success());
        let second = runner.run("git", &["fetch", "--all"], None).await.unwrap();
        assert_eq!(second.status, 1);

        // Unscripted commands succeed quietly.
        let other = runner.run("docker", &["ps"], None).await.unwrap();
        assert!(other.success());

        assert_eq!(runner.calls().len(), 3);
        assert!(runner.saw("git fetch --all"));
    }

    #[test]
    fn absolutize_keeps_absolute_paths() {
        let p = Path::new("/already/absolute");
        assert_eq!(absolutize(p), PathBuf::from("/already/absolute"));
    }

    #[test]
    fn combined_joins_streams() {
        let out = CommandOutput {
            status: 1,
            stdout: "built".into(),
            stderr: "warning".into(),
        };
        assert_eq!(out.combined(), "built\nwarning");
    }
}
