//! Docker CLI wrapper.
//!
//! All invocations go through the injectable [`CommandRunner`]. Destructive
//! operations treat "already gone" answers from the daemon ("No such
//! container", "no such network", "is not connected") as success so teardown
//! paths stay idempotent.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::exec::{absolutize, CommandOutput, CommandRunner, ExecError};

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("docker {operation} failed: {stderr}")]
    CommandFailed { operation: String, stderr: String },

    #[error("health check failed for {cid}: {detail}")]
    HealthCheckFailed { cid: String, detail: String },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl ContainerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HealthCheckFailed { .. } => "health_check_failed",
            _ => "transient_io",
        }
    }
}

/// Stderr fragments that make a destructive operation a no-op.
const TOLERATED: &[&str] = &[
    "No such container",
    "no such container",
    "no such network",
    "No such network",
    "is not connected",
    "not found",
    "no configuration file",
];

fn tolerated(stderr: &str) -> bool {
    TOLERATED.iter().any(|frag| stderr.contains(frag))
}

/// What to run; mounts are made absolute before reaching the daemon.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub network: Option<String>,
    /// `-p` arguments, e.g. `127.0.0.1::8080`.
    pub publish: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// (host path, container path)
    pub mounts: Vec<(PathBuf, String)>,
    pub cmd: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn on_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn publish(mut self, mapping: impl Into<String>) -> Self {
        self.publish.push(mapping.into());
        self
    }

    pub fn mount(mut self, host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        self.mounts.push((host.into(), container.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedContainer {
    pub cid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_ip: String,
    pub host_port: u16,
}

/// Thin typed facade over the `docker` binary.
#[derive(Clone)]
pub struct ContainerCli {
    runner: Arc<dyn CommandRunner>,
}

impl ContainerCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn docker(&self, args: &[&str]) -> Result<CommandOutput, ContainerError> {
        Ok(self.runner.run("docker", args, None).await?)
    }

    fn fail(operation: &str, out: &CommandOutput) -> ContainerError {
        ContainerError::CommandFailed {
            operation: operation.to_string(),
            stderr: out.combined().trim().to_string(),
        }
    }

    /// `docker run -d` — returns the container id printed on stdout.
    pub async fn start(&self, spec: &ContainerSpec) -> Result<StartedContainer, ContainerError> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
        ];
        if let Some(network) = &spec.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        for mapping in &spec.publish {
            args.push("-p".into());
            args.push(mapping.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for (host, container) in &spec.mounts {
            let abs = absolutize(host);
            args.push("-v".into());
            args.push(format!("{}:{container}", abs.display()));
        }
        args.push(spec.image.clone());
        args.extend(spec.cmd.iter().cloned());

        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.docker(&borrowed).await?;
        if !out.success() {
            return Err(Self::fail("run", &out));
        }
        let cid = out.stdout.trim().to_string();
        debug!(name = %spec.name, image = %spec.image, cid = %cid, "container started");
        Ok(StartedContainer {
            cid,
            name: spec.name.clone(),
        })
    }

    pub async fn stop(&self, name_or_cid: &str) -> Result<(), ContainerError> {
        let out = self.docker(&["stop", name_or_cid]).await?;
        if !out.success() && !tolerated(&out.stderr) {
            return Err(Self::fail("stop", &out));
        }
        Ok(())
    }

    /// `docker rm -f`; gone containers are a no-op.
    pub async fn remove(&self, name_or_cid: &str) -> Result<(), ContainerError> {
        let out = self.docker(&["rm", "-f", name_or_cid]).await?;
        if !out.success() && !tolerated(&out.stderr) {
            return Err(Self::fail("rm", &out));
        }
        Ok(())
    }

    /// Run a command inside the container and capture its output.
    pub async fn exec_capture(
        &self,
        cid: &str,
        cmd: &[&str],
    ) -> Result<CommandOutput, ContainerError> {
        let mut args = vec!["exec", cid];
        args.extend_from_slice(cmd);
        self.docker(&args).await
    }

    /// Run the health command inside the candidate; nonzero exit fails.
    pub async fn health_check(&self, cid: &str, cmd: &[&str]) -> Result<(), ContainerError> {
        let out = self.exec_capture(cid, cmd).await?;
        if !out.success() {
            return Err(ContainerError::HealthCheckFailed {
                cid: cid.to_string(),
                detail: out.combined().trim().to_string(),
            });
        }
        Ok(())
    }

    /// Ports declared via `EXPOSE` in the image, e.g. `[8080, 9090]`.
    pub async fn image_exposed_ports(&self, image: &str) -> Result<Vec<u16>, ContainerError> {
        let out = self
            .docker(&[
                "inspect",
                "--format",
                "{{json .Config.ExposedPorts}}",
                image,
            ])
            .await?;
        if !out.success() {
            return Err(Self::fail("inspect", &out));
        }
        let raw = out.stdout.trim();
        if raw.is_empty() || raw == "null" {
            return Ok(Vec::new());
        }
        let map: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(raw).unwrap_or_default();
        let mut ports: Vec<u16> = map
            .keys()
            .filter_map(|key| key.split('/').next()?.parse().ok())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        Ok(ports)
    }

    /// `docker port <name>` output, parsed.
    pub async fn port_mappings(&self, name: &str) -> Result<Vec<PortMapping>, ContainerError> {
        let out = self.docker(&["port", name]).await?;
        if !out.success() {
            return Err(Self::fail("port", &out));
        }
        Ok(crate::demo::ports::parse_docker_port_output(&out.stdout))
    }

    pub async fn create_network(&self, name: &str) -> Result<(), ContainerError> {
        let out = self.docker(&["network", "create", name]).await?;
        if !out.success() && !out.stderr.contains("already exists") {
            return Err(Self::fail("network create", &out));
        }
        Ok(())
    }

    pub async fn remove_network(&self, name: &str) -> Result<(), ContainerError> {
        let out = self.docker(&["network", "rm", name]).await?;
        if !out.success() && !tolerated(&out.stderr) {
            return Err(Self::fail("network rm", &out));
        }
        Ok(())
    }

    pub async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), ContainerError> {
        let out = self
            .docker(&["network", "disconnect", network, container])
            .await?;
        if !out.success() && !tolerated(&out.stderr) {
            return Err(Self::fail("network disconnect", &out));
        }
        Ok(())
    }
}

/// `docker compose` facade.
#[derive(Clone)]
pub struct ComposeCli {
    runner: Arc<dyn CommandRunner>,
}

impl ComposeCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn up(&self, project: &str, compose_file: &str) -> Result<(), ContainerError> {
        let out = self
            .runner
            .run(
                "docker",
                &["compose", "-p", project, "-f", compose_file, "up", "-d"],
                None,
            )
            .await?;
        if !out.success() {
            return Err(ContainerError::CommandFailed {
                operation: "compose up".into(),
                stderr: out.combined().trim().to_string(),
            });
        }
        Ok(())
    }

    /// `compose down`; a missing configuration file is a no-op.
    pub async fn down(&self, project: &str, compose_file: &str) -> Result<(), ContainerError> {
        let out = self
            .runner
            .run(
                "docker",
                &[
                    "compose",
                    "-p",
                    project,
                    "-f",
                    compose_file,
                    "down",
                    "--remove-orphans",
                ],
                None,
            )
            .await?;
        if !out.success() && !tolerated(&out.stderr) {
            return Err(ContainerError::CommandFailed {
                operation: "compose down".into(),
                stderr: out.combined().trim().to_string(),
            });
        }
        if !out.success() {
            warn!(project, "compose down tolerated: {}", out.stderr.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ScriptedRunner;

    fn cli() -> (Arc<ScriptedRunner>, ContainerCli) {
        let runner = Arc::new(ScriptedRunner::new());
        (runner.clone(), ContainerCli::new(runner))
    }

    #[tokio::test]
    async fn start_builds_full_command_line() {
        let (runner, cli) = cli();
        runner.expect("docker run", CommandOutput::ok("abc123\n"));

        let spec = ContainerSpec::new("app:latest", "maestro-demo")
            .on_network("demo-network")
            .publish("127.0.0.1::8080")
            .mount("/work/story-1", "/workspace");
        let started = cli.start(&spec).await.unwrap();

        assert_eq!(started.cid, "abc123");
        let line = &runner.calls()[0];
        assert!(line.contains("--name maestro-demo"));
        assert!(line.contains("--network demo-network"));
        assert!(line.contains("-p 127.0.0.1::8080"));
        assert!(line.contains("-v /work/story-1:/workspace"));
        assert!(line.ends_with("app:latest"));
    }

    #[tokio::test]
    async fn destructive_ops_tolerate_missing_resources() {
        let (runner, cli) = cli();
        runner.expect(
            "docker rm -f gone",
            CommandOutput::err(1, "Error: No such container: gone"),
        );
        runner.expect(
            "docker network rm demo-network",
            CommandOutput::err(1, "Error: no such network: demo-network"),
        );
        runner.expect(
            "docker network disconnect",
            CommandOutput::err(1, "container x is not connected to network y"),
        );

        cli.remove("gone").await.unwrap();
        cli.remove_network("demo-network").await.unwrap();
        cli.disconnect_network("demo-network", "x").await.unwrap();
    }

    #[tokio::test]
    async fn stop_surfaces_real_failures() {
        let (runner, cli) = cli();
        runner.expect(
            "docker stop wedged",
            CommandOutput::err(1, "cannot stop: permission denied"),
        );
        let err = cli.stop("wedged").await.unwrap_err();
        assert_eq!(err.kind(), "transient_io");
    }

    #[tokio::test]
    async fn health_check_maps_nonzero_exit() {
        let (runner, cli) = cli();
        runner.expect(
            "docker exec abc curl",
            CommandOutput::err(7, "connection refused"),
        );
        let err = cli
            .health_check("abc", &["curl", "-sf", "localhost:8080/health"])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "health_check_failed");
    }

    #[tokio::test]
    async fn exposed_ports_parse_and_sort() {
        let (runner, cli) = cli();
        runner.expect(
            "docker inspect",
            CommandOutput::ok(r#"{"8080/tcp":{},"443/tcp":{},"53/udp":{}}"#),
        );
        let ports = cli.image_exposed_ports("app:latest").await.unwrap();
        assert_eq!(ports, vec![53, 443, 8080]);

        runner.expect("docker inspect", CommandOutput::ok("null\n"));
        assert!(cli.image_exposed_ports("bare:latest").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compose_down_tolerates_missing_config() {
        let runner = Arc::new(ScriptedRunner::new());
        let compose = ComposeCli::new(runner.clone());
        runner.expect(
            "docker compose -p demo",
            CommandOutput::err(14, "no configuration file provided: not found"),
        );
        compose.down("demo", "docker-compose.yml").await.unwrap();
    }
}
