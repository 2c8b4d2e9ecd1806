//! Demo subsystem: run the produced artifact and discover its exposure.
//!
//! Three modes, chosen by what the project ships:
//! - **compose-only** — a service is labeled `maestro.app=true`; compose
//!   brings everything up and the labeled service's first port mapping seeds
//!   the public port.
//! - **hybrid** — a compose file exists but nothing is labeled; compose runs
//!   dependencies with host-port bindings stripped, and the app joins the
//!   compose-default network as a separate container.
//! - **container-only** — no compose file; the app runs alone on a dedicated
//!   user-defined network.
//!
//! In the hybrid and container-only modes the app's port is discovered from
//! `/proc/net/tcp{,6}` inside the container, then the container is restarted
//! with `-p 127.0.0.1::<port>` and probed.

pub mod compose;
pub mod ports;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_yaml::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ProjectConfig;
use crate::container::{ComposeCli, ContainerCli, ContainerError, ContainerSpec};
use crate::runtime::{ComposeStack, RuntimeRegistry, TrackedContainer};

pub use compose::{detect_change, find_labeled_app, parse_port_mapping, ChangeKind};
pub use ports::{select_main_port, ListenSocket, PREFERRED_PORTS};

/// Dedicated network for container-only mode.
pub const DEMO_NETWORK: &str = "demo-network";
/// Compose project name for demo stacks.
pub const DEMO_PROJECT: &str = "demo";
/// App container name.
pub const DEMO_CONTAINER: &str = "maestro-demo";
/// Fallback container port when discovery finds nothing.
pub const DEFAULT_DEMO_PORT: u16 = 8081;
/// Host-port probe deadline.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("compose file unreadable at {path}: {detail}")]
    ComposeUnreadable { path: PathBuf, detail: String },

    #[error("application binds loopback only ({bind_addr}); not reachable from the host")]
    LoopbackOnly { bind_addr: String },

    #[error("no listening sockets discovered in the demo container")]
    NothingListening,

    #[error("host port probe failed on 127.0.0.1:{host_port}")]
    ProbeFailed { host_port: u16 },

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl DemoError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoopbackOnly { .. } => "loopback_only",
            Self::NothingListening | Self::ProbeFailed { .. } => "health_check_failed",
            Self::ComposeUnreadable { .. } => "validation",
            Self::Container(_) => "transient_io",
            Self::Config(e) => e.kind(),
        }
    }
}

/// How the demo was brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoMode {
    ComposeOnly,
    Hybrid,
    ContainerOnly,
}

impl std::fmt::Display for DemoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ComposeOnly => write!(f, "compose_only"),
            Self::Hybrid => write!(f, "hybrid"),
            Self::ContainerOnly => write!(f, "container_only"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DemoReport {
    pub mode: DemoMode,
    pub container_port: Option<u16>,
    pub host_port: Option<u16>,
    pub detected_ports: Vec<u16>,
}

/// Compose file names probed in the project root, in order.
const COMPOSE_CANDIDATES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

pub fn find_compose_file(project_dir: &Path) -> Option<PathBuf> {
    COMPOSE_CANDIDATES
        .iter()
        .map(|name| project_dir.join(name))
        .find(|p| p.exists())
}

pub struct DemoRunner {
    docker: ContainerCli,
    compose: ComposeCli,
    project_root: PathBuf,
    /// Explicit user port choice for this run, highest priority.
    pub user_port_override: Option<u16>,
}

impl DemoRunner {
    pub fn new(docker: ContainerCli, compose: ComposeCli, project_root: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            compose,
            project_root: project_root.into(),
            user_port_override: None,
        }
    }

    fn load_compose(&self, path: &Path) -> Result<Value, DemoError> {
        let raw = std::fs::read_to_string(path).map_err(|e| DemoError::ComposeUnreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        serde_yaml::from_str(&raw).map_err(|e| DemoError::ComposeUnreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Bring the demo up and report its exposure. Containers and stacks are
    /// registered so kernel shutdown tears them down.
    pub async fn start(
        &self,
        image: &str,
        registry: &RuntimeRegistry,
    ) -> Result<DemoReport, DemoError> {
        match find_compose_file(&self.project_root) {
            Some(compose_path) => {
                let doc = self.load_compose(&compose_path)?;
                match find_labeled_app(&doc) {
                    Some((service, seed_port)) => {
                        self.start_compose_only(&compose_path, &service, seed_port, registry)
                            .await
                    }
                    None => {
                        self.start_hybrid(&compose_path, &doc, image, registry)
                            .await
                    }
                }
            }
            None => self.start_container_only(image, registry).await,
        }
    }

    async fn start_compose_only(
        &self,
        compose_path: &Path,
        service: &str,
        seed_port: Option<u16>,
        registry: &RuntimeRegistry,
    ) -> Result<DemoReport, DemoError> {
        let file = compose_path.display().to_string();
        self.compose.up(DEMO_PROJECT, &file).await?;
        registry.register_stack(ComposeStack {
            project_name: DEMO_PROJECT.to_string(),
            compose_file: file,
            network: format!("{DEMO_PROJECT}_default"),
            started_at: chrono::Utc::now(),
        });
        info!(service, port = ?seed_port, "compose-only demo up");

        Ok(DemoReport {
            mode: DemoMode::ComposeOnly,
            container_port: seed_port.filter(|p| *p != 0),
            host_port: seed_port.filter(|p| *p != 0),
            detected_ports: Vec::new(),
        })
    }

    async fn start_hybrid(
        &self,
        compose_path: &Path,
        doc: &Value,
        image: &str,
        registry: &RuntimeRegistry,
    ) -> Result<DemoReport, DemoError> {
        // Dependencies come up with host ports stripped to avoid conflicts.
        let stripped = compose::strip_host_ports(doc);
        let rendered_dir = self.project_root.join(".maestro");
        std::fs::create_dir_all(&rendered_dir).map_err(|e| DemoError::ComposeUnreadable {
            path: rendered_dir.clone(),
            detail: e.to_string(),
        })?;
        let rendered = rendered_dir.join("compose.rendered.yml");
        let body = serde_yaml::to_string(&stripped).map_err(|e| DemoError::ComposeUnreadable {
            path: compose_path.to_path_buf(),
            detail: e.to_string(),
        })?;
        std::fs::write(&rendered, body).map_err(|e| DemoError::ComposeUnreadable {
            path: rendered.clone(),
            detail: e.to_string(),
        })?;

        let rendered_str = rendered.display().to_string();
        self.compose.up(DEMO_PROJECT, &rendered_str).await?;
        registry.register_stack(ComposeStack {
            project_name: DEMO_PROJECT.to_string(),
            compose_file: rendered_str,
            network: format!("{DEMO_PROJECT}_default"),
            started_at: chrono::Utc::now(),
        });

        let network = format!("{DEMO_PROJECT}_default");
        self.run_app_with_discovery(image, Some(network), DemoMode::Hybrid, registry)
            .await
    }

    async fn start_container_only(
        &self,
        image: &str,
        registry: &RuntimeRegistry,
    ) -> Result<DemoReport, DemoError> {
        self.docker.create_network(DEMO_NETWORK).await?;
        self.run_app_with_discovery(
            image,
            Some(DEMO_NETWORK.to_string()),
            DemoMode::ContainerOnly,
            registry,
        )
        .await
    }

    /// Start the app, discover its listening ports, restart it published on
    /// the selected port, probe, and persist the result.
    async fn run_app_with_discovery(
        &self,
        image: &str,
        network: Option<String>,
        mode: DemoMode,
        registry: &RuntimeRegistry,
    ) -> Result<DemoReport, DemoError> {
        let mut config = ProjectConfig::load(&self.project_root)?;
        let run_cmd: Vec<String> = config
            .demo
            .run_cmd_override
            .as_deref()
            .map(|cmd| cmd.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        // First start: no mapping, or the cached port from a previous
        // successful run.
        let mut spec = ContainerSpec::new(image, DEMO_CONTAINER);
        spec.cmd = run_cmd.clone();
        if let Some(net) = &network {
            spec = spec.on_network(net.clone());
        }
        let cached = config.demo.selected_container_port;
        if let Some(port) = cached {
            spec = spec.publish(format!("127.0.0.1::{port}"));
        }
        self.docker.remove(DEMO_CONTAINER).await?;
        let started = self.docker.start(&spec).await?;
        registry.register_container(TrackedContainer {
            cid: started.cid.clone(),
            name: started.name.clone(),
            network: (mode == DemoMode::ContainerOnly).then(|| DEMO_NETWORK.to_string()),
            started_at: chrono::Utc::now(),
        });

        let sockets = self.discover_listen_sockets(&started.cid).await?;
        let detected: Vec<u16> = sockets.iter().map(|s| s.port).collect();
        if sockets.is_empty() {
            warn!(container = DEMO_CONTAINER, "nothing listening; using fallback port");
        }

        let exposed = self.docker.image_exposed_ports(image).await.unwrap_or_default();
        let reachable: Vec<u16> = sockets
            .iter()
            .filter(|s| !s.loopback_only)
            .map(|s| s.port)
            .collect();

        let selected = select_main_port(
            &reachable,
            &exposed,
            self.user_port_override,
            config.demo.container_port_override,
        );

        let selected = match selected {
            Some(port) => port,
            None => {
                // Everything that listens is loopback-bound: reachable is
                // empty but detected is not. Surface the diagnostic naming
                // the bind address; nothing is persisted.
                if let Some(lo) = sockets.iter().find(|s| s.loopback_only) {
                    return Err(DemoError::LoopbackOnly {
                        bind_addr: format!("{}:{}", lo.addr, lo.port),
                    });
                }
                if detected.is_empty() && cached.is_none() {
                    DEFAULT_DEMO_PORT
                } else {
                    return Err(DemoError::NothingListening);
                }
            }
        };

        // Restart published on the selected port.
        self.docker.remove(&started.cid).await?;
        registry.unregister_container(&started.cid);
        let mut spec = ContainerSpec::new(image, DEMO_CONTAINER)
            .publish(format!("127.0.0.1::{selected}"));
        spec.cmd = run_cmd;
        if let Some(net) = &network {
            spec = spec.on_network(net.clone());
        }
        let republished = self.docker.start(&spec).await?;
        registry.register_container(TrackedContainer {
            cid: republished.cid.clone(),
            name: republished.name.clone(),
            network: (mode == DemoMode::ContainerOnly).then(|| DEMO_NETWORK.to_string()),
            started_at: chrono::Utc::now(),
        });

        let mappings = self.docker.port_mappings(DEMO_CONTAINER).await?;
        let host_port = mappings
            .iter()
            .find(|m| m.container_port == selected)
            .map(|m| m.host_port);

        if let Some(port) = host_port {
            if !ports::probe_tcp(port, PROBE_TIMEOUT).await {
                return Err(DemoError::ProbeFailed { host_port: port });
            }
        }

        config.demo.detected_ports = detected.clone();
        config.demo.selected_container_port = Some(selected);
        config.demo.last_assigned_host_port = host_port;
        config.save(&self.project_root)?;

        info!(
            mode = %mode,
            container_port = selected,
            host_port = ?host_port,
            "demo container up"
        );
        Ok(DemoReport {
            mode,
            container_port: Some(selected),
            host_port,
            detected_ports: detected,
        })
    }

    async fn discover_listen_sockets(&self, cid: &str) -> Result<Vec<ListenSocket>, DemoError> {
        let v4 = self
            .docker
            .exec_capture(cid, &["cat", "/proc/net/tcp"])
            .await?;
        let v6 = self
            .docker
            .exec_capture(cid, &["cat", "/proc/net/tcp6"])
            .await
            .map(|out| out.stdout)
            .unwrap_or_default();

        Ok(ports::merge_listen_sets(
            ports::parse_proc_net_tcp(&v4.stdout),
            ports::parse_proc_net_tcp(&v6),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, ScriptedRunner};
    use std::sync::Arc;

    const TCP_8080_ANY: &str = "\
header
   0: 00000000:1F90 00000000:0000 0A
";
    const TCP_8080_LOOPBACK: &str = "\
header
   0: 0100007F:1F90 00000000:0000 0A
";

    fn runner_and_cli() -> (Arc<ScriptedRunner>, ContainerCli, ComposeCli) {
        let runner = Arc::new(ScriptedRunner::new());
        (
            runner.clone(),
            ContainerCli::new(runner.clone()),
            ComposeCli::new(runner),
        )
    }

    #[tokio::test]
    async fn container_only_discovers_and_republishes_port() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RuntimeRegistry::new();

        // A live listener stands in for the republished container so the
        // probe succeeds.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();

        let (runner, docker, compose) = runner_and_cli();
        runner.expect("docker run", CommandOutput::ok("cid-first\n"));
        runner.expect(
            "docker exec cid-first cat /proc/net/tcp6",
            CommandOutput::ok(""),
        );
        runner.expect(
            "docker exec cid-first cat /proc/net/tcp",
            CommandOutput::ok(TCP_8080_ANY),
        );
        runner.expect("docker inspect", CommandOutput::ok(r#"{"8080/tcp":{}}"#));
        runner.expect("docker run", CommandOutput::ok("cid-second\n"));
        runner.expect(
            "docker port maestro-demo",
            CommandOutput::ok(format!("8080/tcp -> 127.0.0.1:{live_port}\n")),
        );

        let demo = DemoRunner::new(docker, compose, dir.path());
        let report = demo.start("app:latest", &registry).await.unwrap();

        assert_eq!(report.mode, DemoMode::ContainerOnly);
        assert_eq!(report.container_port, Some(8080));
        assert_eq!(report.host_port, Some(live_port));
        assert_eq!(report.detected_ports, vec![8080]);

        // Discovery created the demo network and republished with a
        // loopback host binding.
        assert!(runner.saw("docker network create demo-network"));
        assert!(runner.saw("-p 127.0.0.1::8080"));
        assert!(registry.exists("cid-second"));
        assert!(!registry.exists("cid-first"));

        // The result is persisted for reuse.
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.demo.selected_container_port, Some(8080));
        assert_eq!(config.demo.last_assigned_host_port, Some(live_port));
        assert_eq!(config.demo.detected_ports, vec![8080]);
    }

    #[tokio::test]
    async fn loopback_only_bind_is_a_diagnostic_not_a_port() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, docker, compose) = runner_and_cli();
        let registry = RuntimeRegistry::new();

        runner.expect("docker run", CommandOutput::ok("cid-lo\n"));
        runner.expect(
            "docker exec cid-lo cat /proc/net/tcp6",
            CommandOutput::ok(""),
        );
        runner.expect(
            "docker exec cid-lo cat /proc/net/tcp",
            CommandOutput::ok(TCP_8080_LOOPBACK),
        );

        let demo = DemoRunner::new(docker, compose, dir.path());
        let err = demo.start("app:latest", &registry).await.unwrap_err();

        assert_eq!(err.kind(), "loopback_only");
        assert!(err.to_string().contains("127.0.0.1:8080"));
        // Nothing persisted after the diagnostic.
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert!(config.demo.selected_container_port.is_none());
        assert!(config.demo.last_assigned_host_port.is_none());
    }

    #[tokio::test]
    async fn compose_only_uses_labeled_service_port() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("docker-compose.yml"),
            r#"
services:
  app:
    image: acme/app
    labels:
      - maestro.app=true
    ports:
      - "8081:8080"
"#,
        )
        .unwrap();

        let (runner, docker, compose) = runner_and_cli();
        let registry = RuntimeRegistry::new();
        let demo = DemoRunner::new(docker, compose, dir.path());

        let report = demo.start("app:latest", &registry).await.unwrap();
        assert_eq!(report.mode, DemoMode::ComposeOnly);
        assert_eq!(report.host_port, Some(8081));
        assert!(runner.saw("compose -p demo"));
        assert!(registry.exists(DEMO_PROJECT));
    }

    #[tokio::test]
    async fn hybrid_strips_host_ports_for_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("docker-compose.yml"),
            r#"
services:
  db:
    image: postgres:16
    ports:
      - "5432:5432"
"#,
        )
        .unwrap();

        let (runner, docker, compose) = runner_and_cli();
        let registry = RuntimeRegistry::new();

        runner.expect("docker run", CommandOutput::ok("cid-app\n"));
        runner.expect(
            "docker exec cid-app cat /proc/net/tcp6",
            CommandOutput::ok(""),
        );
        runner.expect(
            "docker exec cid-app cat /proc/net/tcp",
            CommandOutput::ok(TCP_8080_ANY),
        );
        runner.expect("docker inspect", CommandOutput::ok("null"));
        runner.expect("docker run", CommandOutput::ok("cid-app2\n"));
        runner.expect("docker port maestro-demo", CommandOutput::ok(""));

        let demo = DemoRunner::new(docker, compose, dir.path());
        let report = demo.start("app:latest", &registry).await.unwrap();

        assert_eq!(report.mode, DemoMode::Hybrid);
        assert_eq!(report.container_port, Some(8080));
        // No host mapping reported by docker port: no probe, no host port.
        assert!(report.host_port.is_none());

        // The rendered file exists and lost the published port.
        let rendered =
            std::fs::read_to_string(dir.path().join(".maestro/compose.rendered.yml")).unwrap();
        assert!(rendered.contains("'5432'") || rendered.contains("\"5432\"") || rendered.contains("- 5432"));
        assert!(!rendered.contains("5432:5432"));
        // The app joined the compose-default network.
        assert!(runner.saw("--network demo_default"));
    }
}
