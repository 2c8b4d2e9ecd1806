//! Production [`Orchestrator`] binding: docker CLI for container lifecycle,
//! the pin singleton plus the project config file for pinned-image
//! persistence.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{pin, ActiveContainer, ImageRole, Orchestrator, PromotionError};
use crate::config::ProjectConfig;
use crate::container::{ContainerCli, ContainerSpec};

pub struct DockerOrchestrator {
    docker: ContainerCli,
    project_root: PathBuf,
    /// Command run inside a candidate to probe its health.
    health_cmd: Vec<String>,
    container_prefix: String,
}

impl DockerOrchestrator {
    pub fn new(docker: ContainerCli, project_root: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            project_root: project_root.into(),
            health_cmd: vec!["sh".into(), "-c".into(), "true".into()],
            container_prefix: "maestro-app".into(),
        }
    }

    pub fn with_health_cmd(mut self, cmd: Vec<String>) -> Self {
        if !cmd.is_empty() {
            self.health_cmd = cmd;
        }
        self
    }

    fn load_config(&self) -> ProjectConfig {
        ProjectConfig::load(&self.project_root).unwrap_or_default()
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn start_container(
        &self,
        role: ImageRole,
        image_id: &str,
    ) -> Result<ActiveContainer, PromotionError> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let name = format!("{}-{role}-{nanos}", self.container_prefix);
        let spec = ContainerSpec::new(image_id, name);
        let started = self
            .docker
            .start(&spec)
            .await
            .map_err(|e| PromotionError::StartFailed(e.to_string()))?;
        Ok(ActiveContainer {
            role,
            cid: started.cid,
            image_id: image_id.to_string(),
            name: started.name,
            started_at: Utc::now(),
        })
    }

    async fn stop_container(&self, cid: &str) -> Result<(), PromotionError> {
        self.docker
            .stop(cid)
            .await
            .map_err(|e| PromotionError::StartFailed(e.to_string()))?;
        self.docker
            .remove(cid)
            .await
            .map_err(|e| PromotionError::StartFailed(e.to_string()))
    }

    async fn health_check(&self, cid: &str) -> Result<(), PromotionError> {
        let cmd: Vec<&str> = self.health_cmd.iter().map(String::as_str).collect();
        self.docker
            .health_check(cid, &cmd)
            .await
            .map_err(|e| PromotionError::HealthCheckFailed(e.to_string()))
    }

    fn pinned_image(&self, role: ImageRole) -> Option<String> {
        pin::pinned_image(role).or_else(|| {
            let config = self.load_config();
            match role {
                ImageRole::Safe => config.pinned_safe_image,
                ImageRole::Target => config.pinned_target_image,
            }
        })
    }

    /// Persist the pin durably (config file) and in process (singleton).
    /// The file write is the commit point promotion rolls back on.
    fn write_pinned_image(
        &self,
        role: ImageRole,
        image_id: Option<&str>,
    ) -> Result<(), PromotionError> {
        let mut config = self.load_config();
        match role {
            ImageRole::Safe => config.pinned_safe_image = image_id.map(String::from),
            ImageRole::Target => config.pinned_target_image = image_id.map(String::from),
        }
        config
            .save(&self.project_root)
            .map_err(|e| PromotionError::PinWriteFailed(e.to_string()))?;
        pin::set_pinned_image(role, image_id.map(String::from));
        debug!(role = %role, image = ?image_id, "pinned image written");
        Ok(())
    }

    fn last_built_image(&self) -> Option<String> {
        pin::last_built_image().or_else(|| self.load_config().last_built_image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, ScriptedRunner};
    use crate::runtime::{switch_container, RuntimeState, SwitchStatus};
    use std::sync::Arc;

    #[tokio::test]
    async fn switch_through_docker_persists_the_pin() {
        let _guard = pin::test_guard();
        pin::reset_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.expect("docker run", CommandOutput::ok("cid-new\n"));

        let orc = DockerOrchestrator::new(ContainerCli::new(runner.clone()), dir.path());
        let state = RuntimeState::new();

        let report = switch_container(&orc, &state, ImageRole::Target, "sha256:v1").await;
        assert_eq!(report.status, SwitchStatus::Switched);

        // Durable and in-process pins agree with the running container.
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.pinned_target_image.as_deref(), Some("sha256:v1"));
        assert_eq!(
            pin::pinned_image(ImageRole::Target).as_deref(),
            Some("sha256:v1")
        );
        assert_eq!(state.active().unwrap().image_id, "sha256:v1");
        assert!(runner.saw("docker exec cid-new"));
        pin::reset_for_tests();
    }

    #[tokio::test]
    async fn failed_health_check_surfaces_kind() {
        let _guard = pin::test_guard();
        pin::reset_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.expect("docker run", CommandOutput::ok("cid-sick\n"));
        runner.expect(
            "docker exec cid-sick",
            CommandOutput::err(1, "connection refused"),
        );

        let orc = DockerOrchestrator::new(ContainerCli::new(runner.clone()), dir.path());
        let state = RuntimeState::new();

        let report = switch_container(&orc, &state, ImageRole::Target, "sha256:bad").await;
        assert_eq!(report.status, SwitchStatus::Failed);
        assert!(report
            .error
            .as_deref()
            .unwrap()
            .starts_with("health_check_failed"));
        // Candidate stopped, nothing pinned.
        assert!(runner.saw("docker stop cid-sick"));
        assert!(pin::pinned_image(ImageRole::Target).is_none());
        pin::reset_for_tests();
    }
}
