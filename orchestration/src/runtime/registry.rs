//! Registry of containers and compose stacks this process created, so
//! shutdown can tear down exactly what it started.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::container::{ComposeCli, ContainerCli};

/// A container the kernel is responsible for removing at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedContainer {
    pub cid: String,
    pub name: String,
    pub network: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A compose project the kernel brought up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeStack {
    pub project_name: String,
    pub compose_file: String,
    pub network: String,
    pub started_at: DateTime<Utc>,
}

/// One teardown failure; teardown never short-circuits.
#[derive(Debug, Clone)]
pub struct CleanupFailure {
    pub entity: String,
    pub error: String,
}

/// Thread-safe mappings keyed by container id and project name. Getters
/// return clones; mutating a result never touches the registry.
#[derive(Default)]
pub struct RuntimeRegistry {
    containers: RwLock<HashMap<String, TrackedContainer>>,
    stacks: RwLock<HashMap<String, ComposeStack>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_container(&self, container: TrackedContainer) {
        if container.cid.is_empty() {
            warn!("ignoring container registration with empty cid");
            return;
        }
        self.containers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(container.cid.clone(), container);
    }

    pub fn unregister_container(&self, cid: &str) -> Option<TrackedContainer> {
        self.containers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(cid)
    }

    pub fn get_container(&self, cid: &str) -> Option<TrackedContainer> {
        self.containers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cid)
            .cloned()
    }

    pub fn register_stack(&self, stack: ComposeStack) {
        if stack.project_name.is_empty() {
            warn!("ignoring stack registration with empty project name");
            return;
        }
        self.stacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stack.project_name.clone(), stack);
    }

    pub fn unregister_stack(&self, project_name: &str) -> Option<ComposeStack> {
        self.stacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(project_name)
    }

    pub fn get_stack(&self, project_name: &str) -> Option<ComposeStack> {
        self.stacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(project_name)
            .cloned()
    }

    pub fn all_containers(&self) -> Vec<TrackedContainer> {
        let mut all: Vec<TrackedContainer> = self
            .containers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.cid.cmp(&b.cid));
        all
    }

    pub fn all_stacks(&self) -> Vec<ComposeStack> {
        let mut all: Vec<ComposeStack> = self
            .stacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.project_name.cmp(&b.project_name));
        all
    }

    pub fn count(&self) -> usize {
        self.containers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
            + self.stacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.containers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
            || self
                .stacks
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(key)
    }

    /// Tear down every registered container and stack. Failures are
    /// collected; one bad entity never aborts the rest. Entities that tear
    /// down cleanly (or were already gone) are unregistered.
    pub async fn cleanup(
        &self,
        docker: &ContainerCli,
        compose: &ComposeCli,
    ) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();

        for container in self.all_containers() {
            match docker.remove(&container.cid).await {
                Ok(()) => {
                    if let Some(network) = &container.network {
                        if let Err(e) = docker.remove_network(network).await {
                            warn!(network, error = %e, "network teardown failed");
                            failures.push(CleanupFailure {
                                entity: format!("network {network}"),
                                error: e.to_string(),
                            });
                        }
                    }
                    self.unregister_container(&container.cid);
                    info!(cid = %container.cid, name = %container.name, "container removed");
                }
                Err(e) => {
                    warn!(cid = %container.cid, error = %e, "container teardown failed");
                    failures.push(CleanupFailure {
                        entity: format!("container {}", container.cid),
                        error: e.to_string(),
                    });
                }
            }
        }

        for stack in self.all_stacks() {
            match compose.down(&stack.project_name, &stack.compose_file).await {
                Ok(()) => {
                    self.unregister_stack(&stack.project_name);
                    info!(project = %stack.project_name, "compose stack down");
                }
                Err(e) => {
                    warn!(project = %stack.project_name, error = %e, "stack teardown failed");
                    failures.push(CleanupFailure {
                        entity: format!("stack {}", stack.project_name),
                        error: e.to_string(),
                    });
                }
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, ScriptedRunner};
    use std::sync::Arc;

    fn container(cid: &str) -> TrackedContainer {
        TrackedContainer {
            cid: cid.into(),
            name: format!("app-{cid}"),
            network: None,
            started_at: Utc::now(),
        }
    }

    fn stack(project: &str) -> ComposeStack {
        ComposeStack {
            project_name: project.into(),
            compose_file: "docker-compose.yml".into(),
            network: format!("{project}_default"),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn register_and_query() {
        let registry = RuntimeRegistry::new();
        registry.register_container(container("c1"));
        registry.register_stack(stack("demo"));

        assert!(registry.exists("c1"));
        assert!(registry.exists("demo"));
        assert!(!registry.exists("nope"));
        assert_eq!(registry.count(), 2);

        // Empty keys are no-ops.
        registry.register_container(container(""));
        let mut empty_stack = stack("demo2");
        empty_stack.project_name.clear();
        registry.register_stack(empty_stack);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn results_are_copies() {
        let registry = RuntimeRegistry::new();
        registry.register_container(container("c1"));

        let mut all = registry.all_containers();
        all[0].name = "tampered".into();
        assert_eq!(registry.get_container("c1").unwrap().name, "app-c1");
    }

    #[tokio::test]
    async fn cleanup_collects_errors_and_continues() {
        let runner = Arc::new(ScriptedRunner::new());
        // c-bad refuses to die with a non-tolerated error; everything else
        // tears down fine.
        runner.expect(
            "docker rm -f c-bad",
            CommandOutput::err(1, "daemon wedged: cannot remove"),
        );

        let registry = RuntimeRegistry::new();
        registry.register_container(container("c-bad"));
        registry.register_container(container("c-ok"));
        registry.register_stack(stack("demo"));

        let docker = ContainerCli::new(runner.clone());
        let compose = ComposeCli::new(runner.clone());
        let failures = registry.cleanup(&docker, &compose).await;

        assert_eq!(failures.len(), 1);
        assert!(failures[0].entity.contains("c-bad"));
        // The failed container stays registered; the rest are gone.
        assert!(registry.exists("c-bad"));
        assert!(!registry.exists("c-ok"));
        assert!(!registry.exists("demo"));
        assert!(runner.saw("docker rm -f c-ok"));
        assert!(runner.saw("compose -p demo"));
    }
}
