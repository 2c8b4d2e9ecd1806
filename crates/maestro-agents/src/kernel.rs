//! The kernel wires the dispatcher, agent drivers, and runtime registry
//! together, and owns orderly shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use orchestration::container::{ComposeCli, ContainerCli};
use orchestration::dispatch::Dispatcher;
use orchestration::driver::{AgentDriver, DriverConfig, Role, RunOutcome};
use orchestration::exec::CommandRunner;
use orchestration::runtime::RuntimeRegistry;
use orchestration::state::StateStore;

use crate::runtime::AgentRuntime;
use crate::ARCHITECT_ID;

/// How long stop() waits for drivers to drain before tearing down
/// containers anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Kernel {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<RuntimeRegistry>,
    docker: ContainerCli,
    compose: ComposeCli,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl Kernel {
    pub fn new(runner: Arc<dyn CommandRunner>, inbox_capacity: usize) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::with_capacity(inbox_capacity, 8)),
            registry: Arc::new(RuntimeRegistry::new()),
            docker: ContainerCli::new(runner.clone()),
            compose: ComposeCli::new(runner),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn an agent: register with the dispatcher, build its driver, and
    /// run it on a tracked task. Returns a handle resolving to the driver
    /// outcome.
    pub async fn spawn_role<R>(
        &self,
        agent_id: &str,
        role: R,
        store: Arc<dyn StateStore>,
        config: DriverConfig,
    ) -> Result<tokio::task::JoinHandle<RunOutcome>>
    where
        R: Role + Send + Sync + 'static,
    {
        let mut rt =
            AgentRuntime::connect(self.dispatcher.clone(), agent_id, ARCHITECT_ID).await?;
        let mut driver = AgentDriver::new(
            agent_id,
            role,
            store,
            config,
            self.cancel.child_token(),
        );
        let agent_id = agent_id.to_string();
        let handle = self.tracker.spawn(async move {
            match driver.run(&mut rt).await {
                Ok(outcome) => {
                    info!(agent = %agent_id, outcome = ?outcome, "agent finished");
                    outcome
                }
                Err(e) => {
                    warn!(agent = %agent_id, error = %e, "agent driver failed");
                    RunOutcome::Error {
                        reason: e.to_string(),
                    }
                }
            }
        });
        Ok(handle)
    }

    /// Stop everything: cancel drivers, broadcast shutdown, wait for tasks
    /// to drain, then tear down every registered container and stack.
    ///
    /// Safe to call any number of times; repeat calls are no-ops.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("kernel stopping");
        self.cancel.cancel();
        self.dispatcher.shutdown().await;
        self.tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("agent tasks did not drain in time");
        }

        let failures = self.registry.cleanup(&self.docker, &self.compose).await;
        for failure in &failures {
            warn!(entity = %failure.entity, error = %failure.error, "teardown failure");
        }
        info!(
            remaining = self.registry.count(),
            failures = failures.len(),
            "kernel stopped"
        );
    }
}
