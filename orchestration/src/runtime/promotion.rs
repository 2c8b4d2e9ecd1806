//! Atomic "switch the active image" algorithm.
//!
//! The candidate container is started and health-checked before anything
//! visible changes. Commit retires the previous active container into
//! history, installs the candidate, and persists the pinned image id. If the
//! pin write fails the whole switch rolls back: candidate stopped, previous
//! container restarted best-effort, previous pin restored. After a
//! successful switch the pinned image always equals the running container's
//! image.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use super::{ActiveContainer, HistoryEntry, ImageRole, RuntimeState};

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("candidate start failed: {0}")]
    StartFailed(String),

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("pin write failed: {0}")]
    PinWriteFailed(String),
}

impl PromotionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartFailed(_) => "transient_io",
            Self::HealthCheckFailed(_) => "health_check_failed",
            Self::PinWriteFailed(_) => "pin_write_failed",
        }
    }
}

/// Capability surface promotion needs from the container layer.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn start_container(
        &self,
        role: ImageRole,
        image_id: &str,
    ) -> Result<ActiveContainer, PromotionError>;

    async fn stop_container(&self, cid: &str) -> Result<(), PromotionError>;

    async fn health_check(&self, cid: &str) -> Result<(), PromotionError>;

    fn pinned_image(&self, role: ImageRole) -> Option<String>;

    fn write_pinned_image(
        &self,
        role: ImageRole,
        image_id: Option<&str>,
    ) -> Result<(), PromotionError>;

    /// Most recently built image, used by callers to pick a candidate.
    fn last_built_image(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStatus {
    Switched,
    Noop,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SwitchReport {
    pub status: SwitchStatus,
    pub active_image_id: Option<String>,
    pub role: ImageRole,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SwitchReport {
    fn new(status: SwitchStatus, role: ImageRole, active_image_id: Option<String>) -> Self {
        Self {
            status,
            active_image_id,
            role,
            timestamp: Utc::now(),
            error: None,
        }
    }

    fn failed(role: ImageRole, active_image_id: Option<String>, error: &PromotionError) -> Self {
        let mut report = Self::new(SwitchStatus::Failed, role, active_image_id);
        report.error = Some(format!("{}: {error}", error.kind()));
        report
    }
}

/// Switch the active container to `image_id` for `role`.
pub async fn switch_container(
    orc: &dyn Orchestrator,
    state: &RuntimeState,
    role: ImageRole,
    image_id: &str,
) -> SwitchReport {
    let previous = state.active();
    let previous_pin = orc.pinned_image(role);

    // Idempotence: running container and persisted pin already match.
    if previous.as_ref().map(|c| c.image_id.as_str()) == Some(image_id)
        && previous_pin.as_deref() == Some(image_id)
    {
        info!(role = %role, image = image_id, "promotion noop");
        return SwitchReport::new(SwitchStatus::Noop, role, Some(image_id.to_string()));
    }

    // Start the candidate before touching anything visible.
    let candidate = match orc.start_container(role, image_id).await {
        Ok(candidate) => candidate,
        Err(e) => {
            warn!(role = %role, image = image_id, error = %e, "candidate start failed");
            return SwitchReport::failed(
                role,
                previous.as_ref().map(|c| c.image_id.clone()),
                &e,
            );
        }
    };

    // Probe: a candidate that fails health never becomes active.
    if let Err(e) = orc.health_check(&candidate.cid).await {
        warn!(cid = %candidate.cid, error = %e, "candidate failed health check");
        if let Err(stop_err) = orc.stop_container(&candidate.cid).await {
            warn!(cid = %candidate.cid, error = %stop_err, "candidate stop failed");
        }
        return SwitchReport::failed(role, previous.as_ref().map(|c| c.image_id.clone()), &e);
    }

    // Commit: retire previous, install candidate, persist the pin.
    if let Some(prev) = &previous {
        state.push_history(HistoryEntry::retired(prev));
        if let Err(e) = orc.stop_container(&prev.cid).await {
            // Best-effort: a stop failure must not abort the switch.
            warn!(cid = %prev.cid, error = %e, "previous container stop failed");
        }
    }
    state.set_active(candidate.clone());

    if let Err(pin_err) = orc.write_pinned_image(role, Some(image_id)) {
        // Rollback: the world must end up consistent with what is running.
        warn!(role = %role, error = %pin_err, "pin write failed, rolling back");
        state.clear_active();
        if let Err(e) = orc.stop_container(&candidate.cid).await {
            warn!(cid = %candidate.cid, error = %e, "candidate stop failed during rollback");
        }
        if let Some(prev) = &previous {
            match orc.start_container(prev.role, &prev.image_id).await {
                Ok(restarted) => state.set_active(restarted),
                Err(e) => {
                    warn!(image = %prev.image_id, error = %e, "previous container restart failed")
                }
            }
        }
        if let Err(e) = orc.write_pinned_image(role, previous_pin.as_deref()) {
            warn!(role = %role, error = %e, "previous pin restore failed");
        }
        let active = state.active().map(|c| c.image_id);
        return SwitchReport::failed(role, active, &pin_err);
    }

    info!(role = %role, image = image_id, cid = %candidate.cid, "promotion switched");
    SwitchReport::new(SwitchStatus::Switched, role, Some(image_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scriptable orchestrator double.
    #[derive(Default)]
    struct FakeOrchestrator {
        pin: Mutex<Option<String>>,
        healthy_images: Mutex<Vec<String>>,
        fail_pin_writes: Mutex<u32>,
        started: Mutex<Vec<String>>,
        stopped: Mutex<Vec<String>>,
        start_seq: AtomicU32,
    }

    impl FakeOrchestrator {
        fn healthy(images: &[&str]) -> Self {
            let fake = Self::default();
            *fake.healthy_images.lock().unwrap() =
                images.iter().map(|s| s.to_string()).collect();
            fake
        }

        fn fail_next_pin_writes(&self, count: u32) {
            *self.fail_pin_writes.lock().unwrap() = count;
        }
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn start_container(
            &self,
            role: ImageRole,
            image_id: &str,
        ) -> Result<ActiveContainer, PromotionError> {
            if image_id.contains("unstartable") {
                return Err(PromotionError::StartFailed(format!("{image_id} missing")));
            }
            let n = self.start_seq.fetch_add(1, Ordering::SeqCst);
            let cid = format!("cid-{n}-{image_id}");
            self.started.lock().unwrap().push(cid.clone());
            Ok(ActiveContainer {
                role,
                cid,
                image_id: image_id.to_string(),
                name: format!("app-{n}"),
                started_at: Utc::now(),
            })
        }

        async fn stop_container(&self, cid: &str) -> Result<(), PromotionError> {
            self.stopped.lock().unwrap().push(cid.to_string());
            Ok(())
        }

        async fn health_check(&self, cid: &str) -> Result<(), PromotionError> {
            let healthy = self.healthy_images.lock().unwrap();
            if healthy.iter().any(|img| cid.contains(img.as_str())) {
                Ok(())
            } else {
                Err(PromotionError::HealthCheckFailed(format!(
                    "{cid} not responding"
                )))
            }
        }

        fn pinned_image(&self, _role: ImageRole) -> Option<String> {
            self.pin.lock().unwrap().clone()
        }

        fn write_pinned_image(
            &self,
            _role: ImageRole,
            image_id: Option<&str>,
        ) -> Result<(), PromotionError> {
            let mut failures = self.fail_pin_writes.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(PromotionError::PinWriteFailed("disk full".into()));
            }
            *self.pin.lock().unwrap() = image_id.map(String::from);
            Ok(())
        }

        fn last_built_image(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn switch_then_repeat_is_noop() {
        let orc = FakeOrchestrator::healthy(&["sha256:good"]);
        let state = RuntimeState::new();

        let first = switch_container(&orc, &state, ImageRole::Target, "sha256:good").await;
        assert_eq!(first.status, SwitchStatus::Switched);
        assert_eq!(first.active_image_id.as_deref(), Some("sha256:good"));
        assert_eq!(state.active().unwrap().image_id, "sha256:good");
        assert_eq!(orc.pinned_image(ImageRole::Target).as_deref(), Some("sha256:good"));

        let second = switch_container(&orc, &state, ImageRole::Target, "sha256:good").await;
        assert_eq!(second.status, SwitchStatus::Noop);
        // No new container was started for the noop.
        assert_eq!(orc.started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn health_failure_stops_candidate_and_keeps_previous() {
        let orc = FakeOrchestrator::healthy(&["sha256:good"]);
        let state = RuntimeState::new();
        switch_container(&orc, &state, ImageRole::Target, "sha256:good").await;
        let prior_active = state.active().unwrap();

        let report = switch_container(&orc, &state, ImageRole::Target, "sha256:bad").await;
        assert_eq!(report.status, SwitchStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("health_check_failed"));

        // Candidate was stopped; previous active and pin are untouched.
        assert!(orc
            .stopped
            .lock()
            .unwrap()
            .iter()
            .any(|cid| cid.contains("sha256:bad")));
        assert_eq!(state.active().unwrap(), prior_active);
        assert_eq!(orc.pinned_image(ImageRole::Target).as_deref(), Some("sha256:good"));
    }

    #[tokio::test]
    async fn pin_write_failure_rolls_back_to_previous() {
        let orc = FakeOrchestrator::healthy(&["sha256:v1", "sha256:v2"]);
        let state = RuntimeState::new();
        switch_container(&orc, &state, ImageRole::Target, "sha256:v1").await;

        // Fail the commit write; the rollback's restore write succeeds.
        orc.fail_next_pin_writes(1);
        let report = switch_container(&orc, &state, ImageRole::Target, "sha256:v2").await;

        assert_eq!(report.status, SwitchStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("pin_write_failed"));
        // Active reflects what is actually running: the restarted v1.
        assert_eq!(state.active().unwrap().image_id, "sha256:v1");
        assert_eq!(report.active_image_id.as_deref(), Some("sha256:v1"));
        assert_eq!(orc.pinned_image(ImageRole::Target).as_deref(), Some("sha256:v1"));
        // Candidate v2 was stopped during rollback.
        assert!(orc
            .stopped
            .lock()
            .unwrap()
            .iter()
            .any(|cid| cid.contains("sha256:v2")));
    }

    #[tokio::test]
    async fn start_failure_reports_without_touching_state() {
        let orc = FakeOrchestrator::healthy(&["sha256:v1"]);
        let state = RuntimeState::new();
        switch_container(&orc, &state, ImageRole::Target, "sha256:v1").await;

        let report =
            switch_container(&orc, &state, ImageRole::Target, "sha256:unstartable").await;
        assert_eq!(report.status, SwitchStatus::Failed);
        assert_eq!(state.active().unwrap().image_id, "sha256:v1");
        assert!(state.history().is_empty());
    }

    #[tokio::test]
    async fn successful_switch_retires_previous_into_history() {
        let orc = FakeOrchestrator::healthy(&["sha256:v1", "sha256:v2"]);
        let state = RuntimeState::new();
        switch_container(&orc, &state, ImageRole::Target, "sha256:v1").await;
        switch_container(&orc, &state, ImageRole::Target, "sha256:v2").await;

        let history = state.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].image_id, "sha256:v1");
        assert!(history[0].stopped_at.is_some());
        assert_eq!(state.active().unwrap().image_id, "sha256:v2");
    }
}
