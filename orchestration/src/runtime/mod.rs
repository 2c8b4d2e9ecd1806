//! Container runtime state: which container is active, what ran before it,
//! and which compose stacks this process brought up.

pub mod orchestrator;
pub mod pin;
pub mod promotion;
pub mod registry;

use std::collections::VecDeque;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use orchestrator::DockerOrchestrator;
pub use pin::{last_built_image, pinned_image, reset_for_tests, set_last_built_image, set_pinned_image};
pub use promotion::{switch_container, Orchestrator, PromotionError, SwitchReport, SwitchStatus};
pub use registry::{CleanupFailure, ComposeStack, RuntimeRegistry, TrackedContainer};

/// Whether an image is the vetted baseline or the image under promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRole {
    Safe,
    Target,
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// The single container currently serving the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveContainer {
    pub role: ImageRole,
    pub cid: String,
    pub image_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

/// A retired container, retained for diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: ImageRole,
    pub image_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn retired(active: &ActiveContainer) -> Self {
        Self {
            role: active.role,
            image_id: active.image_id.clone(),
            name: active.name.clone(),
            started_at: active.started_at,
            stopped_at: Some(Utc::now()),
        }
    }
}

/// Newest-first history ring length.
pub const HISTORY_CAPACITY: usize = 10;

struct RuntimeInner {
    active: Option<ActiveContainer>,
    history: VecDeque<HistoryEntry>,
}

/// Guarded active-container + history state. All getters return clones so
/// callers can never mutate through a read.
pub struct RuntimeState {
    inner: RwLock<RuntimeInner>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RuntimeInner {
                active: None,
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
            }),
        }
    }

    pub fn active(&self) -> Option<ActiveContainer> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .clone()
    }

    pub fn set_active(&self, container: ActiveContainer) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .active = Some(container);
    }

    /// Clear and return the previous active container, if any.
    pub fn clear_active(&self) -> Option<ActiveContainer> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .take()
    }

    /// Push newest-first; the ring never exceeds [`HISTORY_CAPACITY`].
    pub fn push_history(&self, entry: HistoryEntry) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.history.push_front(entry);
        inner.history.truncate(HISTORY_CAPACITY);
    }

    /// Newest-first copy of the ring.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}
