//! Process-wide pinned-image state.
//!
//! The pinned image is what the system considers "current" for each role.
//! Promotion writes it inside its commit phase; everyone else reads. This is
//! a deliberate process singleton with a small explicit API; tests reset it
//! between cases.

use std::sync::{OnceLock, RwLock};

use super::ImageRole;

#[derive(Debug, Clone, Default)]
struct PinnedImages {
    safe: Option<String>,
    target: Option<String>,
    last_built: Option<String>,
}

static PINNED: OnceLock<RwLock<PinnedImages>> = OnceLock::new();

fn cell() -> &'static RwLock<PinnedImages> {
    PINNED.get_or_init(|| RwLock::new(PinnedImages::default()))
}

/// The pinned image for a role, if any.
pub fn pinned_image(role: ImageRole) -> Option<String> {
    let pins = cell().read().unwrap_or_else(|e| e.into_inner());
    match role {
        ImageRole::Safe => pins.safe.clone(),
        ImageRole::Target => pins.target.clone(),
    }
}

/// Record a role's pinned image (in-process cache; durable persistence goes
/// through the project config).
pub fn set_pinned_image(role: ImageRole, image_id: Option<String>) {
    let mut pins = cell().write().unwrap_or_else(|e| e.into_inner());
    match role {
        ImageRole::Safe => pins.safe = image_id,
        ImageRole::Target => pins.target = image_id,
    }
}

/// Hint: the most recently built image, used as a promotion candidate.
pub fn last_built_image() -> Option<String> {
    cell()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .last_built
        .clone()
}

pub fn set_last_built_image(image_id: Option<String>) {
    cell().write().unwrap_or_else(|e| e.into_inner()).last_built = image_id;
}

/// Clear all pins. Tests call this between cases.
pub fn reset_for_tests() {
    *cell().write().unwrap_or_else(|e| e.into_inner()) = PinnedImages::default();
}

/// Serializes tests that touch the process-wide pins.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
