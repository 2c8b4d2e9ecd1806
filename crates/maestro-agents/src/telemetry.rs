//! Logging setup and per-story run metrics.
//!
//! Metrics append to a jsonl file so repeated runs accumulate a history the
//! dashboard (out of scope here) can read.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber with `RUST_LOG`-style filtering. Safe to call
/// once per process.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// Outcome of one story run, as appended to the metrics log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryRunMetrics {
    pub story_id: String,
    pub coder: String,
    pub success: bool,
    pub final_state: String,
    pub transitions: usize,
    pub elapsed_ms: u64,
    pub timestamp: String,
}

/// Append one record; metrics failures never fail the run.
pub fn append_metrics(path: &Path, metrics: &StoryRunMetrics) {
    let line = match serde_json::to_string(metrics) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "metrics serialization failed");
            return;
        }
    };
    let write = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| {
            use std::io::Write;
            writeln!(f, "{line}")
        });
    if let Err(e) = write {
        warn!(path = %path.display(), error = %e, "metrics append failed");
    }
}
