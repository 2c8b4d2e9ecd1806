//! Crash-safe snapshot persistence.
//!
//! One JSON file per agent at `<root>/<agent_id>.json`. Writes go to a temp
//! file in the same directory, are fsynced, then renamed over the target, so
//! a reader never observes a partially written snapshot: a write interrupted
//! before the rename is a no-op, after the rename it is complete.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use super::AgentSnapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid agent id `{0}`")]
    InvalidAgentId(String),

    #[error("state io failed for `{agent_id}`: {source}")]
    Io {
        agent_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot for `{agent_id}` is corrupt: {source}")]
    Corrupt {
        agent_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidAgentId(_) => "validation",
            Self::Io { .. } => "transient_io",
            Self::Corrupt { .. } => "validation",
        }
    }
}

/// Snapshot persistence used by the agent driver.
pub trait StateStore: Send + Sync {
    fn put(&self, agent_id: &str, snapshot: &AgentSnapshot) -> Result<(), StoreError>;
    fn get(&self, agent_id: &str) -> Result<Option<AgentSnapshot>, StoreError>;
    fn list_agents(&self) -> Result<Vec<String>, StoreError>;
}

fn check_agent_id(agent_id: &str) -> Result<(), StoreError> {
    if agent_id.is_empty() || agent_id.contains(['/', '\\', '.']) {
        return Err(StoreError::InvalidAgentId(agent_id.to_string()));
    }
    Ok(())
}

/// File-backed store rooted at `<workdir>/state/`.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            agent_id: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Conventional layout under a working directory.
    pub fn in_workdir(workdir: &Path) -> Result<Self, StoreError> {
        Self::new(workdir.join("state"))
    }

    fn path_for(&self, agent_id: &str) -> PathBuf {
        self.root.join(format!("{agent_id}.json"))
    }
}

impl StateStore for FileStateStore {
    fn put(&self, agent_id: &str, snapshot: &AgentSnapshot) -> Result<(), StoreError> {
        check_agent_id(agent_id)?;
        let io = |source| StoreError::Io {
            agent_id: agent_id.to_string(),
            source,
        };

        let body = serde_json::to_vec_pretty(snapshot).map_err(|source| StoreError::Corrupt {
            agent_id: agent_id.to_string(),
            source,
        })?;

        // Temp file in the same directory so the rename is atomic.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let tmp = self.root.join(format!(".{agent_id}.json.tmp-{nanos}"));

        let mut file = fs::File::create(&tmp).map_err(io)?;
        file.write_all(&body).map_err(io)?;
        file.sync_all().map_err(io)?;
        drop(file);

        fs::rename(&tmp, self.path_for(agent_id)).map_err(io)
    }

    fn get(&self, agent_id: &str) -> Result<Option<AgentSnapshot>, StoreError> {
        check_agent_id(agent_id)?;
        let raw = match fs::read_to_string(self.path_for(agent_id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    agent_id: agent_id.to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                agent_id: agent_id.to_string(),
                source,
            })
    }

    fn list_agents(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            agent_id: self.root.display().to_string(),
            source,
        })?;

        let mut agents = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Skip in-flight temp files.
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(".json") {
                agents.push(stem.to_string());
            }
        }
        agents.sort();
        Ok(agents)
    }
}

/// In-memory store for driving roles in isolation.
#[derive(Default)]
pub struct InMemoryStateStore {
    snapshots: Mutex<HashMap<String, AgentSnapshot>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn put(&self, agent_id: &str, snapshot: &AgentSnapshot) -> Result<(), StoreError> {
        check_agent_id(agent_id)?;
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id.to_string(), snapshot.clone());
        Ok(())
    }

    fn get(&self, agent_id: &str) -> Result<Option<AgentSnapshot>, StoreError> {
        check_agent_id(agent_id)?;
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned())
    }

    fn list_agents(&self) -> Result<Vec<String>, StoreError> {
        let mut agents: Vec<String> = self
            .snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        agents.sort();
        Ok(agents)
    }
}
