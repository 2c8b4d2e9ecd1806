//! Durable per-project settings: pinned images and demo port memory.
//!
//! Stored as TOML at `<project>/.maestro/config.toml`, rewritten atomically
//! (temp file + rename) like agent snapshots.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative location of the config file under a project root.
pub const CONFIG_PATH: &str = ".maestro/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config encode failed: {0}")]
    Encode(#[from] toml::ser::Error),
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "transient_io",
            _ => "validation",
        }
    }
}

/// Demo-subsystem memory, reused across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemoSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_container_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port_override: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detected_ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assigned_host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_cmd_override: Option<String>,
}

/// Everything the project persists between process runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_safe_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_target_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_built_image: Option<String>,
    #[serde(default)]
    pub demo: DemoSettings,
}

impl ProjectConfig {
    pub fn path_in(project_root: &Path) -> PathBuf {
        project_root.join(CONFIG_PATH)
    }

    /// Load the project config; a missing file is the default config.
    pub fn load(project_root: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_in(project_root);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        Ok(toml::from_str(&raw)?)
    }

    /// Atomically rewrite the config file.
    pub fn save(&self, project_root: &Path) -> Result<(), ConfigError> {
        let path = Self::path_in(project_root);
        let parent = path.parent().expect("config path has a parent");
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;

        let body = toml::to_string_pretty(self)?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let tmp = parent.join(format!(".config.toml.tmp-{nanos}"));
        let io = |source| ConfigError::Io {
            path: tmp.clone(),
            source,
        };

        let mut file = fs::File::create(&tmp).map_err(io)?;
        file.write_all(body.as_bytes()).map_err(io)?;
        file.sync_all().map_err(io)?;
        drop(file);
        fs::rename(&tmp, &path).map_err(|source| ConfigError::Io { path, source })
    }
}
