//! Compose-file handling for the demo subsystem.
//!
//! Three concerns: finding the service labeled `maestro.app=true` and its
//! seed port, rewriting a compose document with host-port bindings stripped
//! (hybrid mode runs dependencies only, and published host ports would
//! collide), and classifying what changed between two commits.

use serde_yaml::Value;

/// Label marking the application service inside a compose file.
pub const APP_LABEL: &str = "maestro.app";

/// Parse one compose port-mapping string into its host port.
///
/// `"PORT"` → 0 (host port unknown), `"HOST:CONTAINER"` → HOST,
/// `"IP:HOST:CONTAINER"` → HOST. A trailing `/proto` is stripped first.
pub fn parse_port_mapping(mapping: &str) -> Option<u16> {
    let mapping = mapping.split('/').next()?.trim();
    if mapping.is_empty() {
        return None;
    }
    let parts: Vec<&str> = mapping.split(':').collect();
    match parts.len() {
        1 => {
            parts[0].parse::<u16>().ok()?;
            Some(0)
        }
        2 => parts[0].parse().ok(),
        3 => parts[1].parse().ok(),
        _ => None,
    }
}

fn service_has_app_label(service: &Value) -> bool {
    let Some(labels) = service.get("labels") else {
        return false;
    };
    match labels {
        // labels: ["maestro.app=true", ...]
        Value::Sequence(seq) => seq.iter().any(|entry| {
            entry
                .as_str()
                .is_some_and(|s| s.trim() == format!("{APP_LABEL}=true"))
        }),
        // labels: { maestro.app: "true" }
        Value::Mapping(map) => map.iter().any(|(k, v)| {
            k.as_str() == Some(APP_LABEL)
                && (v.as_str() == Some("true") || v.as_bool() == Some(true))
        }),
        _ => false,
    }
}

fn first_port_entry(service: &Value) -> Option<String> {
    let ports = service.get("ports")?.as_sequence()?;
    let first = ports.first()?;
    match first {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        // Long form: {target: 8080, published: 8081}
        Value::Mapping(map) => {
            let target = map.get("target")?.as_u64()?;
            match map.get("published").and_then(Value::as_u64) {
                Some(published) => Some(format!("{published}:{target}")),
                None => Some(target.to_string()),
            }
        }
        _ => None,
    }
}

/// The service labeled `maestro.app=true`, with its seed host port parsed
/// from the first `ports` entry.
pub fn find_labeled_app(doc: &Value) -> Option<(String, Option<u16>)> {
    let services = doc.get("services")?.as_mapping()?;
    for (name, service) in services {
        if service_has_app_label(service) {
            let port = first_port_entry(service).and_then(|p| parse_port_mapping(&p));
            return Some((name.as_str()?.to_string(), port));
        }
    }
    None
}

/// Rewrite every service's port list so no host ports are published.
///
/// `"8080:80"` → `"80"`, `"127.0.0.1:5432:5432"` → `"5432"`; long-form
/// mappings lose their `published` key. Container-side ports stay visible on
/// the compose network.
pub fn strip_host_ports(doc: &Value) -> Value {
    let mut doc = doc.clone();
    let Some(services) = doc
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
    else {
        return doc;
    };

    for (_, service) in services.iter_mut() {
        let Some(ports) = service.get_mut("ports").and_then(Value::as_sequence_mut) else {
            continue;
        };
        for entry in ports.iter_mut() {
            match entry {
                Value::String(s) => {
                    let (mapping, proto) = match s.split_once('/') {
                        Some((m, p)) => (m, Some(p.to_string())),
                        None => (s.as_str(), None),
                    };
                    let parts: Vec<&str> = mapping.split(':').collect();
                    let container = *parts.last().unwrap_or(&"");
                    *s = match proto {
                        Some(proto) => format!("{container}/{proto}"),
                        None => container.to_string(),
                    };
                }
                Value::Mapping(map) => {
                    map.remove("published");
                }
                _ => {}
            }
        }
    }
    doc
}

/// What changed between two commits, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    None,
    CodeOnly,
    Dockerfile,
    ComposeFile,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::CodeOnly => "code_only",
            Self::Dockerfile => "dockerfile",
            Self::ComposeFile => "compose_file",
        }
    }
}

/// Classify a changed-file list. Compose-file changes dominate Dockerfile
/// changes dominate code-only changes.
pub fn detect_change(changed_files: &[String], compose_file: Option<&str>) -> ChangeKind {
    let mut kind = ChangeKind::None;
    for file in changed_files {
        let name = file.rsplit('/').next().unwrap_or(file);
        let this = if compose_file.is_some_and(|cf| file == cf)
            || name == "docker-compose.yml"
            || name == "docker-compose.yaml"
            || name == "compose.yml"
            || name == "compose.yaml"
        {
            ChangeKind::ComposeFile
        } else if name == "Dockerfile" || name.starts_with("Dockerfile.") {
            ChangeKind::Dockerfile
        } else {
            ChangeKind::CodeOnly
        };
        kind = kind.max(this);
    }
    kind
}
