//! Persisted agent state: the current FSM state, story-scoped working data,
//! and the ordered transition log.

pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{FileStateStore, InMemoryStateStore, StateStore, StoreError};

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Story-scoped key/value working data for a role.
///
/// Effects fold their results in here; roles read them back on the next
/// transition. Values are JSON so roles can stash structured context without
/// widening this type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateData(BTreeMap<String, serde_json::Value>);

impl StateData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Increment a counter key, returning the new value.
    pub fn incr(&mut self, key: &str) -> u64 {
        let next = self.get_u64(key).unwrap_or(0) + 1;
        self.0.insert(key.to_string(), next.into());
        next
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn merge(&mut self, entries: BTreeMap<String, serde_json::Value>) {
        self.0.extend(entries);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Snapshot of one agent, as written to the state store.
///
/// At most one story is owned at a time; ownership is released only when the
/// FSM reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub current_state: String,
    #[serde(default)]
    pub state_data: StateData,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
}

impl AgentSnapshot {
    pub fn new(initial_state: impl Into<String>) -> Self {
        Self {
            current_state: initial_state.into(),
            state_data: StateData::new(),
            transitions: Vec::new(),
            story_id: None,
        }
    }

    /// Append a transition record and move `current_state`.
    pub fn record_transition(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        reason: Option<String>,
    ) {
        let to = to.into();
        self.transitions.push(TransitionRecord {
            from: from.into(),
            to: to.clone(),
            timestamp: Utc::now(),
            reason,
        });
        self.current_state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_transition_moves_current_state() {
        let mut snap = AgentSnapshot::new("WAITING");
        snap.record_transition("WAITING", "SETUP", Some("story assigned".into()));
        snap.record_transition("SETUP", "PLANNING", None);

        assert_eq!(snap.current_state, "PLANNING");
        assert_eq!(snap.transitions.len(), 2);
        assert_eq!(snap.transitions[0].reason.as_deref(), Some("story assigned"));
    }

    #[test]
    fn state_data_counters_and_merge() {
        let mut data = StateData::new();
        assert_eq!(data.incr("planning_rounds"), 1);
        assert_eq!(data.incr("planning_rounds"), 2);

        data.set("approval_status", "APPROVED");
        assert_eq!(data.get_str("approval_status"), Some("APPROVED"));

        let mut extra = BTreeMap::new();
        extra.insert("merge_status".to_string(), "merged".into());
        data.merge(extra);
        assert_eq!(data.get_str("merge_status"), Some("merged"));
    }

    #[test]
    fn snapshot_serde_round_trip() {
        let mut snap = AgentSnapshot::new("CODING");
        snap.story_id = Some("story-3".into());
        snap.state_data.set("build_feedback", "lint clean");
        snap.record_transition("CODING", "TESTING", None);

        let json = serde_json::to_string(&snap).unwrap();
        let restored: AgentSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snap);
    }
}
