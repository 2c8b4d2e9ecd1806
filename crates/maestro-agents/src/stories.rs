//! Stories: the unit of work the architect produces and one coder consumes.
//!
//! The queue keeps stories ordered, tracks per-story dependencies (a story
//! is ready only when every dependency is terminal), and enforces that a
//! story is owned by at most one coder at a time with a hard cap on
//! re-dispatches.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use orchestration::messages::{Envelope, MsgType, Payload};

/// A story is dispatched at most this many times (original + one requeue).
pub const MAX_DISPATCHES_PER_STORY: u32 = 2;

#[derive(Debug, Error)]
pub enum StoryError {
    #[error("story `{0}` not found")]
    Unknown(String),

    #[error("story `{story_id}` is already owned by `{coder}`")]
    AlreadyOwned { story_id: String, coder: String },

    #[error("story `{0}` exhausted its dispatch budget")]
    DispatchBudgetExhausted(String),

    #[error("story `{0}` is terminal")]
    Terminal(String),

    #[error("duplicate story id `{0}`")]
    DuplicateId(String),

    #[error("envelope is not a story: {0}")]
    NotAStory(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoryStatus {
    Pending,
    InProgress { coder: String },
    Done,
    Failed,
}

impl StoryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Ordered story queue with dependency gating.
#[derive(Debug)]
pub struct StoryQueue {
    stories: Vec<Story>,
    status: HashMap<String, StoryStatus>,
    dispatch_counts: HashMap<String, u32>,
}

impl StoryQueue {
    pub fn new(stories: Vec<Story>) -> Result<Self, StoryError> {
        let mut status = HashMap::new();
        for story in &stories {
            if status
                .insert(story.id.clone(), StoryStatus::Pending)
                .is_some()
            {
                return Err(StoryError::DuplicateId(story.id.clone()));
            }
        }
        Ok(Self {
            stories,
            status,
            dispatch_counts: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.stories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stories.is_empty()
    }

    pub fn status(&self, story_id: &str) -> Option<&StoryStatus> {
        self.status.get(story_id)
    }

    pub fn story(&self, story_id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == story_id)
    }

    fn deps_terminal(&self, story: &Story) -> bool {
        story.dependencies.iter().all(|dep| {
            self.status
                .get(dep)
                .map(StoryStatus::is_terminal)
                // Unknown dependencies never block forever; treat as met.
                .unwrap_or(true)
        })
    }

    /// First pending story whose dependencies are all terminal.
    pub fn next_ready(&self) -> Option<&Story> {
        self.stories.iter().find(|story| {
            matches!(self.status.get(&story.id), Some(StoryStatus::Pending))
                && self.deps_terminal(story)
        })
    }

    /// Hand a story to a coder. A story already in progress is never
    /// re-dispatched, and the lifetime dispatch count is capped.
    pub fn mark_dispatched(&mut self, story_id: &str, coder: &str) -> Result<(), StoryError> {
        match self.status.get(story_id) {
            None => return Err(StoryError::Unknown(story_id.to_string())),
            Some(StoryStatus::InProgress { coder }) => {
                return Err(StoryError::AlreadyOwned {
                    story_id: story_id.to_string(),
                    coder: coder.clone(),
                })
            }
            Some(status) if status.is_terminal() => {
                return Err(StoryError::Terminal(story_id.to_string()))
            }
            Some(StoryStatus::Pending) => {}
            Some(StoryStatus::Done) | Some(StoryStatus::Failed) => unreachable!(),
        }
        let count = self.dispatch_counts.entry(story_id.to_string()).or_insert(0);
        if *count >= MAX_DISPATCHES_PER_STORY {
            return Err(StoryError::DispatchBudgetExhausted(story_id.to_string()));
        }
        *count += 1;
        self.status.insert(
            story_id.to_string(),
            StoryStatus::InProgress {
                coder: coder.to_string(),
            },
        );
        Ok(())
    }

    pub fn mark_done(&mut self, story_id: &str) {
        self.status.insert(story_id.to_string(), StoryStatus::Done);
    }

    pub fn mark_failed(&mut self, story_id: &str) {
        self.status
            .insert(story_id.to_string(), StoryStatus::Failed);
    }

    /// Return a failed or in-progress story to the pending pool. Only legal
    /// while dispatch budget remains; this is the explicit-requeue path.
    pub fn requeue(&mut self, story_id: &str) -> Result<(), StoryError> {
        match self.status.get(story_id) {
            None => return Err(StoryError::Unknown(story_id.to_string())),
            Some(StoryStatus::Done) => return Err(StoryError::Terminal(story_id.to_string())),
            _ => {}
        }
        if self.dispatch_counts.get(story_id).copied().unwrap_or(0) >= MAX_DISPATCHES_PER_STORY {
            return Err(StoryError::DispatchBudgetExhausted(story_id.to_string()));
        }
        self.status
            .insert(story_id.to_string(), StoryStatus::Pending);
        Ok(())
    }

    pub fn owner(&self, story_id: &str) -> Option<&str> {
        match self.status.get(story_id)? {
            StoryStatus::InProgress { coder } => Some(coder),
            _ => None,
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.status.values().all(StoryStatus::is_terminal)
    }
}

/// Build a STORY envelope carrying the story as a generic payload.
pub fn story_envelope(from: &str, to: &str, story: &Story) -> Envelope {
    Envelope::new(
        MsgType::Story,
        from,
        to,
        Payload::generic([
            ("story_id", serde_json::Value::from(story.id.clone())),
            ("title", serde_json::Value::from(story.title.clone())),
            (
                "description",
                serde_json::Value::from(story.description.clone()),
            ),
        ]),
    )
    .with_meta("story_id", story.id.clone())
}

/// Recover a story from a STORY envelope.
pub fn parse_story_envelope(envelope: &Envelope) -> Result<Story, StoryError> {
    if envelope.msg_type != MsgType::Story {
        return Err(StoryError::NotAStory(format!(
            "envelope type {}",
            envelope.msg_type
        )));
    }
    let map = envelope
        .extract_generic()
        .map_err(|e| StoryError::NotAStory(e.to_string()))?;
    let field = |key: &str| {
        map.get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_default()
    };
    let id = field("story_id");
    if id.is_empty() {
        return Err(StoryError::NotAStory("missing story_id".into()));
    }
    Ok(Story {
        id,
        title: field("title"),
        description: field("description"),
        dependencies: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Spec analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("specification has no stories")]
    NoStories,

    #[error("specification invalid: {0}")]
    Invalid(String),
}

/// External collaborator surface: given markdown, return validated stories.
pub trait SpecAnalyzer: Send + Sync {
    fn parse(&self, markdown: &str) -> Result<Vec<Story>, SpecError>;
}

/// Built-in parser for the runner's story format: one `## Story:` heading
/// per story with optional `Id:` and `Depends:` lines, body as description.
pub struct MarkdownSpecParser;

fn slugify(title: &str) -> String {
    let mut slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    slug.trim_matches('-').to_string()
}

impl SpecAnalyzer for MarkdownSpecParser {
    fn parse(&self, markdown: &str) -> Result<Vec<Story>, SpecError> {
        let mut stories = Vec::new();
        let mut current: Option<Story> = None;

        for line in markdown.lines() {
            if let Some(title) = line.strip_prefix("## Story:") {
                if let Some(story) = current.take() {
                    stories.push(story);
                }
                let title = title.trim().to_string();
                if title.is_empty() {
                    return Err(SpecError::Invalid("story heading without title".into()));
                }
                current = Some(Story {
                    id: slugify(&title),
                    title,
                    description: String::new(),
                    dependencies: Vec::new(),
                });
                continue;
            }
            let Some(story) = current.as_mut() else {
                continue;
            };
            if let Some(id) = line.strip_prefix("Id:") {
                let id = id.trim();
                if !id.is_empty() {
                    story.id = id.to_string();
                }
            } else if let Some(deps) = line.strip_prefix("Depends:") {
                story.dependencies = deps
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from)
                    .collect();
            } else {
                if !story.description.is_empty() {
                    story.description.push('\n');
                }
                story.description.push_str(line);
            }
        }
        if let Some(story) = current {
            stories.push(story);
        }

        for story in &mut stories {
            story.description = story.description.trim().to_string();
        }
        if stories.is_empty() {
            return Err(SpecError::NoStories);
        }
        Ok(stories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stories() -> Vec<Story> {
        vec![
            Story {
                id: "a".into(),
                title: "A".into(),
                description: String::new(),
                dependencies: vec![],
            },
            Story {
                id: "b".into(),
                title: "B".into(),
                description: String::new(),
                dependencies: vec!["a".into()],
            },
            Story {
                id: "c".into(),
                title: "C".into(),
                description: String::new(),
                dependencies: vec!["a".into(), "b".into()],
            },
        ]
    }

    #[test]
    fn readiness_follows_dependencies() {
        let mut queue = StoryQueue::new(stories()).unwrap();
        assert_eq!(queue.next_ready().unwrap().id, "a");

        queue.mark_dispatched("a", "coder-001").unwrap();
        // b waits for a; nothing else is ready.
        assert!(queue.next_ready().is_none());

        queue.mark_done("a");
        assert_eq!(queue.next_ready().unwrap().id, "b");

        // A failed dependency still unblocks dependents: terminal is
        // terminal.
        queue.mark_dispatched("b", "coder-001").unwrap();
        queue.mark_failed("b");
        assert_eq!(queue.next_ready().unwrap().id, "c");
    }

    #[test]
    fn single_owner_per_story() {
        let mut queue = StoryQueue::new(stories()).unwrap();
        queue.mark_dispatched("a", "coder-001").unwrap();
        let err = queue.mark_dispatched("a", "coder-002").unwrap_err();
        assert!(matches!(err, StoryError::AlreadyOwned { .. }));
        assert_eq!(queue.owner("a"), Some("coder-001"));
    }

    #[test]
    fn dispatch_budget_is_capped() {
        let mut queue = StoryQueue::new(stories()).unwrap();
        queue.mark_dispatched("a", "coder-001").unwrap();
        queue.mark_failed("a");
        queue.requeue("a").unwrap();
        queue.mark_dispatched("a", "coder-002").unwrap();
        queue.mark_failed("a");

        // Two dispatches used: the explicit-requeue path is closed.
        let err = queue.requeue("a").unwrap_err();
        assert!(matches!(err, StoryError::DispatchBudgetExhausted(_)));
    }

    #[test]
    fn requeue_rejects_done_stories() {
        let mut queue = StoryQueue::new(stories()).unwrap();
        queue.mark_dispatched("a", "coder-001").unwrap();
        queue.mark_done("a");
        assert!(matches!(
            queue.requeue("a").unwrap_err(),
            StoryError::Terminal(_)
        ));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut dup = stories();
        dup.push(dup[0].clone());
        assert!(matches!(
            StoryQueue::new(dup).unwrap_err(),
            StoryError::DuplicateId(_)
        ));
    }

    #[test]
    fn story_envelope_round_trip() {
        let story = Story {
            id: "health".into(),
            title: "Add /health endpoint".into(),
            description: "Return 200 with build info".into(),
            dependencies: vec![],
        };
        let env = story_envelope("architect-001", "coder-001", &story);
        assert_eq!(env.msg_type, MsgType::Story);
        assert_eq!(env.meta("story_id"), Some("health"));

        let parsed = parse_story_envelope(&env).unwrap();
        assert_eq!(parsed.id, "health");
        assert_eq!(parsed.title, story.title);
        assert_eq!(parsed.description, story.description);
    }

    #[test]
    fn markdown_parser_extracts_stories() {
        let spec = "\
# Demo service

## Story: Add health endpoint
Id: health
Expose GET /health returning 200.

## Story: Add metrics endpoint
Depends: health
Expose GET /metrics.
";
        let stories = MarkdownSpecParser.parse(spec).unwrap();
        assert_eq!(stories.len(), 2);
        assert_eq!(stories[0].id, "health");
        assert_eq!(stories[0].description, "Expose GET /health returning 200.");
        assert_eq!(stories[1].id, "add-metrics-endpoint");
        assert_eq!(stories[1].dependencies, vec!["health".to_string()]);
    }

    #[test]
    fn markdown_parser_rejects_empty_spec() {
        assert!(matches!(
            MarkdownSpecParser.parse("# nothing here\n"),
            Err(SpecError::NoStories)
        ));
    }
}
