//! Process-unique id generation for envelopes and correlation metadata.
//!
//! Ids are `<tag>-<nanos>-<seq>`: sortable by creation time, unique even when
//! two ids land in the same nanosecond.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn stamped(tag: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{tag}-{nanos}-{seq}")
}

/// Id for a new envelope.
pub fn next_message_id() -> String {
    stamped("msg")
}

/// Correlation id for a question effect.
pub fn generate_question_id() -> String {
    stamped("question")
}

/// Correlation id for an approval effect.
pub fn generate_approval_id() -> String {
    stamped("approval")
}

/// General-purpose correlation id.
pub fn generate_correlation_id() -> String {
    stamped("corr")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_tagged() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = generate_correlation_id();
            assert!(id.starts_with("corr-"));
            assert!(seen.insert(id), "duplicate correlation id");
        }
        assert!(generate_question_id().starts_with("question-"));
        assert!(generate_approval_id().starts_with("approval-"));
        assert!(next_message_id().starts_with("msg-"));
    }
}
