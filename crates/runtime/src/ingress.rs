//! `EventIngress` — the boundary between the raw `Bus` and the
//! authoritative `ConversationStore`. Never fails: a malformed or
//! unwanted event is logged and dropped, not propagated as an error.
//!
//! Follows an inbound-dedup idiom keyed by `(author_key, event_id)` so
//! a bus re-subscribe replaying recent history never double-appends.

use std::collections::HashSet;

use chrono::Utc;
use parking_lot::Mutex;

use tenex_domain::model::Event;
use tenex_store::ConversationStore;

/// Bus event kinds `EventIngress` never hands to a conversation:
/// presence/status/typing chatter that carries no content worth
/// appending to history. Kept as a closed const list rather than
/// config — these are protocol-level, not deployment-level.
const IGNORED_KINDS: &[u32] = &[crate::publisher::KIND_TYPING];

/// Tag names `EventIngress` checks, in order, to resolve which
/// conversation an inbound event belongs to.
const CONVERSATION_TAG_NAMES: &[&str] = &["e", "E", "d"];

pub enum IngressOutcome {
    /// Appended to `conversation_id` at index `history_index`; caller
    /// should wake the per-conversation scheduler for that id.
    Appended {
        conversation_id: String,
        history_index: usize,
    },
    Dropped {
        reason: String,
    },
}

/// Ingests raw bus events into the store, deduplicating and filtering
/// before anything reaches `ConversationStore::append_event`.
pub struct EventIngress {
    store: ConversationStore,
    project_id: String,
    local_agent_keys: HashSet<String>,
    /// `(author_key, event_id)` pairs already ingested, to survive a
    /// `Bus` re-subscribe replaying recent history.
    seen: Mutex<HashSet<(String, String)>>,
}

impl EventIngress {
    pub fn new(
        store: ConversationStore,
        project_id: impl Into<String>,
        local_agent_keys: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            store,
            project_id: project_id.into(),
            local_agent_keys: local_agent_keys.into_iter().collect(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Process one inbound event. Never returns an error — every
    /// failure mode is represented as `IngressOutcome::Dropped` with a
    /// reason, logged via `TraceEvent::EventDropped`.
    pub fn ingest(&self, event: Event) -> IngressOutcome {
        if IGNORED_KINDS.contains(&event.kind) {
            return self.drop_event(&event.id, "ignored kind");
        }
        if self.local_agent_keys.contains(&event.author_key) {
            return self.drop_event(&event.id, "self-authored");
        }
        let dedup_key = (event.author_key.clone(), event.id.clone());
        if !self.seen.lock().insert(dedup_key) {
            return self.drop_event(&event.id, "duplicate (author_key, id)");
        }

        let Some(conversation_id) = resolve_conversation_id(&event) else {
            return self.drop_event(&event.id, "no e/E/d tag to resolve a conversation id");
        };

        self.store
            .get_or_create(&conversation_id, &self.project_id, Utc::now());
        match self.store.append_event(&conversation_id, event.clone(), Utc::now()) {
            Ok(history_index) => IngressOutcome::Appended {
                conversation_id,
                history_index,
            },
            Err(e) => self.drop_event(&event.id, &format!("append failed: {e}")),
        }
    }

    fn drop_event(&self, event_id: &str, reason: &str) -> IngressOutcome {
        tenex_domain::trace::TraceEvent::EventDropped {
            event_id: event_id.to_string(),
            reason: reason.to_string(),
        }
        .emit();
        IngressOutcome::Dropped {
            reason: reason.to_string(),
        }
    }
}

fn resolve_conversation_id(event: &Event) -> Option<String> {
    for tag_name in CONVERSATION_TAG_NAMES {
        if let Some(tag) = event.tags.iter().find(|t| t.first().map(String::as_str) == Some(tag_name)) {
            if let Some(value) = tag.get(1) {
                if !value.is_empty() {
                    return Some(value.clone());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, author: &str, kind: u32, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: id.to_string(),
            author_key: author.to_string(),
            kind,
            content: "hi".to_string(),
            tags,
            created_at: Utc::now(),
        }
    }

    fn ingress() -> EventIngress {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        EventIngress::new(store, "proj", vec!["local-agent-key".to_string()])
    }

    #[test]
    fn appends_and_resolves_conversation_from_e_tag() {
        let ingress = ingress();
        let outcome = ingress.ingest(event("e1", "user1", 1, vec![vec!["e".into(), "conv-1".into()]]));
        match outcome {
            IngressOutcome::Appended { conversation_id, history_index } => {
                assert_eq!(conversation_id, "conv-1");
                assert_eq!(history_index, 1);
            }
            IngressOutcome::Dropped { reason } => panic!("unexpected drop: {reason}"),
        }
    }

    #[test]
    fn drops_self_authored_events() {
        let ingress = ingress();
        let outcome = ingress.ingest(event(
            "e1",
            "local-agent-key",
            1,
            vec![vec!["e".into(), "conv-1".into()]],
        ));
        assert!(matches!(outcome, IngressOutcome::Dropped { .. }));
    }

    #[test]
    fn drops_ignored_kinds() {
        let ingress = ingress();
        let outcome = ingress.ingest(event(
            "e1",
            "user1",
            crate::publisher::KIND_TYPING,
            vec![vec!["e".into(), "conv-1".into()]],
        ));
        assert!(matches!(outcome, IngressOutcome::Dropped { .. }));
    }

    #[test]
    fn drops_events_with_no_resolvable_conversation_id() {
        let ingress = ingress();
        let outcome = ingress.ingest(event("e1", "user1", 1, vec![]));
        assert!(matches!(outcome, IngressOutcome::Dropped { .. }));
    }

    #[test]
    fn duplicate_author_and_id_is_dropped_on_replay() {
        let ingress = ingress();
        let first = ingress.ingest(event("e1", "user1", 1, vec![vec!["e".into(), "conv-1".into()]]));
        assert!(matches!(first, IngressOutcome::Appended { .. }));
        let second = ingress.ingest(event("e1", "user1", 1, vec![vec!["e".into(), "conv-1".into()]]));
        assert!(matches!(second, IngressOutcome::Dropped { .. }));
    }

    #[test]
    fn falls_back_through_tag_priority_e_then_cap_e_then_d() {
        let ingress = ingress();
        let outcome = ingress.ingest(event(
            "e1",
            "user1",
            1,
            vec![vec!["d".into(), "conv-from-d".into()]],
        ));
        match outcome {
            IngressOutcome::Appended { conversation_id, .. } => assert_eq!(conversation_id, "conv-from-d"),
            IngressOutcome::Dropped { reason } => panic!("unexpected drop: {reason}"),
        }
    }
}
