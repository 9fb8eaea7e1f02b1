//! `ConversationStore` — the per-conversation aggregate owner.
//!
//! Persistence is atomic *per conversation*: every mutating call that
//! the caller wants durable goes through [`ConversationStore::save`],
//! which writes to a temp file and renames it into place. A separate
//! lightweight index tracks `{id, title, phase, updated_at, archived}`
//! for listing, guarded by its own mutex so concurrent index updates
//! never race ("persist on every mutation", generalized to a
//! keyed-file-per-record layout).
//!
//! This crate does *not* itself enforce the single-writer-per-conversation
//! discipline — that is the per-conversation serialized work queue
//! owned by `tenex-runtime`/`tenex-kernel`. `ConversationStore` is the
//! thing that queue serializes access to.

mod index;
mod persist;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use tenex_domain::model::{
    AgentCursor, AgentId, Completion, Conversation, ConversationId, Event, OrchestratorTurn,
    Phase, PhaseTransition, ProjectId,
};

pub use index::IndexEntry;

/// Error surface for store operations: persistence failures and
/// schema-corruption-on-load are the two kinds callers distinguish on.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),
    #[error("turn not found: {0}")]
    TurnNotFound(String),
    #[error("persistence: {0}")]
    Persistence(String),
    #[error("schema corruption: {0}")]
    SchemaCorruption(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The conversation aggregate store. Cheaply `Clone`-able — internally
/// `Arc`-backed — so every crate that needs access shares one instance.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    index: RwLock<Vec<IndexEntry>>,
    /// Serializes index-file writes so concurrent `save()` calls never
    /// interleave a partial index and lose an update.
    index_write_lock: parking_lot::Mutex<()>,
}

impl ConversationStore {
    /// Open (but do not yet populate) a store rooted at `root`. Call
    /// [`ConversationStore::load_all`] to hydrate from disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                conversations: RwLock::new(HashMap::new()),
                index: RwLock::new(Vec::new()),
                index_write_lock: parking_lot::Mutex::new(()),
            }),
        }
    }

    fn conversations_dir(&self) -> PathBuf {
        self.inner.root.join("conversations")
    }

    fn conversation_path(&self, id: &str) -> PathBuf {
        self.conversations_dir().join(format!("{id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.conversations_dir().join("index.json")
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.inner.conversations.read().get(id).cloned()
    }

    pub fn list_index(&self) -> Vec<IndexEntry> {
        self.inner.index.read().clone()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.inner.conversations.read().contains_key(id)
    }

    /// Every conversation id currently held in memory. Used by recovery
    /// to tell a queued or locked conversation that genuinely still
    /// exists apart from one whose backing file is gone.
    pub fn known_ids(&self) -> std::collections::HashSet<ConversationId> {
        self.inner.conversations.read().keys().cloned().collect()
    }

    // ── Mutations (in-memory; caller calls `save` to persist) ────────

    /// Create a brand-new conversation. No-op (returns the existing
    /// one) if `id` is already known — callers should prefer
    /// `get_or_create` at ingress time.
    pub fn create(&self, id: ConversationId, project_id: ProjectId, now: DateTime<Utc>) -> Conversation {
        let mut map = self.inner.conversations.write();
        if let Some(existing) = map.get(&id) {
            return existing.clone();
        }
        let conv = Conversation::new(id.clone(), project_id, now);
        map.insert(id.clone(), conv.clone());
        drop(map);
        self.upsert_index(&conv);
        tenex_domain::trace::TraceEvent::ConversationCreated {
            conversation_id: conv.id.clone(),
            project_id: conv.project_id.clone(),
        }
        .emit();
        conv
    }

    /// Create the conversation if unknown, else return the existing
    /// one. Conversations are created on the first event targeting a
    /// previously-unknown id.
    pub fn get_or_create(
        &self,
        id: &str,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> Conversation {
        if let Some(c) = self.get(id) {
            return c;
        }
        self.create(id.to_string(), project_id.to_string(), now)
    }

    /// Append one event. The history is append-only and indices never
    /// change once assigned. If the conversation's last phase transition
    /// reached a terminal state implicitly (orchestrator routed `END`),
    /// appending here does not itself reopen anything — that is the
    /// orchestrator's job on its next routing pass.
    pub fn append_event(&self, id: &str, event: Event, now: DateTime<Utc>) -> Result<usize> {
        let mut map = self.inner.conversations.write();
        let conv = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        conv.history.push(event.clone());
        conv.updated_at = now;
        // A fresh event is treated as the operator weighing back in;
        // it is the only thing that clears an awaiting-operator turn.
        conv.awaiting_operator = false;
        let len = conv.history.len();
        let snapshot = conv.clone();
        drop(map);
        self.upsert_index(&snapshot);
        tenex_domain::trace::TraceEvent::EventIngested {
            conversation_id: id.to_string(),
            event_id: event.id,
            history_len: len,
        }
        .emit();
        Ok(len)
    }

    /// Update an agent's cursor. `last_seen_index` is clamped to
    /// `0..=len(history)` rather than erroring — a caller that races a
    /// concurrent append should not crash the turn over a now-larger
    /// history.
    pub fn update_cursor(
        &self,
        id: &str,
        agent: &str,
        cursor: AgentCursor,
    ) -> Result<()> {
        let mut map = self.inner.conversations.write();
        let conv = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let clamped = AgentCursor {
            last_seen_index: cursor.last_seen_index.min(conv.history.len()),
            session_token: cursor.session_token,
        };
        conv.agent_cursors.insert(agent.to_string(), clamped);
        Ok(())
    }

    pub fn start_turn(&self, id: &str, turn: OrchestratorTurn) -> Result<()> {
        let mut map = self.inner.conversations.write();
        let conv = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        conv.orchestrator_turns.push(turn);
        Ok(())
    }

    /// Record one agent's completion of the current (last, incomplete)
    /// turn. Marks the turn `completed` once every target agent has
    /// contributed; once true the turn is immutable, so this call is a
    /// no-op if the turn is already completed.
    pub fn add_completion(
        &self,
        id: &str,
        turn_id: &str,
        agent: &AgentId,
        summary: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut map = self.inner.conversations.write();
        let conv = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let turn = conv
            .orchestrator_turns
            .iter_mut()
            .find(|t| t.turn_id == turn_id)
            .ok_or_else(|| StoreError::TurnNotFound(turn_id.to_string()))?;
        if turn.completed {
            return Ok(true);
        }
        if !turn.completions.iter().any(|c| &c.agent_id == agent) {
            turn.completions.push(Completion {
                agent_id: agent.clone(),
                summary,
                metadata,
                at: now,
            });
        }
        turn.completed = turn.is_fully_completed();
        Ok(turn.completed)
    }

    /// Append a phase transition and update `conversation.phase`.
    /// Legality of the transition graph is `tenex-runtime`'s
    /// responsibility — this call trusts the caller already validated
    /// it, mirroring the separation between "validate" and "apply"
    /// elsewhere in the kernel.
    pub fn record_transition(&self, id: &str, transition: PhaseTransition) -> Result<()> {
        let mut map = self.inner.conversations.write();
        let conv = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let to = transition.to;
        conv.phase = to;
        if to == Phase::Chat && transition.from == Phase::Reflection {
            conv.metadata.remove("readFiles");
        }
        conv.phase_transitions.push(transition);
        let snapshot = conv.clone();
        drop(map);
        self.upsert_index(&snapshot);
        Ok(())
    }

    pub fn set_execution_active(&self, id: &str, active: bool, started_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut map = self.inner.conversations.write();
        let conv = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        conv.execution_time.active = active;
        if active {
            conv.execution_time.started_at = started_at;
        } else if let Some(start) = conv.execution_time.started_at.take() {
            let now = started_at.unwrap_or_else(Utc::now);
            conv.execution_time.total_ms += (now - start).num_milliseconds().max(0) as u64;
        }
        Ok(())
    }

    /// Mark (or clear) the conversation as awaiting operator
    /// intervention. Does not itself append anything or change
    /// `phase` — `drive_conversation` consults this flag to decide
    /// whether to keep routing.
    pub fn set_awaiting_operator(&self, id: &str, value: bool) -> Result<()> {
        let mut map = self.inner.conversations.write();
        let conv = map.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        conv.awaiting_operator = value;
        Ok(())
    }

    pub fn archive(&self, id: &str) -> Result<()> {
        if !self.exists(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let mut index = self.inner.index.write();
        if let Some(entry) = index.iter_mut().find(|e| e.id == id) {
            entry.archived = true;
        }
        Ok(())
    }

    // ── Persistence ───────────────────────────────────────────────

    /// Persist one conversation atomically (write-to-temp, then
    /// rename). Bubbles `StoreError::Persistence` on failure — callers
    /// retry once, then surface an error event and continue.
    pub fn save(&self, id: &str) -> Result<()> {
        let conv = self.get(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        std::fs::create_dir_all(self.conversations_dir())
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        persist::write_atomic(&self.conversation_path(id), &conv)
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        self.persist_index()?;
        Ok(())
    }

    fn upsert_index(&self, conv: &Conversation) {
        let mut index = self.inner.index.write();
        let mut entry = IndexEntry::from(conv);
        if let Some(existing) = index.iter_mut().find(|e| e.id == conv.id) {
            entry.archived = existing.archived;
            *existing = entry;
        } else {
            index.push(entry);
        }
    }

    fn persist_index(&self) -> Result<()> {
        let _guard = self.inner.index_write_lock.lock();
        let snapshot = self.inner.index.read().clone();
        std::fs::create_dir_all(self.conversations_dir())
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        persist::write_atomic(&self.index_path(), &snapshot)
            .map_err(|e| StoreError::Persistence(e.to_string()))
    }

    /// Reconstruct every conversation from durable state. Conversations
    /// whose structural validation fails are skipped and logged
    /// (SchemaCorruption); the rest of the system continues. Resets
    /// `execution_time.active` on every loaded conversation regardless
    /// of its persisted value, since an active flag can never have
    /// survived a restart truthfully.
    pub fn load_all(&self) -> Result<LoadReport> {
        let dir = self.conversations_dir();
        if !dir.exists() {
            return Ok(LoadReport::default());
        }
        let mut loaded = 0usize;
        let mut skipped = 0usize;
        let mut map = self.inner.conversations.write();
        let entries = std::fs::read_dir(&dir).map_err(|e| StoreError::Persistence(e.to_string()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some("index.json") {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match persist::read_json::<Conversation>(&path) {
                Ok(mut conv) => {
                    if !structurally_valid(&conv) {
                        tracing::warn!(path = %path.display(), "skipping structurally invalid conversation");
                        skipped += 1;
                        continue;
                    }
                    conv.execution_time.active = false;
                    map.insert(conv.id.clone(), conv);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable conversation file");
                    skipped += 1;
                }
            }
        }
        drop(map);

        // Rebuild the index from what actually loaded — the on-disk
        // index file is a cache, not the source of truth.
        let rebuilt: Vec<IndexEntry> = self
            .inner
            .conversations
            .read()
            .values()
            .map(IndexEntry::from)
            .collect();
        *self.inner.index.write() = rebuilt;
        let _ = self.persist_index();

        Ok(LoadReport { loaded, skipped })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
}

/// Minimal structural validation applied at load time: history index
/// stability is implicit in the serialized `Vec` order, so the only
/// thing worth re-checking here is that no cursor claims to have seen
/// more than exists.
fn structurally_valid(conv: &Conversation) -> bool {
    conv.agent_cursors
        .values()
        .all(|c| c.last_seen_index <= conv.history.len())
}

pub fn conversations_root(base: &Path) -> PathBuf {
    base.join("conversations")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenex_domain::model::TransitionInitiator;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        let a = store.create("c1".into(), "proj".into(), now());
        let b = store.create("c1".into(), "proj".into(), now());
        assert_eq!(a.id, b.id);
        assert_eq!(store.list_index().len(), 1);
    }

    #[test]
    fn append_event_grows_history_and_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.create("c1".into(), "proj".into(), now());
        for i in 0..3 {
            store
                .append_event(
                    "c1",
                    Event {
                        id: format!("e{i}"),
                        author_key: "u".into(),
                        kind: 1,
                        content: format!("m{i}"),
                        tags: vec![],
                        created_at: now(),
                    },
                    now(),
                )
                .unwrap();
        }
        let conv = store.get("c1").unwrap();
        assert_eq!(conv.history.len(), 3);
        assert_eq!(conv.history[0].id, "e0");
        assert_eq!(conv.history[2].id, "e2");
    }

    #[test]
    fn cursor_is_clamped_to_history_len() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.create("c1".into(), "proj".into(), now());
        store
            .update_cursor(
                "c1",
                "agent-a",
                AgentCursor {
                    last_seen_index: 999,
                    session_token: None,
                },
            )
            .unwrap();
        let conv = store.get("c1").unwrap();
        assert_eq!(conv.agent_cursors["agent-a"].last_seen_index, 0);
    }

    #[test]
    fn turn_completes_only_once_all_targets_respond() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.create("c1".into(), "proj".into(), now());
        store
            .start_turn(
                "c1",
                OrchestratorTurn {
                    turn_id: "t1".into(),
                    started_at: now(),
                    phase: Phase::Chat,
                    target_agents: vec!["a".into(), "b".into()],
                    reason: None,
                    completions: vec![],
                    completed: false,
                },
            )
            .unwrap();
        assert!(!store
            .add_completion("c1", "t1", &"a".to_string(), None, HashMap::new(), now())
            .unwrap());
        assert!(store
            .add_completion("c1", "t1", &"b".to_string(), None, HashMap::new(), now())
            .unwrap());
        let conv = store.get("c1").unwrap();
        assert!(conv.orchestrator_turns[0].completed);
    }

    #[test]
    fn save_then_load_round_trips_structurally() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.create("c1".into(), "proj".into(), now());
        store
            .append_event(
                "c1",
                Event {
                    id: "e0".into(),
                    author_key: "u".into(),
                    kind: 1,
                    content: "hi".into(),
                    tags: vec![],
                    created_at: now(),
                },
                now(),
            )
            .unwrap();
        store.set_execution_active("c1", true, Some(now())).unwrap();
        store.save("c1").unwrap();

        let reloaded = ConversationStore::new(dir.path());
        let report = reloaded.load_all().unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped, 0);

        let original = store.get("c1").unwrap();
        let mut after = reloaded.get("c1").unwrap();
        // executionTime.active resets on load; everything else must
        // be structurally equal.
        assert!(after.execution_time.active == false);
        after.execution_time.active = original.execution_time.active;
        assert_eq!(original.history.len(), after.history.len());
        assert_eq!(original.id, after.id);
        assert_eq!(original.phase, after.phase);
    }

    #[test]
    fn append_event_clears_awaiting_operator() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.create("c1".into(), "proj".into(), now());
        store.set_awaiting_operator("c1", true).unwrap();
        assert!(store.get("c1").unwrap().awaiting_operator);
        store
            .append_event(
                "c1",
                Event {
                    id: "e0".into(),
                    author_key: "u".into(),
                    kind: 1,
                    content: "hi".into(),
                    tags: vec![],
                    created_at: now(),
                },
                now(),
            )
            .unwrap();
        assert!(!store.get("c1").unwrap().awaiting_operator);
    }

    #[test]
    fn reflection_to_chat_clears_read_files_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        store.create("c1".into(), "proj".into(), now());
        {
            let mut map = store.inner.conversations.write();
            let conv = map.get_mut("c1").unwrap();
            conv.phase = Phase::Reflection;
            conv.metadata.insert("readFiles".into(), serde_json::json!(["a.rs"]));
        }
        store
            .record_transition(
                "c1",
                PhaseTransition {
                    from: Phase::Reflection,
                    to: Phase::Chat,
                    initiator: TransitionInitiator::Orchestrator,
                    reason: None,
                    summary: None,
                    at: now(),
                },
            )
            .unwrap();
        let conv = store.get("c1").unwrap();
        assert!(!conv.metadata.contains_key("readFiles"));
        assert_eq!(conv.phase, Phase::Chat);
    }
}
