//! `RunLedger` — the non-authoritative observability projection of
//! turn execution (timeline of LLM-call/tool-call nodes, durations,
//! status). Never consulted for correctness; `Conversation` remains
//! the sole authoritative aggregate.
//!
//! A bounded in-memory ring plus a JSONL append log (`push_back`/
//! `pop_front` with an index for O(1) lookup by id). No live broadcast
//! channel here — the admin surface is a polling CLI, not a streaming
//! one.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    LlmStream,
    ToolCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNode {
    pub node_id: u32,
    pub kind: NodeKind,
    pub name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub is_error: bool,
}

impl RunNode {
    pub fn start(node_id: u32, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            node_id,
            kind,
            name: name.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            is_error: false,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.is_error = matches!(status, RunStatus::Failed);
        self.ended_at = Some(Utc::now());
        self.duration_ms = Some((Utc::now() - self.started_at).num_milliseconds().max(0) as u64);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub conversation_id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub nodes: Vec<RunNode>,
    pub attempts_used: u32,
}

impl Run {
    pub fn new(conversation_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            agent_id: agent_id.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            nodes: Vec::new(),
            attempts_used: 0,
        }
    }

    pub fn push_node(&mut self, node: RunNode) -> u32 {
        let id = node.node_id;
        self.nodes.push(node);
        id
    }

    pub fn node_mut(&mut self, node_id: u32) -> Option<&mut RunNode> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.duration_ms = Some((Utc::now() - self.started_at).num_milliseconds().max(0) as u64);
    }
}

const MAX_RUNS_IN_MEMORY: usize = 2000;

/// Bounded in-memory ring of recent runs plus an O(1) id index, backed
/// by a JSONL append log for durability across restarts.
pub struct RunLedger {
    inner: RwLock<LedgerInner>,
    log_path: PathBuf,
}

struct LedgerInner {
    runs: VecDeque<Run>,
    index: HashMap<Uuid, usize>,
    base_seq: usize,
}

impl LedgerInner {
    fn new(runs: VecDeque<Run>) -> Self {
        let mut index = HashMap::with_capacity(runs.len());
        for (i, run) in runs.iter().enumerate() {
            index.insert(run.run_id, i);
        }
        Self { runs, index, base_seq: 0 }
    }

    fn deque_idx(&self, seq: usize) -> usize {
        seq - self.base_seq
    }

    fn get_mut(&mut self, run_id: &Uuid) -> Option<&mut Run> {
        let seq = *self.index.get(run_id)?;
        let idx = self.deque_idx(seq);
        self.runs.get_mut(idx)
    }

    fn push_back(&mut self, run: Run) {
        let seq = self.base_seq + self.runs.len();
        self.index.insert(run.run_id, seq);
        self.runs.push_back(run);
    }

    fn pop_front(&mut self) {
        if let Some(run) = self.runs.pop_front() {
            self.index.remove(&run.run_id);
            self.base_seq += 1;
        }
    }
}

impl RunLedger {
    pub fn new(state_dir: &Path) -> Self {
        std::fs::create_dir_all(state_dir).ok();
        let log_path = state_dir.join("runs.jsonl");
        let runs = Self::load_recent(&log_path);
        Self {
            inner: RwLock::new(LedgerInner::new(runs)),
            log_path,
        }
    }

    fn load_recent(path: &Path) -> VecDeque<Run> {
        let mut runs = VecDeque::new();
        if let Ok(content) = std::fs::read_to_string(path) {
            for line in content.lines().rev().take(MAX_RUNS_IN_MEMORY) {
                if let Ok(run) = serde_json::from_str::<Run>(line) {
                    runs.push_front(run);
                }
            }
        }
        runs
    }

    /// Insert a freshly-started run and append it to the JSONL log.
    pub fn insert(&self, run: Run) -> Uuid {
        let run_id = run.run_id;
        self.persist(&run);
        let mut inner = self.inner.write();
        inner.push_back(run);
        if inner.runs.len() > MAX_RUNS_IN_MEMORY {
            inner.pop_front();
        }
        run_id
    }

    /// Mutate a run in place (e.g. to push a node or call `finish`),
    /// then re-append the updated record to the JSONL log. Re-appending
    /// rather than rewriting in place keeps every intermediate state on
    /// disk; `load_recent` only keeps the newest line per run_id is not
    /// guaranteed, so callers should treat the ledger as log-structured,
    /// not as a point-in-time source of truth — consistent with it being
    /// a non-authoritative projection.
    pub fn update<F>(&self, run_id: &Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Run),
    {
        let mut inner = self.inner.write();
        let Some(run) = inner.get_mut(run_id) else {
            return false;
        };
        f(run);
        let snapshot = run.clone();
        drop(inner);
        self.persist(&snapshot);
        true
    }

    pub fn get(&self, run_id: &Uuid) -> Option<Run> {
        let inner = self.inner.read();
        let seq = *inner.index.get(run_id)?;
        let idx = inner.deque_idx(seq);
        inner.runs.get(idx).cloned()
    }

    /// List the most recent runs for a conversation, newest first.
    pub fn list_for_conversation(&self, conversation_id: &str, limit: usize) -> Vec<Run> {
        self.inner
            .read()
            .runs
            .iter()
            .rev()
            .filter(|r| r.conversation_id == conversation_id)
            .take(limit)
            .cloned()
            .collect()
    }

    fn persist(&self, run: &Run) {
        if let Ok(json) = serde_json::to_string(run) {
            if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(&self.log_path) {
                let _ = writeln!(file, "{json}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::new(dir.path());
        let run = Run::new("c1", "executor");
        let id = ledger.insert(run);
        let fetched = ledger.get(&id).unwrap();
        assert_eq!(fetched.conversation_id, "c1");
        assert_eq!(fetched.status, RunStatus::Running);
    }

    #[test]
    fn update_finishes_a_run_and_marks_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::new(dir.path());
        let id = ledger.insert(Run::new("c1", "executor"));
        let found = ledger.update(&id, |r| r.finish(RunStatus::Completed));
        assert!(found);
        let run = ledger.get(&id).unwrap();
        assert!(run.status.is_terminal());
        assert!(run.duration_ms.is_some());
    }

    #[test]
    fn nodes_track_tool_call_timeline_within_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::new(dir.path());
        let id = ledger.insert(Run::new("c1", "executor"));
        ledger.update(&id, |r| {
            let node_id = r.push_node(RunNode::start(1, NodeKind::ToolCall, "echo"));
            r.node_mut(node_id).unwrap().finish(RunStatus::Completed);
        });
        let run = ledger.get(&id).unwrap();
        assert_eq!(run.nodes.len(), 1);
        assert_eq!(run.nodes[0].status, RunStatus::Completed);
    }

    #[test]
    fn ledger_reloads_persisted_runs_from_jsonl_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let ledger = RunLedger::new(dir.path());
            ledger.insert(Run::new("c1", "executor"))
        };
        let reloaded = RunLedger::new(dir.path());
        assert!(reloaded.get(&id).is_some());
    }

    #[test]
    fn list_for_conversation_filters_by_conversation_id() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::new(dir.path());
        ledger.insert(Run::new("c1", "executor"));
        ledger.insert(Run::new("c2", "executor"));
        let runs = ledger.list_for_conversation("c1", 10);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].conversation_id, "c1");
    }
}
