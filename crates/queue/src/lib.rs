//! `ExecutionQueue` — the per-project Execute-phase mutex.
//!
//! One [`Lock`] may be held per project at a time; every other
//! conversation wanting to enter Execute waits in a persisted, strictly
//! FIFO `queue`. A single-holder-plus-waiters shape, generalized from
//! an unordered per-session semaphore to an explicit, ordered,
//! persisted queue with ETA accounting; storage follows an
//! `RwLock<HashMap<_, _>>` + persist-on-every-mutation idiom.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tenex_domain::model::{ConversationId, Lock, ProjectId, QueueEntry};

const DEFAULT_TIMEOUT_MS: u64 = 30 * 60 * 1000;
const DEFAULT_AVG_EXEC_MS: u64 = 10 * 60 * 1000;

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("project has no tracked execution state: {0}")]
    UnknownProject(ProjectId),
    #[error("conversation {0} does not hold the lock for project {1}")]
    NotHolder(ConversationId, ProjectId),
    #[error("persistence failed after retry: {0}")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Result of `request_execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteGrant {
    pub granted: bool,
    /// 1-based position in the wait queue, `None` when granted.
    pub position: Option<usize>,
    pub eta_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ProjectState {
    lock: Option<Lock>,
    queue: Vec<QueueEntry>,
    /// Rolling average of completed hold durations, seeded with the
    /// configured default (10 minutes when no history exists yet).
    avg_exec_ms: u64,
    samples: u32,
}

impl ProjectState {
    fn new(default_avg_ms: u64) -> Self {
        Self {
            lock: None,
            queue: Vec::new(),
            avg_exec_ms: default_avg_ms,
            samples: 0,
        }
    }

    fn record_hold_duration(&mut self, ms: u64) {
        let total = self.avg_exec_ms.saturating_mul(self.samples as u64) + ms;
        self.samples += 1;
        self.avg_exec_ms = total / self.samples as u64;
    }
}

#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    default_avg_ms: u64,
    timeout_ms: u64,
    states: RwLock<HashMap<ProjectId, ProjectState>>,
}

impl ExecutionQueue {
    /// `max_duration_ms` seeds every lock this instance grants
    /// (`lock.max_duration_ms` in config); `None` falls back to a
    /// default of 30 minutes.
    pub fn new(root: impl Into<PathBuf>, default_avg_exec_ms: Option<u64>, max_duration_ms: Option<u64>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                default_avg_ms: default_avg_exec_ms.unwrap_or(DEFAULT_AVG_EXEC_MS),
                timeout_ms: max_duration_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
                states: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn state_path(&self, project_id: &str) -> PathBuf {
        self.inner.root.join("execution").join(format!("{project_id}.json"))
    }

    fn with_state<R>(&self, project_id: &str, f: impl FnOnce(&mut ProjectState) -> R) -> R {
        let mut states = self.inner.states.write();
        let state = states
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectState::new(self.inner.default_avg_ms));
        f(state)
    }

    /// Request entry into Execute for `conversation_id`. Re-entrant:
    /// a conversation that already holds the lock is granted again
    /// without disturbing the queue.
    pub fn request_execute(
        &self,
        project_id: &str,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ExecuteGrant> {
        let grant = self.with_state(project_id, |state| {
            if let Some(lock) = &state.lock {
                if lock.conversation_id == conversation_id {
                    return ExecuteGrant {
                        granted: true,
                        position: None,
                        eta_ms: None,
                    };
                }
                if let Some(pos) = state.queue.iter().position(|e| e.conversation_id == conversation_id) {
                    let eta = Self::eta_for(state, &lock.acquired_at, now, pos + 1);
                    return ExecuteGrant {
                        granted: false,
                        position: Some(pos + 1),
                        eta_ms: Some(eta),
                    };
                }
                state.queue.push(QueueEntry {
                    conversation_id: conversation_id.to_string(),
                    held_by: lock.conversation_id.clone(),
                    enqueued_at: now,
                    retries: 0,
                });
                state.queue.sort_by(|a, b| {
                    a.enqueued_at
                        .cmp(&b.enqueued_at)
                        .then_with(|| a.conversation_id.cmp(&b.conversation_id))
                });
                let pos = state
                    .queue
                    .iter()
                    .position(|e| e.conversation_id == conversation_id)
                    .unwrap();
                let eta = Self::eta_for(state, &lock.acquired_at, now, pos + 1);
                ExecuteGrant {
                    granted: false,
                    position: Some(pos + 1),
                    eta_ms: Some(eta),
                }
            } else {
                state.lock = Some(Lock {
                    conversation_id: conversation_id.to_string(),
                    held_by: conversation_id.to_string(),
                    acquired_at: now,
                    max_duration_ms: self.inner.timeout_ms,
                    project_id: project_id.to_string(),
                });
                tenex_domain::trace::TraceEvent::LockAcquired {
                    project_id: project_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                }
                .emit();
                ExecuteGrant {
                    granted: true,
                    position: None,
                    eta_ms: None,
                }
            }
        });
        self.persist(project_id)?;
        Ok(grant)
    }

    fn eta_for(state: &ProjectState, acquired_at: &DateTime<Utc>, now: DateTime<Utc>, position: usize) -> u64 {
        let age_ms = (now - *acquired_at).num_milliseconds().max(0) as u64;
        let remaining = state.avg_exec_ms.saturating_sub(age_ms);
        remaining + (position as u64).saturating_mul(state.avg_exec_ms)
    }

    /// Release the lock iff `conversation_id` holds it, then promote
    /// the queue head.
    pub fn release_execute(&self, project_id: &str, conversation_id: &str, now: DateTime<Utc>) -> Result<()> {
        let held = self.with_state(project_id, |state| {
            match &state.lock {
                Some(lock) if lock.conversation_id == conversation_id => {
                    let hold_ms = (now - lock.acquired_at).num_milliseconds().max(0) as u64;
                    state.record_hold_duration(hold_ms);
                    true
                }
                _ => false,
            }
        });
        if !held {
            return Err(QueueError::NotHolder(conversation_id.to_string(), project_id.to_string()));
        }
        self.clear_and_promote(project_id, "released", now);
        self.persist(project_id)?;
        Ok(())
    }

    /// Administrative: clear the lock unconditionally and promote the
    /// queue head, regardless of who holds it.
    pub fn force_release(&self, project_id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.clear_and_promote(project_id, reason, now);
        self.persist(project_id)?;
        Ok(())
    }

    /// Equivalent to `force_release` with `reason = "timeout"`, but
    /// only takes effect if the current lock has actually expired.
    pub fn on_timeout(&self, project_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let expired = self.with_state(project_id, |state| {
            state.lock.as_ref().is_some_and(|l| l.is_expired(now))
        });
        if expired {
            self.clear_and_promote(project_id, "timeout", now);
            self.persist(project_id)?;
        }
        Ok(expired)
    }

    fn clear_and_promote(&self, project_id: &str, reason: &str, now: DateTime<Utc>) {
        let released_conv = self.with_state(project_id, |state| {
            let released = state.lock.take().map(|l| l.conversation_id);
            if !state.queue.is_empty() {
                let next = state.queue.remove(0);
                state.lock = Some(Lock {
                    conversation_id: next.conversation_id.clone(),
                    held_by: next.conversation_id.clone(),
                    acquired_at: now,
                    max_duration_ms: self.inner.timeout_ms,
                    project_id: project_id.to_string(),
                });
                Some((released, Some(next.conversation_id)))
            } else {
                Some((released, None))
            }
        });
        if let Some((released, promoted)) = released_conv {
            if let Some(conv) = released {
                tenex_domain::trace::TraceEvent::LockReleased {
                    project_id: project_id.to_string(),
                    conversation_id: conv,
                    reason: reason.to_string(),
                }
                .emit();
            }
            if let Some(conv) = promoted {
                tenex_domain::trace::TraceEvent::QueuePromoted {
                    project_id: project_id.to_string(),
                    conversation_id: conv,
                }
                .emit();
            }
        }
    }

    pub fn queue_len(&self, project_id: &str) -> usize {
        self.with_state(project_id, |s| s.queue.len())
    }

    /// Every project this queue currently tracks state for, for the
    /// `queue status` admin command, which reports across all
    /// projects rather than one at a time.
    pub fn known_projects(&self) -> Vec<ProjectId> {
        self.inner.states.read().keys().cloned().collect()
    }

    pub fn current_holder(&self, project_id: &str) -> Option<ConversationId> {
        self.with_state(project_id, |s| s.lock.as_ref().map(|l| l.conversation_id.clone()))
    }

    pub fn remove_from_queue(&self, project_id: &str, conversation_id: &str) -> bool {
        let removed = self.with_state(project_id, |state| {
            let before = state.queue.len();
            state.queue.retain(|e| e.conversation_id != conversation_id);
            before != state.queue.len()
        });
        if removed {
            let _ = self.persist(project_id);
        }
        removed
    }

    fn persist(&self, project_id: &str) -> Result<()> {
        let snapshot = self.with_state(project_id, |s| s.clone());
        let dir = self.inner.root.join("execution");
        let path = self.state_path(project_id);
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let tmp = path.with_extension("json.tmp");
            let bytes = serde_json::to_vec_pretty(&snapshot)?;
            {
                use std::io::Write;
                let mut f = std::fs::File::create(&tmp)?;
                f.write_all(&bytes)?;
                f.sync_all()?;
            }
            std::fs::rename(&tmp, &path)
        };
        // Persistence errors during lock mutation are retried once
        // before denying the request.
        if write().is_err() && write().is_err() {
            return Err(QueueError::Transient(format!(
                "failed to persist execution state for project {project_id}"
            )));
        }
        Ok(())
    }

    /// Reconstruct all project states from disk. Called by
    /// `RecoveryCoordinator` with the set of conversation ids the
    /// conversation store actually has on hand: a lock is released if
    /// it is expired or its holder is missing from `known_conversations`,
    /// and a queue entry is dropped if its conversation is missing,
    /// never replayed.
    pub fn load_all(
        &self,
        now: DateTime<Utc>,
        known_conversations: &HashSet<ConversationId>,
    ) -> std::io::Result<(usize, usize, usize)> {
        let dir = self.inner.root.join("execution");
        if !dir.exists() {
            return Ok((0, 0, 0));
        }
        let mut projects_loaded = 0usize;
        let mut locks_released = 0usize;
        let mut queue_entries_dropped = 0usize;
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(project_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let raw = std::fs::read_to_string(&path)?;
            let Ok(mut state) = serde_json::from_str::<ProjectState>(&raw) else {
                queue_entries_dropped += 1;
                continue;
            };
            if let Some(lock) = &state.lock {
                if lock.is_expired(now) || !known_conversations.contains(&lock.conversation_id) {
                    locks_released += 1;
                    state.lock = None;
                }
            }
            let before = state.queue.len();
            state.queue.retain(|e| known_conversations.contains(&e.conversation_id));
            queue_entries_dropped += before - state.queue.len();
            if state.lock.is_none() && !state.queue.is_empty() {
                let next = state.queue.remove(0);
                state.lock = Some(Lock {
                    conversation_id: next.conversation_id.clone(),
                    held_by: next.conversation_id,
                    acquired_at: now,
                    max_duration_ms: self.inner.timeout_ms,
                    project_id: project_id.clone(),
                });
            }
            projects_loaded += 1;
            self.inner.states.write().insert(project_id, state);
        }
        Ok((projects_loaded, locks_released, queue_entries_dropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms_from_epoch: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms_from_epoch).unwrap()
    }

    #[test]
    fn first_requester_is_granted_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let q = ExecutionQueue::new(dir.path(), None, None);
        let grant = q.request_execute("p1", "c1", t(0)).unwrap();
        assert!(grant.granted);
        assert_eq!(grant.position, None);
    }

    #[test]
    fn re_entrant_request_stays_granted_without_enqueueing() {
        let dir = tempfile::tempdir().unwrap();
        let q = ExecutionQueue::new(dir.path(), None, None);
        q.request_execute("p1", "c1", t(0)).unwrap();
        let grant = q.request_execute("p1", "c1", t(1000)).unwrap();
        assert!(grant.granted);
        assert_eq!(q.queue_len("p1"), 0);
    }

    #[test]
    fn second_requester_is_queued_with_eta() {
        let dir = tempfile::tempdir().unwrap();
        let q = ExecutionQueue::new(dir.path(), None, None);
        q.request_execute("p1", "c1", t(0)).unwrap();
        let grant = q.request_execute("p1", "c2", t(0)).unwrap();
        assert!(!grant.granted);
        assert_eq!(grant.position, Some(1));
        assert!(grant.eta_ms.unwrap() > 0);
    }

    #[test]
    fn release_promotes_queue_head() {
        let dir = tempfile::tempdir().unwrap();
        let q = ExecutionQueue::new(dir.path(), None, None);
        q.request_execute("p1", "c1", t(0)).unwrap();
        q.request_execute("p1", "c2", t(0)).unwrap();
        q.release_execute("p1", "c1", t(1000)).unwrap();
        assert_eq!(q.current_holder("p1"), Some("c2".to_string()));
        assert_eq!(q.queue_len("p1"), 0);
    }

    #[test]
    fn release_by_non_holder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let q = ExecutionQueue::new(dir.path(), None, None);
        q.request_execute("p1", "c1", t(0)).unwrap();
        let err = q.release_execute("p1", "c2", t(0));
        assert!(err.is_err());
    }

    #[test]
    fn ties_break_lexicographically_by_conversation_id() {
        let dir = tempfile::tempdir().unwrap();
        let q = ExecutionQueue::new(dir.path(), None, None);
        q.request_execute("p1", "holder", t(0)).unwrap();
        q.request_execute("p1", "zzz", t(100)).unwrap();
        q.request_execute("p1", "aaa", t(100)).unwrap();
        let grant_aaa = q.request_execute("p1", "aaa", t(100)).unwrap();
        let grant_zzz = q.request_execute("p1", "zzz", t(100)).unwrap();
        assert!(grant_aaa.position < grant_zzz.position);
    }

    #[test]
    fn on_timeout_only_fires_past_max_duration() {
        let dir = tempfile::tempdir().unwrap();
        let q = ExecutionQueue::new(dir.path(), None, None);
        q.request_execute("p1", "c1", t(0)).unwrap();
        assert!(!q.on_timeout("p1", t(1000)).unwrap());
        assert!(q.on_timeout("p1", t(30 * 60 * 1000 + 1)).unwrap());
        assert_eq!(q.current_holder("p1"), None);
    }

    #[test]
    fn configured_max_duration_overrides_the_default_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let q = ExecutionQueue::new(dir.path(), None, Some(60_000));
        q.request_execute("p1", "c1", t(0)).unwrap();
        // Past the configured 60s, but well short of the 30-minute default.
        assert!(q.on_timeout("p1", t(60_001)).unwrap());
        assert_eq!(q.current_holder("p1"), None);
    }

    #[test]
    fn load_all_releases_expired_locks_and_promotes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = ExecutionQueue::new(dir.path(), None, None);
            q.request_execute("p1", "c1", t(0)).unwrap();
            q.request_execute("p1", "c2", t(0)).unwrap();
        }
        let q2 = ExecutionQueue::new(dir.path(), None, None);
        let known: HashSet<ConversationId> = ["c1".to_string(), "c2".to_string()].into_iter().collect();
        let (loaded, released, _dropped) = q2.load_all(t(30 * 60 * 1000 + 1), &known).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(released, 1);
        assert_eq!(q2.current_holder("p1"), Some("c2".to_string()));
    }

    #[test]
    fn load_all_releases_a_lock_whose_conversation_is_missing_even_if_unexpired() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = ExecutionQueue::new(dir.path(), None, None);
            q.request_execute("p1", "c1", t(0)).unwrap();
        }
        let q2 = ExecutionQueue::new(dir.path(), None, None);
        // c1 no longer exists in the conversation store.
        let known: HashSet<ConversationId> = HashSet::new();
        let (loaded, released, _dropped) = q2.load_all(t(1000), &known).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(released, 1);
        assert!(q2.current_holder("p1").is_none());
    }

    #[test]
    fn load_all_drops_queue_entries_whose_conversation_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        {
            let q = ExecutionQueue::new(dir.path(), None, None);
            q.request_execute("p1", "c1", t(0)).unwrap();
            q.request_execute("p1", "c2", t(0)).unwrap();
            q.request_execute("p1", "c3", t(0)).unwrap();
        }
        let q2 = ExecutionQueue::new(dir.path(), None, None);
        // c2 vanished from the conversation store, c1 (holder) and c3 remain.
        let known: HashSet<ConversationId> = ["c1".to_string(), "c3".to_string()].into_iter().collect();
        let (loaded, released, dropped) = q2.load_all(t(1000), &known).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(released, 0);
        assert_eq!(dropped, 1);
        assert_eq!(q2.current_holder("p1"), Some("c1".to_string()));
        assert_eq!(q2.queue_len("p1"), 1);
    }
}
