//! Cancellation tokens with group fan-out.
//!
//! Each running agent turn gets a [`CancelToken`]. Cancelling a
//! conversation's turn cascades to every agent concurrently routed
//! within that [`tenex_domain::model::OrchestratorTurn`] via the group
//! map.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks active cancellation tokens per key (conversation id, or
/// `"{conversation_id}:{agent_id}"` for an individual agent turn),
/// with group support for parent (conversation) -> children (the
/// agents concurrently routed in one turn) cascade.
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, key: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(key.to_owned(), token.clone());
        token
    }

    /// Cancel the turn at `key`, cascading to every child registered
    /// under it. Returns true if a token was found at `key` itself.
    pub fn cancel(&self, key: &str) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(key) {
            token.cancel();
            true
        } else {
            false
        };
        if let Some(children) = self.groups.lock().get(key) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(token) = tokens.get(child) {
                    token.cancel();
                }
            }
        }
        found
    }

    pub fn remove(&self, key: &str) {
        self.tokens.lock().remove(key);
        self.groups.lock().remove(key);
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tokens.lock().contains_key(key)
    }

    pub fn add_to_group(&self, parent_key: &str, child_key: &str) {
        self.groups
            .lock()
            .entry(parent_key.to_owned())
            .or_default()
            .insert(child_key.to_owned());
    }

    pub fn remove_from_group(&self, parent_key: &str, child_key: &str) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent_key) {
            children.remove(child_key);
            if children.is_empty() {
                groups.remove(parent_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancelling_parent_cascades_to_group_children() {
        let map = CancelMap::new();
        let parent = map.register("conv1");
        let child_a = map.register("conv1:executor");
        let child_b = map.register("conv1:planner");
        map.add_to_group("conv1", "conv1:executor");
        map.add_to_group("conv1", "conv1:planner");

        map.cancel("conv1");

        assert!(parent.is_cancelled());
        assert!(child_a.is_cancelled());
        assert!(child_b.is_cancelled());
    }

    #[test]
    fn remove_clears_token_and_group() {
        let map = CancelMap::new();
        map.register("conv1");
        map.add_to_group("conv1", "conv1:executor");
        map.remove("conv1");
        assert!(!map.is_running("conv1"));
        assert!(!map.cancel("conv1"));
    }
}
