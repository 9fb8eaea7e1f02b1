//! `RecoveryCoordinator` — the single ordered boot pass that hydrates
//! durable state before the kernel accepts any bus traffic.
//!
//! One function, one ordered pass, each step logged: load
//! `ConversationStore` + `ExecutionQueue` state from disk and reset
//! whatever must not survive a restart.

use chrono::{DateTime, Utc};

use tenex_domain::error::{Error, Result};
use tenex_queue::ExecutionQueue;
use tenex_store::ConversationStore;

/// Outcome of one recovery pass, also the shape logged via
/// `TraceEvent::RecoveryCompleted`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    pub conversations_loaded: usize,
    pub conversations_skipped: usize,
    pub locks_released: usize,
    pub queue_entries_dropped: usize,
}

/// Run recovery: load every conversation and every project's execution
/// state from disk, releasing any lock that expired while the kernel
/// was down. Does **not** replay any turn — the next inbound event
/// drives resumption. Re-subscribing to the `Bus` is the caller's
/// responsibility once this returns, since `Bus` is an external
/// capability this crate only depends on through a trait object.
pub fn recover(store: &ConversationStore, queue: &ExecutionQueue, now: DateTime<Utc>) -> Result<RecoveryReport> {
    let store_report = store.load_all().map_err(|e| Error::Persistence(e.to_string()))?;
    let known_conversations = store.known_ids();
    let (_, locks_released, queue_entries_dropped) = queue
        .load_all(now, &known_conversations)
        .map_err(|e| Error::Persistence(e.to_string()))?;

    let report = RecoveryReport {
        conversations_loaded: store_report.loaded,
        conversations_skipped: store_report.skipped,
        locks_released,
        queue_entries_dropped,
    };
    tenex_domain::trace::TraceEvent::RecoveryCompleted {
        conversations_loaded: report.conversations_loaded,
        conversations_skipped: report.conversations_skipped,
        locks_released: report.locks_released,
        queue_entries_dropped: report.queue_entries_dropped,
    }
    .emit();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_reports_zero_on_a_fresh_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        let queue = ExecutionQueue::new(dir.path(), None, None);
        let report = recover(&store, &queue, Utc::now()).unwrap();
        assert_eq!(report.conversations_loaded, 0);
        assert_eq!(report.locks_released, 0);
    }

    #[test]
    fn recovery_loads_persisted_conversations_and_releases_expired_locks() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ConversationStore::new(dir.path());
            store.create("c1".into(), "proj".into(), Utc::now());
            store.save("c1").unwrap();
            let queue = ExecutionQueue::new(dir.path(), None, None);
            queue
                .request_execute("proj", "c1", Utc::now() - chrono::Duration::hours(1))
                .unwrap();
        }
        let store = ConversationStore::new(dir.path());
        let queue = ExecutionQueue::new(dir.path(), None, None);
        let report = recover(&store, &queue, Utc::now()).unwrap();
        assert_eq!(report.conversations_loaded, 1);
        assert_eq!(report.locks_released, 1);
        assert!(queue.current_holder("proj").is_none());
    }

    #[test]
    fn recovery_releases_a_lock_whose_conversation_file_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ConversationStore::new(dir.path());
            store.create("c1".into(), "proj".into(), Utc::now());
            store.save("c1").unwrap();
            let queue = ExecutionQueue::new(dir.path(), None, None);
            // Held just now, nowhere near expiry.
            queue.request_execute("proj", "c1", Utc::now()).unwrap();
        }
        // The conversation's file is removed, but its lock is still fresh.
        std::fs::remove_file(
            tenex_store::conversations_root(dir.path()).join("c1.json"),
        )
        .unwrap();

        let store = ConversationStore::new(dir.path());
        let queue = ExecutionQueue::new(dir.path(), None, None);
        let report = recover(&store, &queue, Utc::now()).unwrap();
        assert_eq!(report.conversations_loaded, 0);
        assert_eq!(report.locks_released, 1);
        assert!(queue.current_holder("proj").is_none());
    }
}
