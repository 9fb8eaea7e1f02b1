//! Per-conversation serialized scheduler — one owned async task per
//! conversation drains a wake channel and drives that conversation's
//! turns to completion before the next wake is processed. This is the
//! kernel's concrete rendition of single-writer-per-conversation
//! discipline: turn `n+1` starts only after turn `n`'s effects are
//! persisted, because both run inside the same sequential task.
//!
//! A per-key registry shape — a `Mutex<HashMap<String, _>>` guarding
//! lazily-created per-key state — generalized from a plain semaphore
//! permit per key to an owned task plus an `mpsc` wake channel, since
//! this scheduler drives an ordered sequence of side-effecting steps
//! rather than just guarding a single shared resource.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::engine;
use crate::state::AppState;

pub struct Scheduler {
    state: AppState,
    wakers: Mutex<HashMap<String, mpsc::UnboundedSender<()>>>,
}

impl Scheduler {
    pub fn new(state: AppState) -> Arc<Self> {
        Arc::new(Self {
            state,
            wakers: Mutex::new(HashMap::new()),
        })
    }

    /// Wake the given conversation's task, spawning it on first use.
    /// A conversation with no task yet gets one that runs immediately;
    /// a conversation already mid-turn just gets queued another pass.
    pub fn notify(self: &Arc<Self>, conversation_id: &str) {
        let mut wakers = self.wakers.lock();
        if let Some(tx) = wakers.get(conversation_id) {
            let _ = tx.send(());
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(());
        wakers.insert(conversation_id.to_string(), tx);
        drop(wakers);

        let state = self.state.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(run_conversation_loop(state, conversation_id, rx));
    }

    pub fn active_count(&self) -> usize {
        self.wakers.lock().len()
    }
}

async fn run_conversation_loop(state: AppState, conversation_id: String, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        // Coalesce any wakes queued while this pass was running — one
        // more drive already covers them.
        while rx.try_recv().is_ok() {}
        if let Err(e) = engine::drive_conversation(&state, &conversation_id).await {
            tracing::error!(conversation_id = %conversation_id, error = %e, "conversation drive step failed");
        }
    }
}
