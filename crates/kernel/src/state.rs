//! `AppState` — the fully-wired set of subsystems every admin command
//! and the serve loop shares, assembled once in `bootstrap` and cloned
//! cheaply (every field is an `Arc` or already `Clone`-cheap) into
//! every task that needs it.
//!
//! One flat struct of already-constructed subsystems, no lazy
//! initialization.

use std::sync::Arc;

use tenex_domain::capability::{Bus, StreamingLlm};
use tenex_domain::config::Config;
use tenex_orchestrator::Orchestrator;
use tenex_queue::ExecutionQueue;
use tenex_runtime::{AgentRuntime, CancelMap, RunLedger};
use tenex_store::ConversationStore;

use crate::roster::AgentRoster;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub config_path: String,
    pub store: ConversationStore,
    pub queue: ExecutionQueue,
    pub run_ledger: Arc<RunLedger>,
    pub cancel_map: Arc<CancelMap>,
    pub roster: Arc<AgentRoster>,
    pub orchestrator: Arc<Orchestrator>,
    pub agent_runtime: Arc<AgentRuntime>,
    pub bus: Arc<dyn Bus>,
    pub llm: Arc<dyn StreamingLlm>,
}
