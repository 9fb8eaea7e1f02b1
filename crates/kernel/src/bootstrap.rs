//! `build_app_state` — the single ordered boot pass that wires every
//! subsystem before the kernel accepts any bus traffic.
//!
//! Validate config and bail on any `Error`-severity issue, then
//! construct each subsystem in dependency order with a log line per
//! step, finally assembling the `AppState` struct literal: store ->
//! queue -> ledger -> cancel map -> roster -> capability stubs -> tool
//! executor -> agent runtime -> orchestrator -> recovery.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use tenex_domain::capability::{Bus, StreamingLlm};
use tenex_domain::config::{Config, ConfigSeverity};
use tenex_runtime::{recover, AgentRuntime, CancelMap, RunLedger, ToolExecutor};
use tenex_queue::ExecutionQueue;
use tenex_orchestrator::Orchestrator;
use tenex_store::ConversationStore;

use crate::capabilities::{EchoLlm, LocalBus};
use crate::roster::AgentRoster;
use crate::state::AppState;

pub async fn build_app_state(config: Config, config_path: String) -> anyhow::Result<AppState> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!(field = %issue.field, "{}", issue.message),
            ConfigSeverity::Error => tracing::error!(field = %issue.field, "{}", issue.message),
        }
    }
    let error_count = issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count();
    if error_count > 0 {
        anyhow::bail!("config validation failed with {error_count} error(s)");
    }
    let config = Arc::new(config);

    std::fs::create_dir_all(&config.store.path).context("creating store root")?;
    tracing::info!(path = %config.store.path.display(), "store root ready");

    let store = ConversationStore::new(&config.store.path);
    tracing::info!("conversation store initialized");

    let queue = ExecutionQueue::new(
        &config.store.path,
        Some(config.queue.avg_exec_hint_ms),
        Some(config.lock.max_duration_ms),
    );
    tracing::info!("execution queue initialized");

    let run_ledger = Arc::new(RunLedger::new(&config.store.path));
    tracing::info!("run ledger initialized");

    let cancel_map = Arc::new(CancelMap::new());

    let roster = Arc::new(AgentRoster::from_config(&config));
    if roster.is_empty() {
        tracing::warn!("no agents configured — the orchestrator has nothing to route to");
    } else {
        tracing::info!(agents = roster.len(), "agent roster initialized");
    }

    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    tracing::info!("local bus initialized");

    let llm: Arc<dyn StreamingLlm> = Arc::new(EchoLlm);
    tracing::warn!("no LLM provider configured — using the stub echo provider");

    let tools = Arc::new(ToolExecutor::with_builtin_tools());
    tracing::info!("tool executor initialized (builtin tools only)");

    let agent_runtime = Arc::new(AgentRuntime::new(
        store.clone(),
        llm.clone(),
        tools,
        config.termination.max_attempts,
    ));

    let orchestrator = Arc::new(Orchestrator::new(llm.clone(), config.orchestrator.model.clone()));
    tracing::info!(model = %config.orchestrator.model, "orchestrator initialized");

    let report = recover(&store, &queue, Utc::now()).map_err(|e| anyhow::anyhow!("recovery failed: {e}"))?;
    tracing::info!(
        conversations_loaded = report.conversations_loaded,
        conversations_skipped = report.conversations_skipped,
        locks_released = report.locks_released,
        queue_entries_dropped = report.queue_entries_dropped,
        "recovery completed"
    );

    Ok(AppState {
        config,
        config_path,
        store,
        queue,
        run_ledger,
        cancel_map,
        roster,
        orchestrator,
        agent_runtime,
        bus,
        llm,
    })
}
