use serde::Serialize;

use crate::model::Phase;

/// Structured trace events emitted across the kernel crates.
///
/// Every component that does something worth correlating across a
/// conversation's lifetime emits one of these through [`TraceEvent::emit`]
/// rather than a free-form `tracing::info!` string, so the admin surface
/// and any downstream log pipeline can parse a stable shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    ConversationCreated {
        conversation_id: String,
        project_id: String,
    },
    EventIngested {
        conversation_id: String,
        event_id: String,
        history_len: usize,
    },
    EventDropped {
        event_id: String,
        reason: String,
    },
    PhaseTransitioned {
        conversation_id: String,
        from: Phase,
        to: Phase,
        initiator: String,
    },
    OrchestratorRouted {
        conversation_id: String,
        turn_id: String,
        agents: Vec<String>,
        phase: Option<Phase>,
    },
    OrchestratorParseFailed {
        conversation_id: String,
        attempt: u32,
    },
    OrchestratorFellBack {
        conversation_id: String,
        to_agent: String,
        reason: String,
    },
    AwaitingOperator {
        conversation_id: String,
        reason: String,
    },
    AgentTurnStarted {
        conversation_id: String,
        agent_id: String,
        turn_id: String,
    },
    AgentTurnTerminated {
        conversation_id: String,
        agent_id: String,
        via: String,
    },
    AgentTurnAutoCompleted {
        conversation_id: String,
        agent_id: String,
        attempt: u32,
    },
    ToolInvoked {
        conversation_id: String,
        agent_id: String,
        tool_name: String,
        call_id: String,
        ok: bool,
        duration_ms: u64,
    },
    StreamPublished {
        conversation_id: String,
        turn_seq: u64,
        is_final: bool,
        chars: usize,
    },
    LockAcquired {
        project_id: String,
        conversation_id: String,
    },
    LockReleased {
        project_id: String,
        conversation_id: String,
        reason: String,
    },
    QueueEnqueued {
        project_id: String,
        conversation_id: String,
        position: usize,
    },
    QueuePromoted {
        project_id: String,
        conversation_id: String,
    },
    RecoveryCompleted {
        conversations_loaded: usize,
        conversations_skipped: usize,
        locks_released: usize,
        queue_entries_dropped: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "tenex_event");
    }
}
