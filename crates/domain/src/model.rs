use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ConversationId = String;
pub type AgentId = String;
pub type ProjectId = String;

/// Lifecycle phase of a conversation. Transitions between phases are
/// governed by `PhaseMachine` (see `tenex-runtime::phase`) and are not
/// freely assignable by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Chat,
    Brainstorm,
    Plan,
    Execute,
    Verification,
    Chores,
    Reflection,
}

/// An inbound bus event, already stripped of transport concerns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub author_key: String,
    pub kind: u32,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

/// Who authored a turn or message, for history rendering and loop
/// suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum AgentRole {
    Orchestrator,
    Planner,
    Executor,
    ProjectManager,
    /// A domain expert, named because there may be several
    /// (e.g. "security", "frontend").
    Expert(String),
}

/// An agent's identity as known to the kernel: its routable id, the
/// public key used for loop suppression in `EventIngress`, and its
/// role, which the orchestrator's routing heuristics and the
/// unknown-agent-name validation path both consult.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: AgentId,
    pub public_key: String,
    pub role: AgentRole,
}

/// A tool invocation requested by an agent's LLM turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub args: serde_json::Value,
    pub call_id: String,
}

/// Outcome of executing a `ToolCall`. A sum type rather than a single
/// struct with an `ok: bool` flag, so callers are forced to handle
/// both arms explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Ok {
        output: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        duration_ms: u64,
    },
    Err {
        kind: ToolErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Validation,
    Execution,
    Protocol,
}

/// A routing decision produced by the orchestrator for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Agent ids to route to, or the literal sentinel `"END"`.
    pub agents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub reason: String,
    /// Explicit user override bypassing the mandatory post-Execute
    /// quality sequence. The orchestrator prompt contract sets this only
    /// when the triggering user event itself asked to skip ahead; absent
    /// from ordinary LLM output, so it defaults to `false` for every
    /// decision that doesn't name it.
    #[serde(default)]
    pub user_override: bool,
}

impl RoutingDecision {
    pub const END: &'static str = "END";

    pub fn is_end(&self) -> bool {
        self.agents.iter().any(|a| a == Self::END)
    }
}

/// One routed agent's report back to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub at: DateTime<Utc>,
}

/// Record of one orchestrator decision cycle and the completions it is
/// waiting on. Once `completed` is true the turn is immutable: no
/// further completions are accepted and its fields are never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorTurn {
    pub turn_id: String,
    pub started_at: DateTime<Utc>,
    pub phase: Phase,
    pub target_agents: Vec<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub completions: Vec<Completion>,
    pub completed: bool,
}

impl OrchestratorTurn {
    pub fn is_fully_completed(&self) -> bool {
        self.target_agents
            .iter()
            .all(|a| self.completions.iter().any(|c| &c.agent_id == a))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionInitiator {
    Orchestrator,
    Agent,
    System,
    /// An explicit user override bypassing the mandatory post-Execute
    /// quality sequence — see `RoutingDecision::user_override`.
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub initiator: TransitionInitiator,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub at: DateTime<Utc>,
}

/// Per-agent read position into a conversation's history, plus an
/// opaque continuation token for the underlying LLM session. Agents
/// never hold a copy of history — only this cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCursor {
    pub last_seen_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTime {
    pub active: bool,
    pub total_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// The authoritative aggregate. Every mutation to a `Conversation`
/// must go through `tenex-store::ConversationStore` so that the
/// single-writer-per-conversation discipline and the append-only
/// history invariant hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub project_id: ProjectId,
    pub phase: Phase,
    pub history: Vec<Event>,
    pub agent_cursors: HashMap<AgentId, AgentCursor>,
    pub orchestrator_turns: Vec<OrchestratorTurn>,
    pub phase_transitions: Vec<PhaseTransition>,
    pub execution_time: ExecutionTime,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Set when the orchestrator exhausts its routing retries without
    /// producing a usable decision — orchestrator turns may not be
    /// auto-completed. While set, the kernel does not attempt to route
    /// this conversation further; a fresh inbound event clears it,
    /// treated as the operator weighing in.
    #[serde(default)]
    pub awaiting_operator: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: ConversationId, project_id: ProjectId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            project_id,
            phase: Phase::Chat,
            history: Vec::new(),
            agent_cursors: HashMap::new(),
            orchestrator_turns: Vec::new(),
            phase_transitions: Vec::new(),
            execution_time: ExecutionTime::default(),
            metadata: HashMap::new(),
            awaiting_operator: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn cursor_for(&self, agent: &str) -> AgentCursor {
        self.agent_cursors.get(agent).cloned().unwrap_or_default()
    }

    /// Events an agent has not yet seen, oldest first.
    pub fn unseen_for(&self, agent: &str) -> &[Event] {
        let cursor = self.cursor_for(agent);
        &self.history[cursor.last_seen_index.min(self.history.len())..]
    }

    pub fn current_orchestrator_turn(&self) -> Option<&OrchestratorTurn> {
        self.orchestrator_turns.last().filter(|t| !t.completed)
    }

    pub fn current_orchestrator_turn_mut(&mut self) -> Option<&mut OrchestratorTurn> {
        self.orchestrator_turns.last_mut().filter(|t| !t.completed)
    }
}

/// A held Execute-phase lock for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub conversation_id: ConversationId,
    pub held_by: ConversationId,
    pub acquired_at: DateTime<Utc>,
    pub max_duration_ms: u64,
    pub project_id: ProjectId,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.acquired_at).num_milliseconds().max(0) as u64;
        elapsed >= self.max_duration_ms
    }
}

/// A conversation waiting for the Execute lock on its project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub conversation_id: ConversationId,
    pub held_by: ConversationId,
    pub enqueued_at: DateTime<Utc>,
    pub retries: u32,
}
