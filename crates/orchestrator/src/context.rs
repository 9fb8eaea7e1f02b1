use tenex_domain::model::{Conversation, OrchestratorTurn};

/// Everything the orchestrator's prompt is built from.
#[derive(Debug, Clone)]
pub struct OrchestratorContext {
    pub user_request: String,
    pub workflow_narrative: String,
}

impl OrchestratorContext {
    /// Build deterministically from a conversation: `user_request` is
    /// the first event's content, `workflow_narrative` walks
    /// `orchestrator_turns` in order and renders one line per turn.
    pub fn build(conversation: &Conversation) -> Self {
        let user_request = conversation
            .history
            .first()
            .map(|e| e.content.clone())
            .unwrap_or_default();
        let workflow_narrative = narrate(&conversation.orchestrator_turns);
        Self {
            user_request,
            workflow_narrative,
        }
    }
}

fn narrate(turns: &[OrchestratorTurn]) -> String {
    if turns.is_empty() {
        return "No prior orchestrator turns.".to_string();
    }
    let mut lines = Vec::with_capacity(turns.len());
    for (i, turn) in turns.iter().enumerate() {
        let agents = turn.target_agents.join(", ");
        let status = if turn.completed { "completed" } else { "pending" };
        let reason = turn.reason.as_deref().unwrap_or("(no reason given)");
        lines.push(format!(
            "{}. phase={:?} routed=[{agents}] reason=\"{reason}\" status={status}",
            i + 1,
            turn.phase
        ));
        for completion in &turn.completions {
            if let Some(summary) = completion.summary.as_deref() {
                lines.push(format!("   - {}: {summary}", completion.agent_id));
            }
        }
    }
    lines.join("\n")
}
