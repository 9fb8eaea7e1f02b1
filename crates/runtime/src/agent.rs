//! `AgentRuntime` — the reason-act loop every non-orchestrator agent
//! turn runs through: open a stream, dispatch tool calls as they
//! complete, evaluate termination, retry with a reminder or
//! auto-complete, then persist the cursor.
//!
//! The stream-consume-dispatch shape, cancellation checks threaded
//! through every await point, and a tokio span per turn follow the
//! usual reason-act-loop pattern. Tool calls are dispatched
//! sequentially within a turn rather than concurrently, and the retry
//! ladder is the explicit terminated/phase-requires/attempt# table in
//! [`crate::termination`] rather than a single force-stop constant.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;

use tenex_domain::capability::{ExecutionContext, StreamingLlm};
use tenex_domain::error::{Error, Result};
use tenex_domain::llm::{ChatRequest, Message, StreamEvent};
use tenex_domain::model::{AgentCursor, AgentIdentity, Phase, ToolCall, ToolResult};
use tenex_store::ConversationStore;

use crate::cancel::CancelToken;
use crate::publisher::StreamPublisher;
use crate::termination::{self, TerminationOutcome};
use crate::tools::ToolExecutor;

/// Bound on tool-call round-trips within a single attempt, independent
/// of the termination retry ladder — a safety valve against a runaway
/// tool loop within one LLM turn.
const MAX_TOOL_LOOPS: usize = 25;

pub struct AgentTurnInput {
    pub conversation_id: String,
    pub agent: AgentIdentity,
    pub model: String,
    pub system_prompt: String,
}

#[derive(Debug, Clone)]
pub struct AgentTurnOutcome {
    pub content: String,
    /// True if the agent explicitly called `complete`/`end_conversation`
    /// (as opposed to a soft completion or an auto-completed one).
    pub terminated: bool,
    /// True only if the terminating tool carried `terminate:
    /// "conversation"` (an `end_conversation` call, not just `complete`).
    pub terminate_conversation: bool,
    pub attempts_used: u32,
    /// True if a cancellation request cut the turn short. Cancellation
    /// is a normal conclusion to a turn, not an error.
    pub cancelled: bool,
}

pub struct AgentRuntime {
    store: ConversationStore,
    llm: Arc<dyn StreamingLlm>,
    tools: Arc<ToolExecutor>,
    max_attempts: u32,
}

impl AgentRuntime {
    pub fn new(
        store: ConversationStore,
        llm: Arc<dyn StreamingLlm>,
        tools: Arc<ToolExecutor>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            llm,
            tools,
            max_attempts,
        }
    }

    /// Run one agent turn end-to-end: view-build, stream, dispatch,
    /// retry-or-finalize, cursor update + persist. If `cancel` fires
    /// mid-turn the outcome carries `cancelled: true` with whatever
    /// content had accumulated so far, rather than an error — a
    /// "stopped, not failed" treatment of cancellation.
    pub async fn run_turn(
        &self,
        input: AgentTurnInput,
        publisher: &StreamPublisher,
        cancel: &CancelToken,
    ) -> Result<AgentTurnOutcome> {
        let turn_id = uuid::Uuid::new_v4().to_string();
        tenex_domain::trace::TraceEvent::AgentTurnStarted {
            conversation_id: input.conversation_id.clone(),
            agent_id: input.agent.id.clone(),
            turn_id: turn_id.clone(),
        }
        .emit();

        let conversation = self
            .store
            .get(&input.conversation_id)
            .ok_or_else(|| Error::Persistence(format!("unknown conversation {}", input.conversation_id)))?;
        let phase = conversation.phase;
        let cursor = conversation.cursor_for(&input.agent.id);

        let mut messages = vec![Message::system(input.system_prompt.clone())];
        let seen_upto = cursor.last_seen_index.min(conversation.history.len());
        for event in &conversation.history[..seen_upto] {
            messages.push(render_event_as_message(event, &input.agent.id));
        }
        let unseen = &conversation.history[seen_upto..];
        if !unseen.is_empty() {
            messages.push(Message::system(
                "Messages received while you were away, most recent (the one that \
                 triggered this turn) last:"
                    .to_string(),
            ));
            for event in unseen {
                messages.push(render_event_as_message(event, &input.agent.id));
            }
        }

        let mut accumulated = String::new();
        let mut attempt: u32 = 1;
        let mut reminder: Option<String> = None;
        let mut terminated = false;
        let mut terminate_conversation = false;

        let outcome_content;
        let outcome_attempts;
        let mut cancelled = false;
        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                outcome_content = accumulated;
                outcome_attempts = attempt;
                break;
            }
            let mut attempt_messages = messages.clone();
            if let Some(note) = &reminder {
                attempt_messages.push(Message::system(note.clone()));
            }
            let attempt_result = self
                .run_attempt(&input, phase, attempt_messages, publisher, cancel)
                .await?;
            let Some((content, did_terminate, terminate_conv)) = attempt_result else {
                cancelled = true;
                outcome_content = accumulated;
                outcome_attempts = attempt;
                break;
            };
            accumulated.push_str(&content);
            terminated = terminated || did_terminate;
            terminate_conversation = terminate_conversation || terminate_conv;

            match termination::evaluate(did_terminate, phase, attempt, self.max_attempts) {
                TerminationOutcome::Terminated => {
                    tenex_domain::trace::TraceEvent::AgentTurnTerminated {
                        conversation_id: input.conversation_id.clone(),
                        agent_id: input.agent.id.clone(),
                        via: "explicit".to_string(),
                    }
                    .emit();
                    outcome_content = accumulated;
                    outcome_attempts = attempt;
                    break;
                }
                TerminationOutcome::SoftCompletion => {
                    tenex_domain::trace::TraceEvent::AgentTurnTerminated {
                        conversation_id: input.conversation_id.clone(),
                        agent_id: input.agent.id.clone(),
                        via: "soft".to_string(),
                    }
                    .emit();
                    outcome_content = accumulated;
                    outcome_attempts = attempt;
                    break;
                }
                TerminationOutcome::Retry { attempt: next } => {
                    messages.push(Message::assistant(content));
                    reminder = Some(termination::reminder_message(phase));
                    attempt = next;
                    continue;
                }
                TerminationOutcome::AutoComplete { attempt: used } => {
                    tenex_domain::trace::TraceEvent::AgentTurnAutoCompleted {
                        conversation_id: input.conversation_id.clone(),
                        agent_id: input.agent.id.clone(),
                        attempt: used,
                    }
                    .emit();
                    outcome_content = termination::synthesize_completion(&accumulated);
                    outcome_attempts = used;
                    break;
                }
            }
        }

        publisher
            .finalize(
                &outcome_content,
                serde_json::json!({ "terminated": terminated, "attempts": outcome_attempts }),
            )
            .await;

        self.store
            .update_cursor(
                &input.conversation_id,
                &input.agent.id,
                AgentCursor {
                    last_seen_index: conversation.history.len(),
                    session_token: cursor.session_token,
                },
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;
        self.store
            .save(&input.conversation_id)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        Ok(AgentTurnOutcome {
            content: outcome_content,
            terminated,
            terminate_conversation,
            attempts_used: outcome_attempts,
            cancelled,
        })
    }

    /// One LLM stream: open it, forward content to the publisher,
    /// dispatch tool calls sequentially as they complete, and return
    /// once the stream signals `Done`. Tool results are not currently
    /// fed back into a second in-attempt LLM call — a tool call's
    /// result closes that attempt's reasoning step, with any follow-up
    /// reasoning happening in the next attempt's inner loop iteration.
    async fn run_attempt(
        &self,
        input: &AgentTurnInput,
        phase: Phase,
        messages: Vec<Message>,
        publisher: &StreamPublisher,
        cancel: &CancelToken,
    ) -> Result<Option<(String, bool, bool)>> {
        let request = ChatRequest {
            model: input.model.clone(),
            messages,
            tools: self.tools.definitions(),
            session_token: None,
        };
        let mut stream = self.llm.stream(request).await?;
        let mut content = String::new();
        let mut terminated = false;
        let mut terminate_conversation = false;
        let mut seen_call_ids = HashSet::new();
        let mut loops = 0usize;

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match event {
                StreamEvent::Content { text } => {
                    content.push_str(&text);
                    publisher.push_content(&text, false).await;
                }
                StreamEvent::Reasoning { .. } => {}
                StreamEvent::ToolStart { tool_name, .. } => {
                    publisher.start_typing(&tool_name, false).await;
                }
                StreamEvent::ToolComplete {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    loops += 1;
                    if loops > MAX_TOOL_LOOPS {
                        return Err(Error::Execution(format!(
                            "tool loop limit ({MAX_TOOL_LOOPS}) exceeded in turn"
                        )));
                    }
                    let call = ToolCall {
                        tool_name: tool_name.clone(),
                        args: arguments,
                        call_id: call_id.clone(),
                    };
                    let ctx = ExecutionContext {
                        conversation_id: input.conversation_id.clone(),
                        agent_id: input.agent.id.clone(),
                        phase,
                        call_id: call_id.clone(),
                    };
                    let result = self.tools.dispatch(&call, ctx, &mut seen_call_ids).await;
                    let ok = matches!(result, ToolResult::Ok { .. });
                    tenex_domain::trace::TraceEvent::ToolInvoked {
                        conversation_id: input.conversation_id.clone(),
                        agent_id: input.agent.id.clone(),
                        tool_name: tool_name.clone(),
                        call_id: call_id.clone(),
                        ok,
                        duration_ms: match &result {
                            ToolResult::Ok { duration_ms, .. } => *duration_ms,
                            ToolResult::Err { duration_ms, .. } => *duration_ms,
                        },
                    }
                    .emit();
                    publisher.stop_typing().await;
                    if let ToolResult::Ok { metadata: Some(meta), .. } = &result {
                        match meta.get("terminate").and_then(|v| v.as_str()) {
                            Some("turn") => terminated = true,
                            Some("conversation") => {
                                terminated = true;
                                terminate_conversation = true;
                            }
                            _ => {}
                        }
                    }
                }
                StreamEvent::Usage { .. } => {}
                StreamEvent::Done { .. } => break,
                StreamEvent::Error { message } => {
                    return Err(Error::StreamInterrupt(message));
                }
            }
        }
        Ok(Some((content, terminated, terminate_conversation)))
    }
}

/// Derive a message role from who authored `event`. An event carries an
/// `agent` tag (set by `StreamPublisher::build_event`) when it was
/// produced by an agent turn rather than an inbound bus event: if that
/// tag names `self_agent_id` the turn is seeing its own prior output
/// back, rendered as `assistant`; if it names a different agent, it is
/// rendered as `system` with attribution so the model can tell other
/// agents' chatter apart from its own; an event with no `agent` tag came
/// from outside the agent roster (the user) and is rendered as `user`.
fn render_event_as_message(event: &tenex_domain::model::Event, self_agent_id: &str) -> Message {
    let author_agent = event
        .tags
        .iter()
        .find(|t| t.first().map(String::as_str) == Some("agent"))
        .and_then(|t| t.get(1));
    match author_agent {
        Some(agent_id) if agent_id == self_agent_id => Message::assistant(event.content.clone()),
        Some(agent_id) => Message::system(format!("[{agent_id}] {}", event.content)),
        None => Message::user(format!("[{}] {}", event.author_key, event.content)),
    }
}
