//! The Orchestrator agent: the one LLM call every turn ends at and
//! begins from. It never produces user-visible content — its output is
//! a [`RoutingDecision`] parsed out of whatever the LLM returned,
//! tolerant of fenced JSON.
//!
//! A simplified stream-consumption loop — open a stream, accumulate
//! text, handle `Done`/`Error` — since the orchestrator never emits
//! tool calls, only a final JSON decision.

pub mod context;
pub mod parse;

use futures_util::StreamExt;

use tenex_domain::capability::StreamingLlm;
use tenex_domain::llm::{ChatRequest, Message};
use tenex_domain::model::RoutingDecision;
use tenex_domain::stream::StreamEvent;

pub use context::OrchestratorContext;
pub use parse::ParseError;

const MAX_PARSE_RETRIES: u32 = 1;
const MAX_UNKNOWN_AGENT_RETRIES: u32 = 2;
const PROJECT_MANAGER_AGENT: &str = "project-manager";

/// The routing policy is not executable logic — it is guidance baked
/// into the orchestrator's system prompt, since the actual routing
/// decision is the LLM's to make. This is that guidance text.
const ROUTING_POLICY: &str = "\
You are the orchestrator for a multi-agent engineering workflow. Given \
the user's original request and a narrative of every prior routing \
turn, decide which agent(s) should act next and respond with a single \
JSON object of the shape {\"agents\": [...], \"phase\": \"...\" | null, \
\"reason\": \"...\", \"user_override\": false}.

The mandatory quality sequence after Execute (Verification -> Chores -> \
Reflection) may never be shortened on your own judgment. Set \
\"user_override\": true only when the original user request itself \
explicitly asked to skip one of those steps, and explain the skip in \
\"reason\" — that exact text is what gets recorded against the \
conversation. Omit or leave it false otherwise.

Routing guidance:
- Empty routing history, a request phrased as an action (build, fix, \
  add, implement) -> route to \"executor\", phase \"execute\".
- Empty routing history, a request with real architectural complexity \
  (multiple subsystems, unclear tradeoffs) -> route to \"planner\", \
  phase \"plan\".
- Empty routing history, an ambiguous or clarifying request -> route \
  to \"project-manager\", phase \"chat\".
- After an Execute completion -> route to \"project-manager\" or \
  \"executor\" (whichever fits), phase \"verification\".
- After a Verification pass with no issues -> route to \
  \"project-manager\", phase \"chores\", then eventually \"reflection\", \
  then the literal agent name \"END\" once reflection is done.

Only name agents from the list of valid agent names given to you. \
Never include explanatory prose outside the JSON object. You never \
address the user directly — nothing you say is shown to them.";

#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("llm stream failed: {0}")]
    Stream(String),
    #[error("could not obtain a valid routing decision after retries")]
    Exhausted,
}

pub struct Orchestrator {
    llm: std::sync::Arc<dyn StreamingLlm>,
    model: String,
}

impl Orchestrator {
    pub fn new(llm: std::sync::Arc<dyn StreamingLlm>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Produce a routing decision for `ctx`, validating named agents
    /// against `known_agents`. Parse failures and unknown-agent-name
    /// failures are tracked against separate budgets: a response that
    /// fails to parse gets `MAX_PARSE_RETRIES` corrective retries, while
    /// a response naming an unknown agent gets the more generous
    /// `MAX_UNKNOWN_AGENT_RETRIES` — the LLM at least produced a
    /// structurally valid decision, so it is worth coaxing further. Once
    /// whichever budget applies is exhausted this falls back to routing
    /// at `project-manager` with a system note. Only when
    /// `project-manager` itself is not a known agent — so there is no
    /// agent left to fall back to — does this return
    /// `OrchestratorError::Exhausted`; that case must never be
    /// auto-completed, and the caller's job on that error is to mark the
    /// conversation awaiting-operator rather than silently pick an agent.
    pub async fn route(
        &self,
        ctx: &OrchestratorContext,
        known_agents: &[String],
    ) -> Result<RoutingDecision, OrchestratorError> {
        let mut correction: Option<String> = None;
        let mut last_reason = "parse failure";
        let mut parse_failures: u32 = 0;
        let mut unknown_agent_failures: u32 = 0;
        let mut attempt: u32 = 0;
        loop {
            let raw = self.complete(ctx, correction.as_deref()).await?;
            match parse::parse_routing_decision(&raw) {
                Ok(decision) => {
                    if decision.is_end() || self.all_agents_known(&decision, known_agents) {
                        return Ok(decision);
                    }
                    last_reason = "unknown agent name";
                    if unknown_agent_failures >= MAX_UNKNOWN_AGENT_RETRIES {
                        break;
                    }
                    unknown_agent_failures += 1;
                    correction = Some(format!(
                        "Your previous decision named an agent not in this list: {}. \
                         Valid agent names are: {}. Respond again with only those names \
                         (or \"END\").",
                        decision.agents.join(", "),
                        known_agents.join(", ")
                    ));
                }
                Err(e) => {
                    last_reason = "malformed JSON";
                    tenex_domain::trace::TraceEvent::OrchestratorParseFailed {
                        conversation_id: String::new(),
                        attempt,
                    }
                    .emit();
                    if parse_failures >= MAX_PARSE_RETRIES {
                        break;
                    }
                    parse_failures += 1;
                    correction = Some(format!(
                        "Your previous response could not be parsed as JSON ({e}). \
                         Respond again with only a single JSON object, no prose."
                    ));
                }
            }
            attempt += 1;
        }
        if known_agents.iter().any(|a| a == PROJECT_MANAGER_AGENT) {
            tenex_domain::trace::TraceEvent::OrchestratorFellBack {
                conversation_id: String::new(),
                to_agent: PROJECT_MANAGER_AGENT.to_string(),
                reason: last_reason.to_string(),
            }
            .emit();
            return Ok(RoutingDecision {
                agents: vec![PROJECT_MANAGER_AGENT.to_string()],
                phase: None,
                reason: format!("orchestrator retries exhausted ({last_reason}), falling back to project-manager"),
                user_override: false,
            });
        }
        Err(OrchestratorError::Exhausted)
    }

    fn all_agents_known(&self, decision: &RoutingDecision, known_agents: &[String]) -> bool {
        decision.agents.iter().all(|a| known_agents.iter().any(|k| k == a))
    }

    async fn complete(
        &self,
        ctx: &OrchestratorContext,
        correction: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let mut messages = vec![
            Message::system(ROUTING_POLICY),
            Message::user(format!(
                "Original user request:\n{}\n\nPrior routing turns:\n{}",
                ctx.user_request, ctx.workflow_narrative
            )),
        ];
        if let Some(note) = correction {
            messages.push(Message::system(note));
        }
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            tools: Vec::new(),
            session_token: None,
        };
        let mut stream = self
            .llm
            .stream(request)
            .await
            .map_err(|e| OrchestratorError::Stream(e.to_string()))?;
        let mut buf = String::new();
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Content { text } => buf.push_str(&text),
                StreamEvent::Done { finish_reason: _ } => break,
                StreamEvent::Error { message } => {
                    return Err(OrchestratorError::Stream(message));
                }
                _ => {}
            }
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tenex_domain::error::Result as DomainResult;
    use tenex_domain::stream::BoxStream;

    struct ScriptedLlm {
        responses: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl StreamingLlm for ScriptedLlm {
        async fn stream(&self, _request: ChatRequest) -> DomainResult<BoxStream<'static, StreamEvent>> {
            let text = self.responses.lock().unwrap().remove(0);
            let events = vec![
                StreamEvent::Content { text: text.to_string() },
                StreamEvent::Done { finish_reason: Some("stop".to_string()) },
            ];
            Ok(Box::pin(futures_util::stream::iter(events)))
        }
    }

    fn ctx() -> OrchestratorContext {
        OrchestratorContext {
            user_request: "build a thing".into(),
            workflow_narrative: "No prior orchestrator turns.".into(),
        }
    }

    #[tokio::test]
    async fn routes_to_a_known_agent() {
        let llm = ScriptedLlm {
            responses: Mutex::new(vec![
                "```json\n{\"agents\":[\"executor\"],\"phase\":\"execute\",\"reason\":\"go\"}\n```",
            ]),
        };
        let orch = Orchestrator::new(std::sync::Arc::new(llm), "test-model");
        let decision = orch
            .route(&ctx(), &["executor".into(), "planner".into()])
            .await
            .unwrap();
        assert_eq!(decision.agents, vec!["executor"]);
    }

    #[tokio::test]
    async fn retries_once_on_parse_failure_then_succeeds() {
        let llm = ScriptedLlm {
            responses: Mutex::new(vec![
                "not json at all",
                "{\"agents\":[\"planner\"],\"reason\":\"retry worked\"}",
            ]),
        };
        let orch = Orchestrator::new(std::sync::Arc::new(llm), "test-model");
        let decision = orch.route(&ctx(), &["planner".into()]).await.unwrap();
        assert_eq!(decision.agents, vec!["planner"]);
    }

    #[tokio::test]
    async fn exhausting_parse_retries_without_a_project_manager_returns_exhausted() {
        let llm = ScriptedLlm {
            responses: Mutex::new(vec!["garbage", "still garbage"]),
        };
        let orch = Orchestrator::new(std::sync::Arc::new(llm), "test-model");
        let result = orch.route(&ctx(), &["executor".into()]).await;
        assert!(matches!(result, Err(OrchestratorError::Exhausted)));
    }

    #[tokio::test]
    async fn parse_failures_exhaust_after_one_retry_not_two() {
        // Only two scripted responses: if parse failures got the same
        // three-attempt budget as unknown-agent names, this would panic
        // trying to pop a third response that was never provided.
        let llm = ScriptedLlm {
            responses: Mutex::new(vec!["garbage", "still garbage"]),
        };
        let orch = Orchestrator::new(std::sync::Arc::new(llm), "test-model");
        let decision = orch
            .route(&ctx(), &["executor".into(), "project-manager".into()])
            .await
            .unwrap();
        assert_eq!(decision.agents, vec!["project-manager".to_string()]);
    }

    #[tokio::test]
    async fn exhausting_unknown_agent_retries_without_a_project_manager_returns_exhausted() {
        let llm = ScriptedLlm {
            responses: Mutex::new(vec![
                "{\"agents\":[\"nonexistent\"],\"reason\":\"r1\"}",
                "{\"agents\":[\"nonexistent\"],\"reason\":\"r2\"}",
                "{\"agents\":[\"nonexistent\"],\"reason\":\"r3\"}",
            ]),
        };
        let orch = Orchestrator::new(std::sync::Arc::new(llm), "test-model");
        let result = orch.route(&ctx(), &["executor".into()]).await;
        assert!(matches!(result, Err(OrchestratorError::Exhausted)));
    }

    #[tokio::test]
    async fn exhausting_retries_falls_back_to_project_manager_when_one_is_known() {
        let llm = ScriptedLlm {
            responses: Mutex::new(vec!["garbage", "still garbage"]),
        };
        let orch = Orchestrator::new(std::sync::Arc::new(llm), "test-model");
        let decision = orch
            .route(&ctx(), &["executor".into(), "project-manager".into()])
            .await
            .unwrap();
        assert_eq!(decision.agents, vec!["project-manager".to_string()]);
    }

    #[tokio::test]
    async fn exhausting_unknown_agent_retries_falls_back_to_project_manager_when_one_is_known() {
        let llm = ScriptedLlm {
            responses: Mutex::new(vec![
                "{\"agents\":[\"nonexistent\"],\"reason\":\"r1\"}",
                "{\"agents\":[\"nonexistent\"],\"reason\":\"r2\"}",
                "{\"agents\":[\"nonexistent\"],\"reason\":\"r3\"}",
            ]),
        };
        let orch = Orchestrator::new(std::sync::Arc::new(llm), "test-model");
        let decision = orch
            .route(&ctx(), &["executor".into(), "project-manager".into()])
            .await
            .unwrap();
        assert_eq!(decision.agents, vec!["project-manager".to_string()]);
    }

    #[tokio::test]
    async fn end_sentinel_bypasses_known_agent_check() {
        let llm = ScriptedLlm {
            responses: Mutex::new(vec!["{\"agents\":[\"END\"],\"reason\":\"done\"}"]),
        };
        let orch = Orchestrator::new(std::sync::Arc::new(llm), "test-model");
        let decision = orch.route(&ctx(), &[]).await.unwrap();
        assert!(decision.is_end());
    }
}
