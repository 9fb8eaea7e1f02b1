//! `ToolExecutor` — schema validation, sequential dispatch, and the
//! typed `ToolResult` envelope.
//!
//! Follows a registry/dispatch split (`ToolExecutor::register` +
//! `ToolExecutor::dispatch`) where `Tool` is the boundary trait real
//! tool bodies (shell, file I/O, agent delegation) would implement;
//! only illustrative handlers ship here to exercise and test the
//! pipeline itself.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tenex_domain::capability::{ExecutionContext, Tool};
use tenex_domain::model::{ToolCall, ToolErrorKind, ToolResult};

/// Registry of tools keyed by name, plus the per-turn call-id dedup set:
/// tool-call ids must be unique per turn, and duplicates are rejected
/// with `Err{Protocol}`.
pub struct ToolExecutor {
    tools: std::collections::HashMap<String, Arc<dyn Tool>>,
}

impl ToolExecutor {
    pub fn new() -> Self {
        Self {
            tools: std::collections::HashMap::new(),
        }
    }

    /// An echo tool to exercise ordinary validated dispatch, and the
    /// termination pair the rest of the kernel's termination ladder
    /// is tested against.
    pub fn with_builtin_tools() -> Self {
        let mut executor = Self::new();
        executor.register(Arc::new(EchoTool));
        executor.register(Arc::new(CompleteTool));
        executor.register(Arc::new(EndConversationTool));
        executor
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn definitions(&self) -> Vec<tenex_domain::llm::ToolDefinition> {
        self.tools
            .values()
            .map(|t| tenex_domain::llm::ToolDefinition {
                name: t.name().to_string(),
                description: String::new(),
                parameters: t.param_schema(),
            })
            .collect()
    }

    /// Dispatch one tool call within a turn. `seen_call_ids` tracks
    /// call ids already dispatched this turn; callers are expected to
    /// pass the same set across every call within one turn so
    /// duplicates are caught. Tool execution is sequential per agent
    /// turn — callers must `.await` one call to completion before
    /// dispatching the next.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        ctx: ExecutionContext,
        seen_call_ids: &mut HashSet<String>,
    ) -> ToolResult {
        let start = Instant::now();
        if !seen_call_ids.insert(call.call_id.clone()) {
            return ToolResult::Err {
                kind: ToolErrorKind::Protocol,
                message: format!("duplicate call_id within turn: {}", call.call_id),
                cause: None,
                duration_ms: elapsed_ms(start),
            };
        }

        let Some(tool) = self.tools.get(&call.tool_name) else {
            return ToolResult::Err {
                kind: ToolErrorKind::Validation,
                message: format!("unknown tool: {}", call.tool_name),
                cause: None,
                duration_ms: elapsed_ms(start),
            };
        };

        if let Err(reason) = validate_args(&tool.param_schema(), &call.args) {
            return ToolResult::Err {
                kind: ToolErrorKind::Validation,
                message: reason,
                cause: None,
                duration_ms: elapsed_ms(start),
            };
        }

        // Handler panics are not caught here (catching panics across an
        // await point requires `AssertUnwindSafe` + `catch_unwind`
        // gymnastics); a handler returning an `Err` result is the sanctioned failure
        // path. A handler that wants to report an unexpected internal
        // failure does so by returning `ToolResult::Err{kind:
        // Execution, ..}` itself.
        let mut result = tool.call(ctx, call.args.clone()).await;
        let duration = elapsed_ms(start);
        match &mut result {
            ToolResult::Ok { duration_ms, .. } => *duration_ms = duration,
            ToolResult::Err { duration_ms, .. } => *duration_ms = duration,
        }
        result
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Minimal structural validation against a JSON-Schema-ish object:
/// every name in `required` must be present in `args`. Full JSON
/// Schema validation is out of scope; this is the boundary check
/// required before invoking a handler.
fn validate_args(schema: &serde_json::Value, args: &serde_json::Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    let obj = args.as_object();
    for field in required {
        let Some(name) = field.as_str() else { continue };
        let present = obj.is_some_and(|o| o.contains_key(name));
        if !present {
            return Err(format!("missing required argument \"{name}\""));
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Illustrative tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Echoes its `text` argument back. Exercises ordinary validated
/// dispatch without exercising termination.
pub struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn param_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"],
        })
    }

    async fn call(&self, _ctx: ExecutionContext, args: serde_json::Value) -> ToolResult {
        let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
        ToolResult::Ok {
            output: serde_json::json!({ "echoed": text }),
            metadata: None,
            duration_ms: 0,
        }
    }
}

/// The termination signal a non-orchestrator agent emits to end its
/// turn and return control to the orchestrator. `ToolExecutor::dispatch`
/// surfaces the `terminate: true` metadata unchanged; `AgentRuntime`
/// looks for it.
pub struct CompleteTool;

#[async_trait::async_trait]
impl Tool for CompleteTool {
    fn name(&self) -> &str {
        "complete"
    }

    fn param_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "summary": { "type": "string" } },
            "required": ["summary"],
        })
    }

    async fn call(&self, _ctx: ExecutionContext, args: serde_json::Value) -> ToolResult {
        let summary = args
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        ToolResult::Ok {
            output: serde_json::json!({ "summary": summary }),
            metadata: Some(serde_json::json!({ "terminate": "turn", "summary": summary })),
            duration_ms: 0,
        }
    }
}

/// The conversation-level termination signal: ends the conversation
/// outright rather than just the current turn.
pub struct EndConversationTool;

#[async_trait::async_trait]
impl Tool for EndConversationTool {
    fn name(&self) -> &str {
        "end_conversation"
    }

    fn param_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "reason": { "type": "string" } },
            "required": [],
        })
    }

    async fn call(&self, _ctx: ExecutionContext, args: serde_json::Value) -> ToolResult {
        let reason = args
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("conversation concluded")
            .to_string();
        ToolResult::Ok {
            output: serde_json::json!({ "reason": reason }),
            metadata: Some(serde_json::json!({ "terminate": "conversation", "reason": reason })),
            duration_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenex_domain::model::Phase;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            conversation_id: "c1".into(),
            agent_id: "executor".into(),
            phase: Phase::Execute,
            call_id: "call-1".into(),
        }
    }

    #[tokio::test]
    async fn echo_round_trips_text() {
        let executor = ToolExecutor::with_builtin_tools();
        let mut seen = HashSet::new();
        let call = ToolCall {
            tool_name: "echo".into(),
            args: serde_json::json!({ "text": "hi" }),
            call_id: "call-1".into(),
        };
        let result = executor.dispatch(&call, ctx(), &mut seen).await;
        match result {
            ToolResult::Ok { output, .. } => assert_eq!(output["echoed"], "hi"),
            ToolResult::Err { .. } => panic!("expected Ok"),
        }
    }

    #[tokio::test]
    async fn missing_required_arg_is_a_validation_error_without_invoking_handler() {
        let executor = ToolExecutor::with_builtin_tools();
        let mut seen = HashSet::new();
        let call = ToolCall {
            tool_name: "echo".into(),
            args: serde_json::json!({}),
            call_id: "call-1".into(),
        };
        let result = executor.dispatch(&call, ctx(), &mut seen).await;
        match result {
            ToolResult::Err { kind, .. } => assert_eq!(kind, ToolErrorKind::Validation),
            ToolResult::Ok { .. } => panic!("expected Err"),
        }
    }

    #[tokio::test]
    async fn duplicate_call_id_within_a_turn_is_rejected_as_protocol_error() {
        let executor = ToolExecutor::with_builtin_tools();
        let mut seen = HashSet::new();
        let call = ToolCall {
            tool_name: "echo".into(),
            args: serde_json::json!({ "text": "hi" }),
            call_id: "call-1".into(),
        };
        executor.dispatch(&call, ctx(), &mut seen).await;
        let second = executor.dispatch(&call, ctx(), &mut seen).await;
        match second {
            ToolResult::Err { kind, .. } => assert_eq!(kind, ToolErrorKind::Protocol),
            ToolResult::Ok { .. } => panic!("expected Err"),
        }
    }

    #[tokio::test]
    async fn complete_tool_carries_terminate_metadata() {
        let executor = ToolExecutor::with_builtin_tools();
        let mut seen = HashSet::new();
        let call = ToolCall {
            tool_name: "complete".into(),
            args: serde_json::json!({ "summary": "done" }),
            call_id: "call-1".into(),
        };
        let result = executor.dispatch(&call, ctx(), &mut seen).await;
        match result {
            ToolResult::Ok { metadata, .. } => {
                let meta = metadata.unwrap();
                assert_eq!(meta["terminate"], "turn");
            }
            ToolResult::Err { .. } => panic!("expected Ok"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_validation_error() {
        let executor = ToolExecutor::with_builtin_tools();
        let mut seen = HashSet::new();
        let call = ToolCall {
            tool_name: "does-not-exist".into(),
            args: serde_json::json!({}),
            call_id: "call-1".into(),
        };
        let result = executor.dispatch(&call, ctx(), &mut seen).await;
        assert!(matches!(result, ToolResult::Err { kind: ToolErrorKind::Validation, .. }));
    }
}
