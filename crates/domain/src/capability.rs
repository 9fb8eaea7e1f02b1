use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::llm::{ChatRequest, StreamEvent};
use crate::model::{ConversationId, Phase, ToolResult};
use crate::stream::BoxStream;

/// Filter describing which bus events a subscription wants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusFilter {
    #[serde(default)]
    pub kinds: Vec<u32>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub tags: Vec<(String, String)>,
}

/// The decentralized pub/sub event bus the kernel rides on. The bus
/// itself — transport, signing, relay selection — is out of scope;
/// this is the seam the kernel depends on.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, filter: BusFilter) -> Result<BoxStream<'static, crate::model::Event>>;

    async fn publish(&self, event: crate::model::Event) -> Result<()>;
}

/// Streaming LLM access, abstracted over any concrete provider.
#[async_trait]
pub trait StreamingLlm: Send + Sync {
    async fn stream(&self, request: ChatRequest) -> Result<BoxStream<'static, StreamEvent>>;
}

/// A tool the kernel can dispatch on an agent's behalf. Tool *business
/// logic* (shell, file I/O, MCP) is out of scope; this trait is the
/// boundary a concrete implementation plugs into. `tenex-runtime`
/// ships a couple of illustrative handlers (`echo`, `complete`,
/// `end_conversation`) sufficient to exercise the pipeline.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// JSON Schema for this tool's parameters, advertised to the LLM.
    fn param_schema(&self) -> serde_json::Value;

    async fn call(&self, ctx: ExecutionContext, args: serde_json::Value) -> ToolResult;
}

/// Context handed to a tool handler at call time.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub conversation_id: ConversationId,
    pub agent_id: String,
    pub phase: Phase,
    pub call_id: String,
}
