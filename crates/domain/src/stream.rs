use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses and bus
/// subscriptions alike.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_util::Stream<Item = T> + Send + 'a>>;

/// Events emitted while an LLM turn streams. A sum type rather than
/// one struct with optional fields per the no-subclassing design
/// note — each variant is exactly the fields that occur together.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "content")]
    Content { text: String },

    #[serde(rename = "reasoning")]
    Reasoning { text: String },

    #[serde(rename = "tool_start")]
    ToolStart { call_id: String, tool_name: String },

    #[serde(rename = "tool_complete")]
    ToolComplete {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    #[serde(rename = "usage")]
    Usage { usage: Usage },

    #[serde(rename = "done")]
    Done { finish_reason: Option<String> },

    #[serde(rename = "error")]
    Error { message: String },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
