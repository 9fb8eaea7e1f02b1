//! `EchoLlm` — a minimal concrete `StreamingLlm` capability shipped so
//! `tenex serve` boots and can exercise the full turn pipeline without
//! a real model provider wired in. Model access itself is an external
//! capability out of scope; with zero providers configured the process
//! still comes up and answers requests, it just has nothing useful to
//! say.
//!
//! Pops a canned response and emits `Content` then `Done` — the same
//! shape as a test double, generalized into a real, always-available
//! implementation.

use async_trait::async_trait;
use futures_util::stream;

use tenex_domain::capability::StreamingLlm;
use tenex_domain::error::Result;
use tenex_domain::llm::ChatRequest;
use tenex_domain::stream::{BoxStream, StreamEvent};

#[derive(Debug, Default)]
pub struct EchoLlm;

#[async_trait]
impl StreamingLlm for EchoLlm {
    async fn stream(&self, request: ChatRequest) -> Result<BoxStream<'static, StreamEvent>> {
        let text = format!(
            "[no model provider configured for \"{}\" — {} message(s) received]",
            request.model,
            request.messages.len()
        );
        let events = vec![
            StreamEvent::Content { text },
            StreamEvent::Done {
                finish_reason: Some("stop".to_string()),
            },
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tenex_domain::llm::Message;

    #[tokio::test]
    async fn streams_content_then_done() {
        let llm = EchoLlm;
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![Message::user("hi")],
            tools: vec![],
            session_token: None,
        };
        let mut stream = llm.stream(request).await.unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Content { .. }));
        let second = stream.next().await.unwrap();
        assert!(matches!(second, StreamEvent::Done { .. }));
        assert!(stream.next().await.is_none());
    }
}
