//! `StreamPublisher` — sentence/time-windowed content batching,
//! per-turn sequence ordering, idempotent finalization, and a separate
//! debounced typing-indicator path.
//!
//! Accumulates streamed content and publishes on trigger (sentence
//! boundary or flush-delay timeout) rather than forwarding
//! token-by-token, publishing onto the `Bus` capability.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;

use tenex_domain::capability::Bus;
use tenex_domain::model::Event;

/// Bus event kinds this publisher emits. Arbitrary, small integers —
/// the concrete numbering is a Bus-capability concern (external); what
/// matters to the kernel is that `EventIngress` is configured to treat
/// `KIND_TYPING` as an ignored/status kind.
pub const KIND_PARTIAL: u32 = 30;
pub const KIND_FINAL: u32 = 31;
pub const KIND_TYPING: u32 = 32;

/// Sentence-terminator check: `. `, `! `, `? ` at a word boundary.
fn ends_with_sentence_terminator(buf: &str) -> bool {
    for terminator in [". ", "! ", "? "] {
        if buf.ends_with(terminator) {
            return true;
        }
    }
    // Also accept terminator immediately followed by end-of-buffer
    // (no trailing space yet arrived), matching on the last two chars.
    let trimmed = buf.trim_end_matches(' ');
    trimmed.ends_with('.') || trimmed.ends_with('!') || trimmed.ends_with('?')
}

struct Shared {
    bus: Arc<dyn Bus>,
    conversation_id: String,
    author_key: String,
    agent_id: String,
    flush_delay: Duration,
    max_flush_delay: Duration,
    min_typing_visible: Duration,
    seq: AtomicU64,
    finalized: AtomicBool,
}

/// One publisher per agent turn — scoped to a single turn, never
/// shared across turns.
pub struct StreamPublisher {
    shared: Arc<Shared>,
    buffer: Mutex<PublishBuffer>,
}

struct PublishBuffer {
    content: String,
    last_publish: Instant,
    typing_started_at: Option<Instant>,
    typing_label: Option<String>,
}

impl StreamPublisher {
    pub fn new(
        bus: Arc<dyn Bus>,
        conversation_id: impl Into<String>,
        author_key: impl Into<String>,
        agent_id: impl Into<String>,
        flush_delay: Duration,
        max_flush_delay: Duration,
        min_typing_visible: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                conversation_id: conversation_id.into(),
                author_key: author_key.into(),
                agent_id: agent_id.into(),
                flush_delay,
                max_flush_delay,
                min_typing_visible,
                seq: AtomicU64::new(0),
                finalized: AtomicBool::new(false),
            }),
            buffer: Mutex::new(PublishBuffer {
                content: String::new(),
                last_publish: Instant::now(),
                typing_started_at: None,
                typing_label: None,
            }),
        }
    }

    /// Append a content delta, publishing a partial when a sentence
    /// boundary is crossed or the flush window has elapsed. Widens the
    /// effective window under backpressure up to `max_flush_delay` —
    /// callers signal backpressure by passing `backpressured: true`.
    pub async fn push_content(&self, delta: &str, backpressured: bool) {
        let mut buf = self.buffer.lock().await;
        buf.content.push_str(delta);
        let window = if backpressured {
            self.shared.max_flush_delay
        } else {
            self.shared.flush_delay
        };
        let should_flush =
            ends_with_sentence_terminator(&buf.content) || buf.last_publish.elapsed() >= window;
        if should_flush && !buf.content.is_empty() {
            let chunk = std::mem::take(&mut buf.content);
            buf.last_publish = Instant::now();
            drop(buf);
            self.publish_partial(&chunk).await;
        }
    }

    async fn publish_partial(&self, text: &str) {
        let seq = self.shared.seq.fetch_add(1, Ordering::AcqRel);
        let event = self.build_event(KIND_PARTIAL, text, seq, false);
        let _ = self.shared.bus.publish(event).await;
        tenex_domain::trace::TraceEvent::StreamPublished {
            conversation_id: self.shared.conversation_id.clone(),
            turn_seq: seq,
            is_final: false,
            chars: text.len(),
        }
        .emit();
    }

    /// Flush any buffered content and publish the single final message.
    /// Idempotent: a second call is a no-op.
    pub async fn finalize(&self, full_content: &str, metadata: serde_json::Value) {
        if self
            .shared
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // Discard any not-yet-flushed partial — the final message
        // carries the full accumulated content regardless.
        {
            let mut buf = self.buffer.lock().await;
            buf.content.clear();
        }
        let seq = self.shared.seq.fetch_add(1, Ordering::AcqRel);
        let mut event = self.build_event(KIND_FINAL, full_content, seq, true);
        event.tags.push(vec![
            "metadata".to_string(),
            serde_json::to_string(&metadata).unwrap_or_default(),
        ]);
        let _ = self.shared.bus.publish(event).await;
        tenex_domain::trace::TraceEvent::StreamPublished {
            conversation_id: self.shared.conversation_id.clone(),
            turn_seq: seq,
            is_final: true,
            chars: full_content.len(),
        }
        .emit();
    }

    pub fn is_finalized(&self) -> bool {
        self.shared.finalized.load(Ordering::Acquire)
    }

    /// Start (or extend) a typing indicator labeled for the active
    /// tool. Debounced: a typing indicator already visible for less
    /// than `min_typing_visible` is left alone rather than re-published.
    /// Under backpressure, typing indicators are dropped before
    /// content — callers pass `backpressured: true` to suppress the
    /// publish entirely.
    pub async fn start_typing(&self, label: &str, backpressured: bool) {
        if backpressured {
            return;
        }
        let mut buf = self.buffer.lock().await;
        let should_publish = match (buf.typing_started_at, &buf.typing_label) {
            (Some(started), Some(current_label)) => {
                current_label != label || started.elapsed() >= self.shared.min_typing_visible
            }
            _ => true,
        };
        if !should_publish {
            return;
        }
        buf.typing_started_at = Some(Instant::now());
        buf.typing_label = Some(label.to_string());
        drop(buf);
        let seq = self.shared.seq.fetch_add(1, Ordering::AcqRel);
        let event = self.build_event(KIND_TYPING, label, seq, false);
        let _ = self.shared.bus.publish(event).await;
    }

    /// Stop typing, honoring the minimum-visible-duration floor: if the
    /// indicator has been up for less than `min_typing_visible`, the
    /// stop is still recorded locally (so the next `start_typing` call
    /// is not mistaken for a continuation) but no extra bus event is
    /// required to clear it — downstream consumers time it out.
    pub async fn stop_typing(&self) {
        let mut buf = self.buffer.lock().await;
        buf.typing_started_at = None;
        buf.typing_label = None;
    }

    fn build_event(&self, kind: u32, content: &str, seq: u64, is_final: bool) -> Event {
        let mut tags = vec![
            vec!["e".to_string(), self.shared.conversation_id.clone()],
            vec!["agent".to_string(), self.shared.agent_id.clone()],
            vec!["seq".to_string(), seq.to_string()],
        ];
        if is_final {
            tags.push(vec!["final".to_string(), "true".to_string()]);
        }
        Event {
            id: format!("{}-{}-{}", self.shared.conversation_id, self.shared.agent_id, seq),
            author_key: self.shared.author_key.clone(),
            kind,
            content: content.to_string(),
            tags,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as PLMutex;
    use tenex_domain::capability::BusFilter;
    use tenex_domain::error::Result as DomainResult;
    use tenex_domain::stream::BoxStream;

    #[derive(Default)]
    struct RecordingBus {
        published: PLMutex<Vec<Event>>,
    }

    #[async_trait]
    impl Bus for RecordingBus {
        async fn subscribe(&self, _filter: BusFilter) -> DomainResult<BoxStream<'static, Event>> {
            Ok(Box::pin(futures_util::stream::empty()))
        }

        async fn publish(&self, event: Event) -> DomainResult<()> {
            self.published.lock().push(event);
            Ok(())
        }
    }

    fn publisher(bus: Arc<RecordingBus>) -> StreamPublisher {
        StreamPublisher::new(
            bus,
            "c1",
            "agent-key",
            "executor",
            Duration::from_millis(100),
            Duration::from_millis(2000),
            Duration::from_millis(5000),
        )
    }

    #[tokio::test]
    async fn publishes_partial_on_sentence_boundary() {
        let bus = Arc::new(RecordingBus::default());
        let pub_ = publisher(bus.clone());
        pub_.push_content("Hello there. ", false).await;
        let published = bus.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, KIND_PARTIAL);
    }

    #[tokio::test]
    async fn does_not_publish_mid_sentence_within_flush_window() {
        let bus = Arc::new(RecordingBus::default());
        let pub_ = publisher(bus.clone());
        pub_.push_content("Hello there", false).await;
        assert!(bus.published.lock().is_empty());
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let bus = Arc::new(RecordingBus::default());
        let pub_ = publisher(bus.clone());
        pub_.finalize("full text", serde_json::json!({})).await;
        pub_.finalize("full text", serde_json::json!({})).await;
        let finals: Vec<_> = bus
            .published
            .lock()
            .iter()
            .filter(|e| e.kind == KIND_FINAL)
            .count();
        assert_eq!(finals, 1);
    }

    #[tokio::test]
    async fn sequence_numbers_are_monotonic_within_a_turn() {
        let bus = Arc::new(RecordingBus::default());
        let pub_ = publisher(bus.clone());
        pub_.push_content("One. ", false).await;
        pub_.push_content("Two. ", false).await;
        pub_.finalize("One. Two.", serde_json::json!({})).await;
        let published = bus.published.lock();
        let seqs: Vec<u64> = published
            .iter()
            .map(|e| {
                e.tags
                    .iter()
                    .find(|t| t[0] == "seq")
                    .map(|t| t[1].parse().unwrap())
                    .unwrap()
            })
            .collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        assert_eq!(seqs, sorted);
    }

    #[tokio::test]
    async fn typing_indicator_debounces_repeated_same_label_calls() {
        let bus = Arc::new(RecordingBus::default());
        let pub_ = publisher(bus.clone());
        pub_.start_typing("exec", false).await;
        pub_.start_typing("exec", false).await;
        let typing_count = bus
            .published
            .lock()
            .iter()
            .filter(|e| e.kind == KIND_TYPING)
            .count();
        assert_eq!(typing_count, 1);
    }

    #[tokio::test]
    async fn typing_indicator_is_suppressed_under_backpressure() {
        let bus = Arc::new(RecordingBus::default());
        let pub_ = publisher(bus.clone());
        pub_.start_typing("exec", true).await;
        assert!(bus.published.lock().is_empty());
    }
}
