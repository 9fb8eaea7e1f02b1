//! `LocalBus` — an in-process `Bus` capability backed by a broadcast
//! channel. The transport `Bus` abstracts over (relay/websocket) is
//! out of scope; this gives `tenex serve` something real to publish to
//! and subscribe from in a single process.
//!
//! A broadcast-channel idiom used for live subscription feeds,
//! generalized from a single tail per resource to a filtered,
//! topic-agnostic pub/sub bus.

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::broadcast;

use tenex_domain::capability::{Bus, BusFilter};
use tenex_domain::error::Result;
use tenex_domain::model::Event;
use tenex_domain::stream::BoxStream;

/// Bounded so a slow/absent subscriber cannot grow memory without
/// limit; lagging subscribers simply miss the oldest events
/// (`RecvError::Lagged`).
const CHANNEL_CAPACITY: usize = 1024;

pub struct LocalBus {
    sender: broadcast::Sender<Event>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filter(event: &Event, filter: &BusFilter) -> bool {
    if !filter.kinds.is_empty() && !filter.kinds.contains(&event.kind) {
        return false;
    }
    if !filter.authors.is_empty() && !filter.authors.contains(&event.author_key) {
        return false;
    }
    if !filter.tags.is_empty() {
        let all_present = filter.tags.iter().all(|(name, value)| {
            event
                .tags
                .iter()
                .any(|t| t.first().map(String::as_str) == Some(name.as_str()) && t.get(1).map(String::as_str) == Some(value.as_str()))
        });
        if !all_present {
            return false;
        }
    }
    true
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(&self, filter: BusFilter) -> Result<BoxStream<'static, Event>> {
        let rx = self.sender.subscribe();
        let s = stream::unfold((rx, filter), |(mut rx, filter)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if matches_filter(&event, &filter) => return Some((event, (rx, filter))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(s))
    }

    async fn publish(&self, event: Event) -> Result<()> {
        // `send` erring means there are currently no subscribers; that
        // is not a publish failure, just an event nobody heard.
        let _ = self.sender.send(event);
        Ok(())
    }
}
