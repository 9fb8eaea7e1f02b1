use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tenex_domain::model::{Conversation, ConversationId, Phase};

/// Lightweight listing record, kept separate from the full conversation
/// so an admin surface (or a future dashboard) can list conversations
/// without deserializing every history array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: ConversationId,
    pub title: String,
    pub phase: Phase,
    pub updated_at: DateTime<Utc>,
    pub archived: bool,
}

impl From<&Conversation> for IndexEntry {
    fn from(conv: &Conversation) -> Self {
        let title = conv
            .history
            .first()
            .map(|e| truncate(&e.content, 80))
            .unwrap_or_else(|| "(empty)".to_string());
        Self {
            id: conv.id.clone(),
            title,
            phase: conv.phase,
            updated_at: conv.updated_at,
            archived: false,
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}
