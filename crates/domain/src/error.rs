use crate::model::{AgentId, ConversationId};

/// Shared error type used across the kernel crates.
///
/// Every variant corresponds to one of the named error kinds a
/// component can raise; propagation policy lives with each call site,
/// not on the enum itself — see each component's module docs.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("execution: {0}")]
    Execution(String),

    #[error("stream interrupted: {0}")]
    StreamInterrupt(String),

    #[error("parse: {0}")]
    Parse(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("illegal phase transition for {conversation}: {from:?} -> {to:?}")]
    PhaseTransition {
        conversation: ConversationId,
        from: crate::model::Phase,
        to: crate::model::Phase,
    },

    #[error("lock held by another conversation: {0}")]
    Lock(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("schema corruption: {0}")]
    SchemaCorruption(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
