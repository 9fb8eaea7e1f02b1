//! `tenex-runtime` — the per-turn execution machinery: phase
//! transitions, the reason-act loop, tool dispatch, stream publishing,
//! termination, event ingress, recovery, and run observability.
//!
//! Each module's doc comment describes what it does and how it fits
//! the rest of the pipeline.

pub mod agent;
pub mod cancel;
pub mod ingress;
pub mod phase;
pub mod publisher;
pub mod recovery;
pub mod runs;
pub mod termination;
pub mod tools;

pub use agent::{AgentRuntime, AgentTurnInput, AgentTurnOutcome};
pub use cancel::{CancelMap, CancelToken};
pub use ingress::{EventIngress, IngressOutcome};
pub use publisher::StreamPublisher;
pub use recovery::{recover, RecoveryReport};
pub use runs::{NodeKind, Run, RunLedger, RunNode, RunStatus};
pub use termination::TerminationOutcome;
pub use tools::ToolExecutor;
