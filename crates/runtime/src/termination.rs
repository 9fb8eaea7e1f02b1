//! `TerminationEnforcer` — decides whether a finished agent turn
//! properly concluded, and drives the reminder/auto-complete ladder.
//!
//! Bounded retries followed by a terminal synthetic outcome, expressed
//! as an explicit terminated/phase-requires/attempt# decision table
//! rather than a single iteration cap.

use tenex_domain::model::Phase;

/// Phases that require an explicit `complete`/`end_conversation` tool
/// call to close a turn.
pub fn requires_termination(phase: Phase) -> bool {
    !matches!(phase, Phase::Chat | Phase::Brainstorm)
}

/// Outcome of evaluating one finished turn against the decision table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The agent terminated explicitly (`complete` or
    /// `end_conversation`). Finalize and yield to the orchestrator.
    Terminated,
    /// The phase does not require termination; treat the turn as a
    /// soft completion.
    SoftCompletion,
    /// Not terminated, phase requires it, attempts remain: inject a
    /// reminder and re-open the stream.
    Retry { attempt: u32 },
    /// Not terminated, phase requires it, attempts exhausted:
    /// synthesize a completion from accumulated content.
    AutoComplete { attempt: u32 },
}

/// Evaluate one turn-end against the decision table. `attempt` is
/// 1-based: the attempt number that just finished without producing a
/// termination signal. Orchestrator routing never goes through this
/// ladder at all — it runs through `tenex_orchestrator::Orchestrator::route`,
/// whose own retry-then-fall-back-or-exhaust policy is what puts a
/// conversation into "awaiting-operator" — so every caller here is a
/// non-orchestrator agent turn.
pub fn evaluate(terminated: bool, phase: Phase, attempt: u32, max_attempts: u32) -> TerminationOutcome {
    if terminated {
        return TerminationOutcome::Terminated;
    }
    if !requires_termination(phase) {
        return TerminationOutcome::SoftCompletion;
    }
    if attempt < max_attempts {
        return TerminationOutcome::Retry { attempt: attempt + 1 };
    }
    TerminationOutcome::AutoComplete { attempt }
}

/// Build the reminder message injected before a retry.
pub fn reminder_message(phase: Phase) -> String {
    format!(
        "You have not concluded this turn. The {phase:?} phase requires an explicit `complete` \
         (or `end_conversation`) tool call before this turn can end. Finish your work and call \
         it now."
    )
}

/// Synthesize a completion summary from accumulated stream content when
/// attempts are exhausted; callers are expected to log the violation.
pub fn synthesize_completion(accumulated_content: &str) -> String {
    if accumulated_content.trim().is_empty() {
        "(no content was produced before the turn was auto-completed)".to_string()
    } else {
        accumulated_content.trim().to_string()
    }
}
