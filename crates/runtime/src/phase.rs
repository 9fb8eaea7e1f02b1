//! `PhaseMachine` — validates and records phase transitions.
//!
//! Grounded on `tenex_domain::config`'s validation-table idiom (an
//! explicit allow-list checked before mutation is applied), generalized
//! here from config-field validation to phase-graph edge validation.

use chrono::{DateTime, Utc};

use tenex_domain::error::{Error, Result};
use tenex_domain::model::{Phase, PhaseTransition, TransitionInitiator};
use tenex_store::ConversationStore;

/// The allowed transition graph. Kept as a plain match rather than a
/// `HashMap<Phase, Vec<Phase>>` — the graph is small, fixed, and a
/// match makes "where would I add a new phase" obvious at a glance.
fn allowed_targets(from: Phase) -> &'static [Phase] {
    match from {
        Phase::Chat => &[Phase::Execute, Phase::Plan, Phase::Brainstorm],
        Phase::Brainstorm => &[Phase::Chat, Phase::Plan, Phase::Execute],
        Phase::Plan => &[Phase::Execute],
        Phase::Execute => &[Phase::Verification, Phase::Chat],
        Phase::Verification => &[Phase::Chores, Phase::Execute, Phase::Chat],
        Phase::Chores => &[Phase::Reflection],
        Phase::Reflection => &[Phase::Chat],
    }
}

pub fn is_legal(from: Phase, to: Phase) -> bool {
    allowed_targets(from).contains(&to)
}

/// Validates and applies a phase transition through `store`, recording
/// it on the conversation. Does **not** handle Execute-lock acquisition
/// — callers entering Execute must acquire the lock via
/// `tenex_queue::ExecutionQueue` first and only call this once granted,
/// so the transition and the lock acquisition appear atomic to the rest
/// of the kernel.
///
/// `sanctioned_override` bypasses `is_legal` for exactly the three
/// mandatory-sequence skip edges (`Execute -> Chores`,
/// `Execute -> Reflection`, `Verification -> Reflection`). It has no
/// effect on any other edge: a caller can't use it to make an
/// otherwise-illegal transition legal, only to take one of those three
/// specific shortcuts once it has confirmed (via
/// `violates_mandatory_sequence`) that the skip carries an explicit
/// user override.
pub fn transition(
    store: &ConversationStore,
    conversation_id: &str,
    to: Phase,
    initiator: TransitionInitiator,
    reason: Option<String>,
    summary: Option<String>,
    now: DateTime<Utc>,
    sanctioned_override: bool,
) -> Result<()> {
    let conv = store
        .get(conversation_id)
        .ok_or_else(|| Error::Persistence(format!("unknown conversation {conversation_id}")))?;
    let from = conv.phase;
    let legal = is_legal(from, to) || (sanctioned_override && is_sanctioned_skip_edge(from, to));
    if !legal {
        return Err(Error::PhaseTransition {
            conversation: conversation_id.to_string(),
            from,
            to,
        });
    }
    store
        .record_transition(
            conversation_id,
            PhaseTransition {
                from,
                to,
                initiator,
                reason,
                summary,
                at: now,
            },
        )
        .map_err(|e| Error::Persistence(e.to_string()))?;
    tenex_domain::trace::TraceEvent::PhaseTransitioned {
        conversation_id: conversation_id.to_string(),
        from,
        to,
        initiator: format!("{initiator:?}"),
    }
    .emit();
    Ok(())
}

/// The three edges that shortcut the mandatory post-Execute quality
/// sequence — illegal in `allowed_targets` by default, and only ever
/// reachable through `transition`'s `sanctioned_override`.
fn is_sanctioned_skip_edge(from: Phase, to: Phase) -> bool {
    matches!(
        (from, to),
        (Phase::Execute, Phase::Chores)
            | (Phase::Execute, Phase::Reflection)
            | (Phase::Verification, Phase::Reflection)
    )
}

/// Would `to` skip part of the mandatory post-Execute sequence without
/// an override reason? Used by the orchestrator-facing validation path
/// before committing a routing decision's phase change, to decide
/// whether `transition`'s `sanctioned_override` may be set at all.
pub fn violates_mandatory_sequence(from: Phase, to: Phase, override_reason: Option<&str>) -> bool {
    if override_reason.is_some() {
        return false;
    }
    is_sanctioned_skip_edge(from, to)
}
