//! The control-flow loop tying `EventIngress -> Orchestrator ->
//! AgentRuntime -> ExecutionQueue -> PhaseMachine -> RunLedger`
//! together for one conversation.
//!
//! Composed from the already-implemented pieces it calls:
//! `tenex_orchestrator::Orchestrator::route` for the routing decision,
//! `tenex_runtime::phase::transition` + `tenex_queue::ExecutionQueue`
//! for phase changes gated on the Execute lock, and
//! `tenex_runtime::AgentRuntime::run_turn` for each agent's turn. The
//! concurrent-fan-out-then-rejoin shape below uses the
//! `futures_util::future::join_all` idiom for parallel agent turns.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use tenex_domain::model::{OrchestratorTurn, Phase, RoutingDecision};
use tenex_domain::trace::TraceEvent;
use tenex_orchestrator::OrchestratorContext;
use tenex_runtime::{AgentTurnInput, Run, RunStatus, StreamPublisher};

use crate::state::AppState;

/// Drains every orchestrator turn this conversation can currently make
/// progress on. Returns once the conversation goes idle — no active
/// turn, and the most recent routing decision was `END` — at which
/// point the conversation stays quiescent until a new bus event wakes
/// it again (appending events after `END` reopens routing on the
/// orchestrator's next pass).
pub async fn drive_conversation(state: &AppState, conversation_id: &str) -> anyhow::Result<()> {
    loop {
        let Some(conv) = state.store.get(conversation_id) else {
            return Ok(());
        };
        if conv.awaiting_operator {
            // Stays quiescent until a fresh event clears the flag
            // (`ConversationStore::append_event`) — no auto-routing
            // while waiting on a human.
            return Ok(());
        }
        let project_id = conv.project_id.clone();

        let turn = match conv.current_orchestrator_turn().cloned() {
            Some(turn) => turn,
            None => {
                let Some(turn) = route_next_turn(state, conversation_id, &project_id, &conv).await? else {
                    return Ok(());
                };
                turn
            }
        };

        let pending: Vec<String> = turn
            .target_agents
            .iter()
            .filter(|a| !turn.completions.iter().any(|c| &c.agent_id == *a))
            .cloned()
            .collect();
        if pending.is_empty() {
            // Completed turns aren't returned by `current_orchestrator_turn`;
            // reaching this means a race with another writer on this
            // conversation's own task, which single-writer discipline
            // rules out. Guard anyway rather than spin.
            return Ok(());
        }

        run_agents(state, conversation_id, &turn.turn_id, pending).await;
    }
}

async fn route_next_turn(
    state: &AppState,
    conversation_id: &str,
    project_id: &str,
    conv: &tenex_domain::model::Conversation,
) -> anyhow::Result<Option<OrchestratorTurn>> {
    let ctx = OrchestratorContext::build(conv);
    let known = state.roster.known_agent_ids();
    let decision = match state.orchestrator.route(&ctx, &known).await {
        Ok(decision) => decision,
        Err(tenex_orchestrator::OrchestratorError::Exhausted) => {
            let reason = "orchestrator could not produce a routing decision after retries".to_string();
            state.store.set_awaiting_operator(conversation_id, true)?;
            state.store.save(conversation_id)?;
            TraceEvent::AwaitingOperator {
                conversation_id: conversation_id.to_string(),
                reason,
            }
            .emit();
            return Ok(None);
        }
        Err(e) => return Err(anyhow::anyhow!("orchestrator routing failed: {e}")),
    };

    let turn_id = Uuid::new_v4().to_string();
    TraceEvent::OrchestratorRouted {
        conversation_id: conversation_id.to_string(),
        turn_id: turn_id.clone(),
        agents: decision.agents.clone(),
        phase: decision.phase,
    }
    .emit();

    if decision.is_end() {
        let turn = OrchestratorTurn {
            turn_id: turn_id.clone(),
            started_at: Utc::now(),
            phase: conv.phase,
            target_agents: vec![RoutingDecision::END.to_string()],
            reason: Some(decision.reason),
            completions: vec![],
            completed: false,
        };
        state.store.start_turn(conversation_id, turn)?;
        state.store.add_completion(
            conversation_id,
            &turn_id,
            &RoutingDecision::END.to_string(),
            None,
            std::collections::HashMap::new(),
            Utc::now(),
        )?;
        state.store.save(conversation_id)?;
        return Ok(None);
    }

    if let Some(target_phase) = decision.phase {
        if let Err(e) = ensure_phase(
            state,
            conversation_id,
            project_id,
            target_phase,
            decision.reason.clone(),
            decision.user_override,
        )
        .await
        {
            tracing::warn!(conversation_id, error = %e, "orchestrator requested an illegal, unavailable, or sequence-violating phase; ignoring");
        }
    }

    let phase_now = state.store.get(conversation_id).map(|c| c.phase).unwrap_or(conv.phase);
    let turn = OrchestratorTurn {
        turn_id: turn_id.clone(),
        started_at: Utc::now(),
        phase: phase_now,
        target_agents: decision.agents,
        reason: Some(decision.reason),
        completions: vec![],
        completed: false,
    };
    state.store.start_turn(conversation_id, turn.clone())?;
    state.store.save(conversation_id)?;
    Ok(Some(turn))
}

/// Move the conversation to `target`, acquiring/releasing the
/// project's Execute lock as the transition crosses its boundary so
/// the phase transition is atomic with lock acquisition. Waits
/// (polling, since this task owns nothing else this conversation
/// needs) until the lock is granted when entering Execute.
async fn ensure_phase(
    state: &AppState,
    conversation_id: &str,
    project_id: &str,
    target: Phase,
    reason: String,
    user_override: bool,
) -> anyhow::Result<()> {
    let current = state
        .store
        .get(conversation_id)
        .map(|c| c.phase)
        .ok_or_else(|| anyhow::anyhow!("unknown conversation {conversation_id}"))?;
    if current == target {
        return Ok(());
    }

    // Invariant 6: the orchestrator alone may not shortcut the mandatory
    // post-Execute quality sequence. Only a routing decision carrying an
    // explicit user override may, and that override lands in the
    // recorded transition's `reason`.
    let override_reason = user_override.then_some(reason.as_str());
    if tenex_runtime::phase::violates_mandatory_sequence(current, target, override_reason) {
        return Err(tenex_domain::error::Error::PhaseTransition {
            conversation: conversation_id.to_string(),
            from: current,
            to: target,
        }
        .into());
    }
    let initiator = if user_override {
        tenex_domain::model::TransitionInitiator::User
    } else {
        tenex_domain::model::TransitionInitiator::Orchestrator
    };

    if target == Phase::Execute {
        let mut logged_enqueue = false;
        loop {
            let grant = state.queue.request_execute(project_id, conversation_id, Utc::now())?;
            if grant.granted {
                break;
            }
            if !logged_enqueue {
                TraceEvent::QueueEnqueued {
                    project_id: project_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                    position: grant.position.unwrap_or(0),
                }
                .emit();
                logged_enqueue = true;
            }
            let wait = grant.eta_ms.unwrap_or(1000).min(2000).max(100);
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
        tenex_runtime::phase::transition(
            &state.store,
            conversation_id,
            target,
            initiator,
            Some(reason),
            None,
            Utc::now(),
            user_override,
        )?;
        state.store.set_execution_active(conversation_id, true, Some(Utc::now()))?;
    } else {
        if current == Phase::Execute {
            state.store.set_execution_active(conversation_id, false, None)?;
            state.queue.release_execute(project_id, conversation_id, Utc::now())?;
        }
        tenex_runtime::phase::transition(
            &state.store,
            conversation_id,
            target,
            initiator,
            Some(reason),
            None,
            Utc::now(),
            user_override,
        )?;
    }
    Ok(())
}

/// Run every pending agent in `agent_ids` concurrently under one
/// cancel group, then record each completion once its turn finishes.
async fn run_agents(state: &AppState, conversation_id: &str, turn_id: &str, agent_ids: Vec<String>) {
    state.cancel_map.register(conversation_id);

    let mut handles = Vec::with_capacity(agent_ids.len());
    for agent_id in agent_ids {
        let Some(profile) = state.roster.get(&agent_id).cloned() else {
            tracing::warn!(conversation_id, agent_id = %agent_id, "orchestrator routed to an unknown agent; marking done");
            let _ = state.store.add_completion(
                conversation_id,
                turn_id,
                &agent_id,
                Some("agent not found in roster".to_string()),
                std::collections::HashMap::new(),
                Utc::now(),
            );
            continue;
        };

        let child_key = format!("{conversation_id}:{agent_id}");
        let cancel = state.cancel_map.register(&child_key);
        state.cancel_map.add_to_group(conversation_id, &child_key);

        let state = state.clone();
        let conversation_id = conversation_id.to_string();
        let turn_id = turn_id.to_string();

        handles.push(tokio::spawn(async move {
            let run_id = state.run_ledger.insert(Run::new(conversation_id.clone(), agent_id.clone()));
            let publisher = StreamPublisher::new(
                state.bus.clone(),
                conversation_id.clone(),
                profile.identity.public_key.clone(),
                agent_id.clone(),
                Duration::from_millis(state.config.stream.flush_delay_ms),
                Duration::from_millis(state.config.stream.max_flush_delay_ms),
                Duration::from_millis(state.config.typing.min_visible_ms),
            );
            let input = AgentTurnInput {
                conversation_id: conversation_id.clone(),
                agent: profile.identity.clone(),
                model: profile.model.clone(),
                system_prompt: profile.system_prompt.clone(),
            };

            let summary = match state.agent_runtime.run_turn(input, &publisher, &cancel).await {
                Ok(outcome) => {
                    state.run_ledger.update(&run_id, |r| {
                        r.finish(if outcome.cancelled { RunStatus::Cancelled } else { RunStatus::Completed });
                    });
                    let text = outcome.content.trim();
                    if text.is_empty() { None } else { Some(text.to_string()) }
                }
                Err(e) => {
                    state.run_ledger.update(&run_id, |r| r.finish(RunStatus::Failed));
                    tracing::error!(conversation_id = %conversation_id, agent_id = %agent_id, error = %e, "agent turn failed");
                    Some(format!("agent turn failed: {e}"))
                }
            };
            let _ = state.store.add_completion(
                &conversation_id,
                &turn_id,
                &agent_id,
                summary,
                std::collections::HashMap::new(),
                Utc::now(),
            );
            state.cancel_map.remove(&child_key);
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    state.cancel_map.remove(conversation_id);
}
