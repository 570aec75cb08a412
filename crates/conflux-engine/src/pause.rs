//! Pause/resume bookkeeping on an [`ExecutionState`].
//!
//! These functions only mutate the in-memory state; the scheduler and the
//! engine apply them inside a recorder commit so every change is persisted
//! against the latest stored version.

use uuid::Uuid;

use conflux_core::error::{ConfluxError, Result};
use conflux_core::graph::{InputMode, Node, NodeConfig};
use conflux_core::state::{ExecutionState, HumanInput, HumanInputContext, ReflectionPause};
use conflux_core::types::{ExecutionStatus, Message, MessageDraft, MessageKind, MessageMetadata};

use crate::audit;

/// Build the pause context for `node`.
pub fn pause_context(
    state: &ExecutionState,
    node: &Node,
    aggregated_context: Option<String>,
    reflection: Option<ReflectionPause>,
    fallback_title: &str,
) -> HumanInputContext {
    let input_mode = match &node.config {
        NodeConfig::UserProxy(c) => c.input_mode,
        _ => InputMode::Admin,
    };
    HumanInputContext {
        node_id: node.id.clone(),
        node_name: node.name.clone(),
        prompt_title: node.description().unwrap_or(fallback_title).to_string(),
        last_message: last_meaningful_message(&state.messages),
        aggregated_context,
        input_mode,
        input_token: match input_mode {
            InputMode::Deployment => Some(Uuid::new_v4().to_string()),
            InputMode::Admin => None,
        },
        reflection,
    }
}

/// Suspend the execution. Messages are never touched.
pub fn suspend(state: &mut ExecutionState, context: HumanInputContext) {
    state.status = ExecutionStatus::AwaitingHumanInput;
    state.human_input_context = Some(context);
}

/// Latest user-role message, else the latest one that is not a
/// workflow start/end marker.
pub fn last_meaningful_message(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.is_user_role())
        .or_else(|| messages.iter().rev().find(|m| !m.is_workflow_marker()))
        .map(|m| m.content.clone())
}

/// Reject a resume request before anything is written.
pub fn check_resumable(state: &ExecutionState, input: &HumanInput) -> Result<()> {
    let reject = |reason: String| ConfluxError::ResumeState {
        execution: state.id.0.clone(),
        reason,
    };

    match state.status {
        ExecutionStatus::Running | ExecutionStatus::AwaitingHumanInput => {}
        other => return Err(reject(format!("execution is {}", other))),
    }

    let Some(ctx) = &state.human_input_context else {
        if state.status == ExecutionStatus::AwaitingHumanInput {
            return Err(reject("no pending human input".to_string()));
        }
        return Ok(());
    };

    if ctx.input_mode == InputMode::Deployment && ctx.input_token != input.input_token {
        return Err(reject(format!(
            "input for node '{}' must come through the deployment input channel",
            ctx.node_id
        )));
    }
    Ok(())
}

/// Record a plain human answer as the paused node's output and clear the
/// pause. Skipped when the node was already answered.
pub fn record_answer(state: &mut ExecutionState, node: &Node, text: &str) {
    if !state.is_executed(&node.id) {
        state.executed_nodes.insert(node.id.clone(), text.to_string());
        state.append_conversation(&node.name, text);
        audit::append(
            state,
            vec![answer_message(node, MessageKind::Chat, text, None)],
        );
    }
    clear(state);
}

/// Leave the paused state and go back to running.
pub fn clear(state: &mut ExecutionState) {
    state.human_input_context = None;
    if state.status == ExecutionStatus::AwaitingHumanInput {
        state.status = ExecutionStatus::Running;
    }
}

pub(crate) fn answer_message(
    node: &Node,
    kind: MessageKind,
    text: &str,
    reflection: Option<&ReflectionPause>,
) -> MessageDraft {
    MessageDraft::new(&node.name, node.kind(), kind, text).with_metadata(MessageMetadata {
        node_id: Some(node.id.clone()),
        reflection_source: reflection.map(|r| r.reflection_source.clone()),
        iteration: reflection.map(|r| r.iteration),
        ..Default::default()
    })
}
