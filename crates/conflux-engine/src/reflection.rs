//! Reflection protocol.
//!
//! After a model-calling node answers, its outgoing `reflection` edges are
//! consulted. A self-loop re-prompts the node with its own response for up
//! to `max_iterations - 1` extra rounds. An edge to an automatic reviewer
//! runs feedback/revision rounds inline. Once every automatic reviewer is
//! done, an edge to a human-input UserProxy that has not answered yet
//! suspends the run; its rounds then advance one resume at a time, and the
//! next unanswered human reviewer of the same source follows.

use tracing::{debug, info, warn};

use conflux_core::config::EngineConfig;
use conflux_core::graph::{AgentConfig, Edge, EdgeKind, Node};
use conflux_core::state::{ExecutionState, ReflectionPause};
use conflux_core::types::{MessageDraft, MessageKind, WorkflowEvent};

use crate::prompt;
use crate::runtime::{ModelReply, NodeOutcome, NodeOutput, NodeRuntime, ReviewRequest};

/// Round bound for a reflection edge: the edge's own setting, else the
/// source's `max_reflection_iterations`, else the engine default. Never
/// below one.
pub fn max_iterations(edge: &Edge, source: Option<&AgentConfig>, config: &EngineConfig) -> u32 {
    edge.data
        .max_iterations
        .or_else(|| source.and_then(|a| a.max_reflection_iterations))
        .unwrap_or(config.default_max_iterations)
        .max(1)
}

/// Run the reflection edges of `source` over its first reply. The settled
/// response is recorded as a `primary` message ahead of any feedback.
pub(crate) async fn reflect(
    rt: &NodeRuntime,
    state: &ExecutionState,
    source: &Node,
    agent: &AgentConfig,
    first: ModelReply,
    primary: MessageKind,
    mut out: NodeOutput,
) -> NodeOutcome {
    let project = state.project.as_deref();
    let mut reply = first;

    // Self-reflection: the first answer already counts as round one.
    let mut rounds = 0;
    if let Some(edge) = reflection_edges(state, source).find(|e| e.is_self_loop()) {
        let max = max_iterations(edge, Some(agent), &rt.config);
        let instruction = edge
            .data
            .reflection_prompt
            .as_deref()
            .unwrap_or(&rt.config.self_critique_prompt);
        for iteration in 2..=max {
            let critique = prompt::self_critique_prompt(instruction, &reply.text);
            match rt.call_model(project, source, agent, critique).await {
                Ok(next) => {
                    reply = next;
                    rounds += 1;
                    rt.events.publish(WorkflowEvent::ReflectionRound {
                        execution_id: state.id.clone(),
                        source: source.id.clone(),
                        reviewer: source.id.clone(),
                        iteration,
                    });
                }
                Err(e) => {
                    warn!(node_id = %source.id, iteration, error = %e, "Self-reflection stopped, keeping last response");
                    break;
                }
            }
        }
    }

    let mut metadata = reply.metadata(&source.id);
    if rounds > 0 {
        metadata.reflection_rounds = Some(rounds);
    }
    if primary == MessageKind::GroupChatSummary {
        metadata.coordinator = Some(source.id.clone());
    }
    out.push(
        MessageDraft::new(&source.name, source.kind(), primary, &reply.text)
            .with_metadata(metadata),
    );
    out.say(&source.name, &reply.text);
    let mut response = reply.text;

    for edge in reflection_edges(state, source).filter(|e| !e.is_self_loop()) {
        let Some(reviewer) = state.graph.node(&edge.target) else {
            continue;
        };
        let max = max_iterations(edge, Some(agent), &rt.config);

        // Human reviewers see the response after every automatic review.
        if reviewer.requires_human_input() {
            continue;
        }

        let Some(reviewer_agent) = reviewer.agent_config() else {
            warn!(reviewer = %reviewer.id, kind = %reviewer.kind(), "Reflection target cannot review, skipping");
            continue;
        };

        let before = response.clone();
        let (messages_mark, transcript_mark) = (out.messages.len(), out.transcript.len());
        let instruction = edge
            .data
            .reflection_prompt
            .as_deref()
            .unwrap_or(&rt.config.feedback_prompt);

        for iteration in 1..=max {
            let ask = prompt::feedback_prompt(instruction, &source.name, &response);
            let feedback = match rt.call_model(project, reviewer, reviewer_agent, ask).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(source = %source.id, reviewer = %reviewer.id, error = %e, "Reflection failed, keeping original response");
                    response = before;
                    out.messages.truncate(messages_mark);
                    out.transcript.truncate(transcript_mark);
                    break;
                }
            };
            let revise = prompt::revision_prompt(&rt.config.revision_prompt, &response, &feedback.text);
            let revision = match rt.call_model(project, source, agent, revise).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(source = %source.id, reviewer = %reviewer.id, error = %e, "Revision failed, keeping original response");
                    response = before;
                    out.messages.truncate(messages_mark);
                    out.transcript.truncate(transcript_mark);
                    break;
                }
            };

            out.push(feedback_message(reviewer, &source.id, iteration, &feedback));
            out.say(&reviewer.name, &feedback.text);
            out.push(revision_message(source, iteration, &revision));
            out.say(&source.name, &revision.text);
            response = revision.text;

            rt.events.publish(WorkflowEvent::ReflectionRound {
                execution_id: state.id.clone(),
                source: source.id.clone(),
                reviewer: reviewer.id.clone(),
                iteration,
            });
            debug!(source = %source.id, reviewer = %reviewer.id, iteration, "Reflection round complete");
        }
    }

    out.output = response;
    if let Some(review) = pending_human_review(state, source, &out.output, &rt.config) {
        info!(
            source = %source.id,
            reviewer = %review.reviewer,
            max_iterations = review.reflection.max_iterations,
            "Response routed to human reviewer"
        );
        return NodeOutcome::AwaitingReview { partial: out, review };
    }
    NodeOutcome::Finished(out)
}

/// The first human reviewer of `source`, in edge declaration order, that
/// has not answered yet.
pub(crate) fn pending_human_review(
    state: &ExecutionState,
    source: &Node,
    response: &str,
    config: &EngineConfig,
) -> Option<ReviewRequest> {
    reflection_edges(state, source)
        .filter(|e| !e.is_self_loop())
        .find_map(|edge| {
            let reviewer = state.graph.node(&edge.target)?;
            if !reviewer.requires_human_input() || state.is_executed(&reviewer.id) {
                return None;
            }
            Some(ReviewRequest {
                reviewer: reviewer.id.clone(),
                reflection: ReflectionPause {
                    reflection_source: source.id.clone(),
                    source_message: response.to_string(),
                    iteration: 1,
                    max_iterations: max_iterations(edge, source.agent_config(), config),
                },
            })
        })
}

/// One revision after human feedback. `None` when the model call failed;
/// the caller keeps the previous response.
pub(crate) async fn revise(
    rt: &NodeRuntime,
    state: &ExecutionState,
    source: &Node,
    previous: &str,
    feedback: &str,
) -> Option<ModelReply> {
    let agent = source.agent_config()?;
    let revise = prompt::revision_prompt(&rt.config.revision_prompt, previous, feedback);
    match rt.call_model(state.project.as_deref(), source, agent, revise).await {
        Ok(reply) => Some(reply),
        Err(e) => {
            warn!(source = %source.id, error = %e, "Revision after human feedback failed, keeping previous response");
            None
        }
    }
}

pub(crate) fn revision_message(source: &Node, iteration: u32, reply: &ModelReply) -> MessageDraft {
    let mut metadata = reply.metadata(&source.id);
    metadata.reflection_source = Some(source.id.clone());
    metadata.iteration = Some(iteration);
    MessageDraft::new(&source.name, source.kind(), MessageKind::ReflectionRevision, &reply.text)
        .with_metadata(metadata)
}

fn feedback_message(reviewer: &Node, source_id: &str, iteration: u32, reply: &ModelReply) -> MessageDraft {
    let mut metadata = reply.metadata(&reviewer.id);
    metadata.reflection_source = Some(source_id.to_string());
    metadata.iteration = Some(iteration);
    MessageDraft::new(&reviewer.name, reviewer.kind(), MessageKind::ReflectionFeedback, &reply.text)
        .with_metadata(metadata)
}

fn reflection_edges<'a>(state: &'a ExecutionState, source: &'a Node) -> impl Iterator<Item = &'a Edge> + 'a {
    state
        .graph
        .outgoing(&source.id)
        .filter(|e| e.kind == EdgeKind::Reflection)
}
