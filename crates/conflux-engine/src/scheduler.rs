use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use conflux_core::error::{ConfluxError, Result};
use conflux_core::graph::{AgentConfig, Node, NodeConfig};
use conflux_core::state::{ExecutionState, RunOutcome, StateField, SuspensionDescriptor};
use conflux_core::types::{
    ExecutionId, ExecutionStatus, MessageDraft, MessageKind, MessageMetadata, WorkflowEvent,
};

use crate::coordinator::coordinate;
use crate::graph::{aggregate, find_inputs, ExecutionPlan};
use crate::pause;
use crate::prompt;
use crate::recorder::StateRecorder;
use crate::reflection::{pending_human_review, reflect};
use crate::runtime::{NodeOutcome, NodeOutput, NodeRun, NodeRuntime};
use crate::tool_server::run_tool_server;

/// Walks the execution plan of one execution until it completes, fails,
/// stops or suspends for human input.
pub(crate) struct Scheduler {
    runtime: Arc<NodeRuntime>,
    recorder: StateRecorder,
}

impl Scheduler {
    pub fn new(runtime: Arc<NodeRuntime>, recorder: StateRecorder) -> Self {
        Self { runtime, recorder }
    }

    pub async fn run(&self, id: &ExecutionId) -> Result<RunOutcome> {
        let initial = self.recorder.load(id).await?;
        let plan = ExecutionPlan::parse(&initial.graph);
        if !plan.repaired().is_empty() {
            warn!(
                execution_id = %id,
                repaired = ?plan.repaired(),
                "Workflow has cycles, execution order was repaired"
            );
        }

        info!(execution_id = %id, nodes = plan.len(), "Scheduler started");
        self.runtime.events.publish(WorkflowEvent::RunStarted {
            execution_id: id.clone(),
        });

        loop {
            // Reload every iteration: an external stop is observed here.
            let state = self.recorder.load(id).await?;
            if let Some(outcome) = conclude(&self.runtime, &state)? {
                return Ok(outcome);
            }

            let batch = ready_batch(&plan, &state);
            if batch.is_empty() {
                if plan.order().iter().all(|n| state.is_executed(n)) {
                    return self.complete(id).await;
                }
                let stuck = ConfluxError::Graph("no runnable node left in execution order".to_string());
                return self.fail(id, stuck).await;
            }

            let (human, automatic): (Vec<&Node>, Vec<&Node>) = batch
                .iter()
                .filter_map(|n| state.graph.node(n))
                .partition(|n| n.requires_human_input());

            if automatic.is_empty() {
                // Only one human-input node is handled at a time.
                let Some(node) = human.first() else {
                    let missing = ConfluxError::Graph(format!("unknown nodes in plan: {:?}", batch));
                    return self.fail(id, missing).await;
                };
                return self.pause_for_human(&plan, &state, node).await;
            }

            if let Some(outcome) = self.run_generation(&plan, &state, &automatic).await? {
                return Ok(outcome);
            }
        }
    }

    /// Run one generation concurrently and apply the results in plan order.
    async fn run_generation(
        &self,
        plan: &ExecutionPlan,
        state: &ExecutionState,
        nodes: &[&Node],
    ) -> Result<Option<RunOutcome>> {
        if nodes.len() > 1 {
            debug!(execution_id = %state.id, nodes = nodes.len(), "Dispatching generation concurrently");
        }
        for node in nodes {
            self.runtime.events.publish(WorkflowEvent::NodeStarted {
                execution_id: state.id.clone(),
                node_id: node.id.clone(),
            });
        }

        let limit = self.runtime.config.max_parallel_nodes.max(1);
        // Collected up front so the spawned run future is provably `Send`.
        let mut dispatches = Vec::with_capacity(nodes.len());
        for &node in nodes {
            dispatches.push(self.dispatch(plan, state, node));
        }
        let runs: Vec<NodeRun> = stream::iter(dispatches)
            .buffered(limit)
            .collect()
            .await;

        // Outcomes stay in plan order so one commit numbers them by position.
        let mut settled: Vec<(String, NodeOutcome, u64)> = Vec::new();
        let mut review_seen = false;
        let mut failure: Option<ConfluxError> = None;
        for run in runs {
            match run.result {
                Ok(outcome @ NodeOutcome::Finished(_)) => {
                    settled.push((run.node_id, outcome, run.elapsed_ms));
                }
                Ok(NodeOutcome::AwaitingReview { review, partial }) => {
                    if review_seen {
                        debug!(node_id = %run.node_id, reviewer = %review.reviewer, "Second human review in generation deferred");
                    } else {
                        let outcome = NodeOutcome::AwaitingReview { partial, review };
                        review_seen = true;
                        settled.push((run.node_id, outcome, run.elapsed_ms));
                    }
                }
                Err(e) => {
                    error!(execution_id = %state.id, node_id = %run.node_id, error = %e, "Node failed");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        let config = &self.runtime.config;
        let fallback = &config.pause_fallback_title;
        let failure_text = failure.as_ref().map(|e| e.to_string());
        let committed = self
            .recorder
            .commit(&state.id, StateField::PROGRESS, |s| {
                let proceed = s.status == ExecutionStatus::Running && failure_text.is_none();
                let mut pending = None;
                for (node_id, outcome, _) in &settled {
                    match outcome {
                        NodeOutcome::Finished(out) => {
                            out.record(s, Some(node_id));
                        }
                        NodeOutcome::AwaitingReview { partial, .. } => {
                            if !proceed || s.is_executed(node_id) {
                                continue;
                            }
                            // Another resume may have answered the reviewer meanwhile.
                            let next = s
                                .graph
                                .node(node_id)
                                .and_then(|src| pending_human_review(s, src, &partial.output, config))
                                .and_then(|r| s.graph.node(&r.reviewer).cloned().map(|n| (n, r)));
                            match next {
                                Some((reviewer, review)) => {
                                    partial.record(s, None);
                                    pending = Some(pause::pause_context(
                                        s,
                                        &reviewer,
                                        None,
                                        Some(review.reflection),
                                        fallback,
                                    ));
                                }
                                // Every reviewer already answered: the response stands.
                                None => {
                                    partial.record(s, Some(node_id));
                                }
                            }
                        }
                    }
                }
                if s.status != ExecutionStatus::Running {
                    return Ok(());
                }
                if let Some(text) = &failure_text {
                    s.status = ExecutionStatus::Failed;
                    s.error = Some(text.clone());
                } else if let Some(ctx) = pending {
                    pause::suspend(s, ctx);
                }
                Ok(())
            })
            .await?;

        for (node_id, outcome, elapsed_ms) in &settled {
            let done = matches!(outcome, NodeOutcome::Finished(_)) || committed.is_executed(node_id);
            if !done {
                continue;
            }
            debug!(execution_id = %state.id, node_id = %node_id, elapsed_ms, "Node complete");
            self.runtime.events.publish(WorkflowEvent::NodeCompleted {
                execution_id: state.id.clone(),
                node_id: node_id.clone(),
                elapsed_ms: *elapsed_ms,
            });
        }

        conclude(&self.runtime, &committed)
    }

    async fn dispatch(&self, plan: &ExecutionPlan, state: &ExecutionState, node: &Node) -> NodeRun {
        let started = Instant::now();
        let sources = upstream_sources(plan, state, &node.id);
        let result = self.execute_node(state, node, &sources).await;
        NodeRun {
            node_id: node.id.clone(),
            result,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn execute_node(
        &self,
        state: &ExecutionState,
        node: &Node,
        sources: &[String],
    ) -> Result<NodeOutcome> {
        let rt = self.runtime.as_ref();
        match &node.config {
            NodeConfig::Start(cfg) => {
                let seed = if state.initial_input.trim().is_empty() {
                    cfg.prompt.clone().unwrap_or_default()
                } else {
                    state.initial_input.clone()
                };
                let mut out = NodeOutput::new(&seed);
                out.push(marker(node, MessageKind::WorkflowStart, &seed));
                out.say("User", &seed);
                Ok(NodeOutcome::Finished(out))
            }
            NodeConfig::End(cfg) => {
                let closing = cfg.closing_message();
                let mut out = NodeOutput::new(closing);
                out.push(marker(node, MessageKind::WorkflowEnd, closing));
                Ok(NodeOutcome::Finished(out))
            }
            NodeConfig::ToolServer(cfg) => {
                let input = upstream_input(state, node, sources)?;
                Ok(NodeOutcome::Finished(
                    run_tool_server(rt, state, node, cfg, &input).await,
                ))
            }
            NodeConfig::GroupCoordinator(cfg) => {
                let input = upstream_input(state, node, sources)?;
                let task = prompt::node_prompt(&rt.config, &state.conversation_history, &input);
                let (reply, out) = coordinate(rt, state, node, cfg, &task).await?;
                Ok(reflect(rt, state, node, &cfg.agent, reply, MessageKind::GroupChatSummary, out).await)
            }
            NodeConfig::UserProxy(cfg) if cfg.human_input => Err(ConfluxError::Graph(format!(
                "human-input node '{}' cannot run unattended",
                node.id
            ))),
            NodeConfig::Assistant(agent) | NodeConfig::Delegate(agent) => {
                self.run_agent(state, node, agent, sources).await
            }
            NodeConfig::UserProxy(cfg) => self.run_agent(state, node, &cfg.agent, sources).await,
        }
    }

    async fn run_agent(
        &self,
        state: &ExecutionState,
        node: &Node,
        agent: &AgentConfig,
        sources: &[String],
    ) -> Result<NodeOutcome> {
        let rt = self.runtime.as_ref();
        let input = upstream_input(state, node, sources)?;
        let text = prompt::node_prompt(&rt.config, &state.conversation_history, &input);
        let reply = rt
            .call_model(state.project.as_deref(), node, agent, text)
            .await?;
        Ok(reflect(rt, state, node, agent, reply, MessageKind::Chat, NodeOutput::default()).await)
    }

    async fn pause_for_human(
        &self,
        plan: &ExecutionPlan,
        state: &ExecutionState,
        node: &Node,
    ) -> Result<RunOutcome> {
        let sources = upstream_sources(plan, state, &node.id);
        let aggregated = match aggregate(&state.graph, &node.id, &sources, &state.executed_nodes) {
            Ok(ctx) => ctx,
            Err(e) => return self.fail(&state.id, e).await,
        };
        let summary = (!aggregated.is_empty()).then_some(aggregated.summary);

        info!(execution_id = %state.id, node_id = %node.id, "Waiting for human input");
        let fallback = &self.runtime.config.pause_fallback_title;
        let committed = self
            .recorder
            .commit(&state.id, &[StateField::Status, StateField::HumanInputContext], |s| {
                if s.status == ExecutionStatus::Running {
                    let ctx = pause::pause_context(s, node, summary.clone(), None, fallback);
                    pause::suspend(s, ctx);
                }
                Ok(())
            })
            .await?;

        conclude(&self.runtime, &committed)?.ok_or_else(|| ConfluxError::ResumeState {
            execution: state.id.0.clone(),
            reason: "execution did not settle after pausing".to_string(),
        })
    }

    async fn complete(&self, id: &ExecutionId) -> Result<RunOutcome> {
        let committed = self
            .recorder
            .commit(id, &[StateField::Status], |s| {
                if s.status == ExecutionStatus::Running {
                    s.status = ExecutionStatus::Completed;
                }
                Ok(())
            })
            .await?;
        conclude(&self.runtime, &committed)?.ok_or_else(|| ConfluxError::ResumeState {
            execution: id.0.clone(),
            reason: "execution did not settle after completing".to_string(),
        })
    }

    async fn fail(&self, id: &ExecutionId, err: ConfluxError) -> Result<RunOutcome> {
        error!(execution_id = %id, error = %err, "Execution failed");
        let text = err.to_string();
        let committed = self
            .recorder
            .commit(id, &[StateField::Status, StateField::Error], |s| {
                if s.status == ExecutionStatus::Running {
                    s.status = ExecutionStatus::Failed;
                    s.error = Some(text.clone());
                }
                Ok(())
            })
            .await?;
        conclude(&self.runtime, &committed)?.ok_or_else(|| ConfluxError::ResumeState {
            execution: id.0.clone(),
            reason: "execution did not settle after failing".to_string(),
        })
    }
}

/// The outcome of a settled execution, or `None` while it is running.
/// Publishes the matching terminal event.
pub(crate) fn conclude(rt: &NodeRuntime, state: &ExecutionState) -> Result<Option<RunOutcome>> {
    let execution_id = state.id.clone();
    let outcome = match state.status {
        ExecutionStatus::Running => return Ok(None),
        ExecutionStatus::Stopped => {
            info!(execution_id = %execution_id, "Execution stopped");
            rt.events.publish(WorkflowEvent::RunStopped {
                execution_id: execution_id.clone(),
            });
            RunOutcome::Stopped { execution_id }
        }
        ExecutionStatus::Failed => {
            let error = state.error.clone().unwrap_or_else(|| "unknown error".to_string());
            rt.events.publish(WorkflowEvent::RunFailed {
                execution_id: execution_id.clone(),
                error: error.clone(),
            });
            RunOutcome::Failed { execution_id, error }
        }
        ExecutionStatus::Completed => {
            info!(execution_id = %execution_id, messages = state.messages.len(), "Execution completed");
            rt.events.publish(WorkflowEvent::RunCompleted {
                execution_id,
                messages: state.messages.len(),
            });
            RunOutcome::Completed(Box::new(state.clone()))
        }
        ExecutionStatus::AwaitingHumanInput => {
            let ctx = state
                .human_input_context
                .as_ref()
                .ok_or_else(|| ConfluxError::ResumeState {
                    execution: execution_id.0.clone(),
                    reason: "paused without a pending node".to_string(),
                })?;
            rt.events.publish(WorkflowEvent::HumanInputRequired {
                execution_id: execution_id.clone(),
                node_id: ctx.node_id.clone(),
                prompt_title: ctx.prompt_title.clone(),
            });
            RunOutcome::Suspended(SuspensionDescriptor::from_context(&execution_id, ctx))
        }
    };
    Ok(Some(outcome))
}

/// Nodes ready to run now, in plan order.
///
/// Scanning starts at the first unexecuted node. A node whose unmet
/// dependencies are all in the batch waits for the next generation;
/// any other unmet dependency ends the scan.
pub(crate) fn ready_batch(plan: &ExecutionPlan, state: &ExecutionState) -> Vec<String> {
    let mut batch: Vec<String> = Vec::new();
    let Some(cursor) = plan.order().iter().position(|id| !state.is_executed(id)) else {
        return batch;
    };

    for id in &plan.order()[cursor..] {
        if state.is_executed(id) {
            continue;
        }
        let unmet: Vec<&String> = plan
            .dependencies(id)
            .iter()
            .filter(|d| !state.is_executed(d))
            .collect();
        if unmet.is_empty() {
            batch.push(id.clone());
        } else if unmet.iter().all(|d| batch.contains(d)) {
            continue;
        } else {
            break;
        }
    }
    batch
}

/// Input sources of a node that the plan schedules before it. Back edges
/// dropped while repairing a cycle are not aggregated.
fn upstream_sources(plan: &ExecutionPlan, state: &ExecutionState, node_id: &str) -> Vec<String> {
    let deps = plan.dependencies(node_id);
    find_inputs(&state.graph, node_id)
        .into_iter()
        .filter(|s| deps.contains(s))
        .collect()
}

/// Upstream context for a node: the aggregated outputs of its sources, or
/// the run's initial input when it has none.
fn upstream_input(state: &ExecutionState, node: &Node, sources: &[String]) -> Result<String> {
    if sources.is_empty() {
        return Ok(state.initial_input.clone());
    }
    Ok(aggregate(&state.graph, &node.id, sources, &state.executed_nodes)?.summary)
}

fn marker(node: &Node, kind: MessageKind, content: &str) -> MessageDraft {
    MessageDraft::new(&node.name, node.kind(), kind, content).with_metadata(MessageMetadata {
        node_id: Some(node.id.clone()),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::graph::{Edge, Graph};

    fn diamond() -> Graph {
        Graph::new(
            vec![
                Node::start("s"),
                Node::assistant("b"),
                Node::assistant("c"),
                Node::assistant("d"),
                Node::end("e"),
            ],
            vec![
                Edge::sequential("s", "b"),
                Edge::sequential("s", "c"),
                Edge::sequential("b", "d"),
                Edge::sequential("c", "d"),
                Edge::sequential("d", "e"),
            ],
        )
    }

    #[test]
    fn test_ready_batch_is_one_generation() {
        let graph = diamond();
        let plan = ExecutionPlan::parse(&graph);
        let mut state = ExecutionState::new(graph, "go");

        assert_eq!(ready_batch(&plan, &state), vec!["s"]);

        state.executed_nodes.insert("s".into(), "go".into());
        assert_eq!(ready_batch(&plan, &state), vec!["b", "c"]);

        state.executed_nodes.insert("b".into(), "x".into());
        assert_eq!(ready_batch(&plan, &state), vec!["c"]);

        state.executed_nodes.insert("c".into(), "y".into());
        assert_eq!(ready_batch(&plan, &state), vec!["d"]);
    }

    #[test]
    fn test_ready_batch_empty_when_done() {
        let graph = Graph::new(vec![Node::start("s")], vec![]);
        let plan = ExecutionPlan::parse(&graph);
        let mut state = ExecutionState::new(graph, "go");
        state.executed_nodes.insert("s".into(), "go".into());
        assert!(ready_batch(&plan, &state).is_empty());
    }

    #[test]
    fn test_independent_roots_share_a_generation() {
        let graph = Graph::new(
            vec![Node::assistant("x"), Node::assistant("y"), Node::assistant("z")],
            vec![Edge::sequential("x", "z")],
        );
        let plan = ExecutionPlan::parse(&graph);
        let state = ExecutionState::new(graph, "go");
        // z waits on x, which is in this batch; scanning continues past it.
        assert_eq!(ready_batch(&plan, &state), vec!["x", "y"]);
    }
}
