use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use conflux_core::config::EngineConfig;
use conflux_core::error::{ConfluxError, Result};
use conflux_core::event::EventBus;
use conflux_core::graph::Graph;
use conflux_core::state::{
    ExecutionState, HumanInput, HumanInputContext, ReflectionPause, RunOutcome, StateField,
};
use conflux_core::traits::{ExecutionStore, ModelProvider, ToolInvoker};
use conflux_core::types::{ExecutionId, ExecutionStatus, MessageKind, WorkflowEvent};

use crate::pause;
use crate::recorder::StateRecorder;
use crate::reflection::{pending_human_review, revise, revision_message};
use crate::runtime::NodeRuntime;
use crate::scheduler::{conclude, Scheduler};

/// Entry point for running workflows.
///
/// Each call drives one execution until it completes, fails, stops or
/// suspends for human input, and returns a [`RunOutcome`]. Requests that
/// are rejected before anything runs (unknown id, wrong status, a second
/// concurrent call on the same id, storage failures) return `Err`.
pub struct WorkflowEngine {
    runtime: Arc<NodeRuntime>,
    recorder: StateRecorder,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Releases an execution id from the in-flight set on drop.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        models: Arc<dyn ModelProvider>,
        tools: Arc<dyn ToolInvoker>,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        let recorder = StateRecorder::new(store, config.commit_retries);
        Self {
            runtime: Arc::new(NodeRuntime {
                models,
                tools,
                events,
                config,
            }),
            recorder,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.runtime.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.runtime.config
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        self.recorder.store()
    }

    /// Create an execution for `graph` and run it.
    pub async fn start(&self, graph: Graph, initial_input: &str) -> Result<RunOutcome> {
        self.launch(ExecutionState::new(graph, initial_input)).await
    }

    /// Like [`start`](Self::start), with a project context passed to model
    /// and tool resolution.
    pub async fn start_with_project(
        &self,
        graph: Graph,
        initial_input: &str,
        project: &str,
    ) -> Result<RunOutcome> {
        self.launch(ExecutionState::new(graph, initial_input).with_project(project))
            .await
    }

    async fn launch(&self, state: ExecutionState) -> Result<RunOutcome> {
        state.graph.validate()?;
        self.recorder.store().insert(&state).await?;
        info!(
            execution_id = %state.id,
            nodes = state.graph.nodes.len(),
            edges = state.graph.edges.len(),
            "Execution created"
        );
        let _guard = self.claim(&state.id)?;
        self.scheduler().run(&state.id).await
    }

    /// Resume a paused (or interrupted) execution with human input.
    pub async fn resume(&self, id: &ExecutionId, input: HumanInput) -> Result<RunOutcome> {
        let _guard = self.claim(id)?;
        let state = self.recorder.load(id).await?;
        pause::check_resumable(&state, &input)?;

        if let Some(ctx) = state.human_input_context.clone() {
            info!(execution_id = %id, node_id = %ctx.node_id, "Resuming with human input");
            if let Some(outcome) = self.apply_input(&state, ctx, &input).await? {
                return Ok(outcome);
            }
        } else {
            info!(execution_id = %id, "Nothing pending, continuing execution");
        }

        self.scheduler().run(id).await
    }

    /// Re-run the scheduler over a RUNNING execution. Nodes that already
    /// have an output are not dispatched again.
    pub async fn continue_run(&self, id: &ExecutionId) -> Result<RunOutcome> {
        let _guard = self.claim(id)?;
        let state = self.recorder.load(id).await?;
        if state.status == ExecutionStatus::AwaitingHumanInput {
            return conclude(&self.runtime, &state)?.ok_or_else(|| resume_error(id, "no pending node"));
        }
        self.scheduler().run(id).await
    }

    /// Mark a non-terminal execution STOPPED. A scheduler running it observes
    /// the stop before its next generation. Stopping a terminal execution is
    /// a no-op.
    pub async fn stop(&self, id: &ExecutionId) -> Result<ExecutionStatus> {
        let before = self.recorder.load(id).await?;
        if before.status.is_terminal() {
            return Ok(before.status);
        }

        let state = self
            .recorder
            .commit(id, &[StateField::Status, StateField::HumanInputContext], |s| {
                if !s.status.is_terminal() {
                    s.status = ExecutionStatus::Stopped;
                    s.human_input_context = None;
                }
                Ok(())
            })
            .await?;

        info!(execution_id = %id, status = %state.status, "Stop requested");
        // A paused execution has no scheduler left to report the stop.
        if before.status == ExecutionStatus::AwaitingHumanInput {
            self.runtime.events.publish(WorkflowEvent::RunStopped {
                execution_id: id.clone(),
            });
        }
        Ok(state.status)
    }

    pub async fn status(&self, id: &ExecutionId) -> Result<ExecutionState> {
        self.recorder.load(id).await
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(Arc::clone(&self.runtime), self.recorder.clone())
    }

    fn claim(&self, id: &ExecutionId) -> Result<InFlightGuard> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| resume_error(id, "in-flight registry is poisoned"))?;
        if !set.insert(id.0.clone()) {
            warn!(execution_id = %id, "Execution is already running");
            return Err(resume_error(id, "execution is already running"));
        }
        Ok(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            id: id.0.clone(),
        })
    }

    /// Record the human input against the pending pause. Returns an outcome
    /// when the run suspends again without reaching the scheduler.
    async fn apply_input(
        &self,
        state: &ExecutionState,
        ctx: HumanInputContext,
        input: &HumanInput,
    ) -> Result<Option<RunOutcome>> {
        let id = &state.id;
        let proxy = state
            .graph
            .node(&ctx.node_id)
            .cloned()
            .ok_or_else(|| resume_error(id, &format!("paused node '{}' is not in the graph", ctx.node_id)))?;

        let Some(reflection) = ctx.reflection.clone() else {
            self.recorder
                .commit(id, StateField::PROGRESS, |s| {
                    ensure_pending(s, &ctx)?;
                    pause::record_answer(s, &proxy, &input.text);
                    Ok(())
                })
                .await?;
            return Ok(None);
        };

        let source = state
            .graph
            .node(&reflection.reflection_source)
            .cloned()
            .ok_or_else(|| {
                resume_error(
                    id,
                    &format!("reflection source '{}' is not in the graph", reflection.reflection_source),
                )
            })?;

        let revision = revise(
            &self.runtime,
            state,
            &source,
            &reflection.source_message,
            &input.text,
        )
        .await;
        let response = revision
            .as_ref()
            .map(|r| r.text.clone())
            .unwrap_or_else(|| reflection.source_message.clone());
        let concluded = reflection.iteration >= reflection.max_iterations;
        let fallback = &self.runtime.config.pause_fallback_title;

        let committed = self
            .recorder
            .commit(id, StateField::PROGRESS, |s| {
                ensure_pending(s, &ctx)?;
                let feedback = pause::answer_message(
                    &proxy,
                    MessageKind::IterationFeedback,
                    &input.text,
                    Some(&reflection),
                );
                s.append_conversation(&proxy.name, &input.text);
                let mut drafts = vec![feedback];
                if let Some(reply) = &revision {
                    drafts.push(revision_message(&source, reflection.iteration, reply));
                    s.append_conversation(&source.name, &reply.text);
                }
                crate::audit::append(s, drafts);

                if concluded {
                    s.executed_nodes
                        .entry(proxy.id.clone())
                        .or_insert_with(|| input.text.clone());
                    let next = pending_human_review(s, &source, &response, &self.runtime.config)
                        .and_then(|r| s.graph.node(&r.reviewer).cloned().map(|n| (n, r)));
                    match next {
                        Some((reviewer, review)) => {
                            let ctx = pause::pause_context(s, &reviewer, None, Some(review.reflection), fallback);
                            pause::suspend(s, ctx);
                        }
                        None => {
                            s.executed_nodes
                                .entry(source.id.clone())
                                .or_insert_with(|| response.clone());
                            pause::clear(s);
                        }
                    }
                } else {
                    let next = ReflectionPause {
                        source_message: response.clone(),
                        iteration: reflection.iteration + 1,
                        ..reflection.clone()
                    };
                    let ctx = pause::pause_context(s, &proxy, None, Some(next), fallback);
                    pause::suspend(s, ctx);
                }
                Ok(())
            })
            .await?;

        self.runtime.events.publish(WorkflowEvent::ReflectionRound {
            execution_id: id.clone(),
            source: source.id.clone(),
            reviewer: proxy.id.clone(),
            iteration: reflection.iteration,
        });

        if concluded {
            info!(execution_id = %id, source = %source.id, rounds = reflection.iteration, "Human reflection concluded");
        }
        if committed.human_input_context.is_some() {
            return conclude(&self.runtime, &committed);
        }
        Ok(None)
    }
}

/// Reject a commit when the pause it answers is no longer the pending one.
fn ensure_pending(state: &ExecutionState, ctx: &HumanInputContext) -> Result<()> {
    if state.human_input_context.as_ref() == Some(ctx) {
        return Ok(());
    }
    Err(resume_error(&state.id, "the pending human input changed"))
}

fn resume_error(id: &ExecutionId, reason: &str) -> ConfluxError {
    ConfluxError::ResumeState {
        execution: id.0.clone(),
        reason: reason.to_string(),
    }
}
