use std::sync::Arc;

use conflux_core::config::EngineConfig;
use conflux_core::error::ConfluxError;
use conflux_core::event::EventBus;
use conflux_core::graph::{Edge, Graph, InputMode, Node};
use conflux_core::state::{ExecutionState, HumanInput, RunOutcome};
use conflux_core::traits::ExecutionStore;
use conflux_core::types::{ExecutionStatus, MessageKind, WorkflowEvent};
use conflux_engine::{audit, ExecutionPlan, WorkflowEngine};
use conflux_store::MemoryExecutionStore;
use conflux_test_utils::fixtures::{agent, human, linear};
use conflux_test_utils::{RecordingToolInvoker, ScriptedModel};

fn engine(model: &ScriptedModel) -> WorkflowEngine {
    WorkflowEngine::new(
        Arc::new(MemoryExecutionStore::new()),
        Arc::new(model.clone()),
        Arc::new(RecordingToolInvoker::new()),
        Arc::new(EventBus::default()),
        EngineConfig::default(),
    )
}

fn completed(outcome: RunOutcome) -> ExecutionState {
    match outcome {
        RunOutcome::Completed(state) => *state,
        other => panic!("expected completion, got {:?}", other),
    }
}

fn kinds(state: &ExecutionState) -> Vec<MessageKind> {
    state.messages.iter().map(|m| m.kind).collect()
}

#[tokio::test]
async fn test_linear_run_completes() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = linear(&["a"]);

    let plan = ExecutionPlan::parse(&graph);
    assert_eq!(plan.order(), ["start", "a", "end"]);

    let state = completed(engine.start(graph, "hello").await.unwrap());
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(
        kinds(&state),
        vec![MessageKind::WorkflowStart, MessageKind::Chat, MessageKind::WorkflowEnd]
    );
    assert_eq!(
        state.messages.iter().map(|m| m.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(state.output_of("start"), Some("hello"));
    assert_eq!(state.output_of("a"), Some("a reply 1"));
    assert_eq!(state.output_of("end"), Some("Workflow completed."));
    assert_eq!(state.conversation_history, "User: hello\na: a reply 1");

    let prompts = model.prompts("a");
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].starts_with("Conversation so far:\nUser: hello"));
    assert!(prompts[0].ends_with("Input:\nhello"));
}

#[tokio::test]
async fn test_self_reflection_adds_one_round() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let mut graph = linear(&["a", "b"]);
    graph
        .edges
        .push(Edge::reflection("a", "a").with_max_iterations(2));

    let state = completed(engine.start(graph, "draft").await.unwrap());
    assert_eq!(model.calls("a"), 2);
    assert_eq!(model.calls("b"), 1);
    assert_eq!(state.output_of("a"), Some("a reply 2"));

    let a_messages: Vec<_> = state
        .messages
        .iter()
        .filter(|m| m.metadata.node_id.as_deref() == Some("a"))
        .collect();
    assert_eq!(a_messages.len(), 1);
    assert_eq!(a_messages[0].metadata.reflection_rounds, Some(1));
    // b sees the settled response.
    assert!(model.prompts("b")[0].ends_with("Input:\na reply 2"));
}

#[tokio::test]
async fn test_human_pause_and_resume() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![Node::start("start"), agent("a"), human("proxy", InputMode::Admin), Node::end("end")],
        vec![
            Edge::sequential("start", "a"),
            Edge::sequential("a", "proxy"),
            Edge::sequential("proxy", "end"),
        ],
    );

    let outcome = engine.start(graph, "go").await.unwrap();
    let RunOutcome::Suspended(pause) = outcome else {
        panic!("expected suspension, got {:?}", outcome);
    };
    assert_eq!(pause.status, ExecutionStatus::AwaitingHumanInput);
    assert_eq!(pause.target_node, "proxy");
    assert_eq!(pause.prompt_title, "Human input required");
    assert_eq!(pause.last_message.as_deref(), Some("a reply 1"));
    assert!(pause.input_token.is_none());

    let id = pause.execution_id.clone();
    let paused = engine.status(&id).await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::AwaitingHumanInput);
    assert!(!paused.is_executed("proxy"));
    let ctx = paused.human_input_context.unwrap();
    assert_eq!(ctx.aggregated_context.as_deref(), Some("a reply 1"));

    let state = completed(engine.resume(&id, HumanInput::new("ok")).await.unwrap());
    assert_eq!(state.output_of("proxy"), Some("ok"));
    assert!(state.is_executed("end"));
    assert!(state.human_input_context.is_none());
    assert_eq!(model.calls("a"), 1);
}

#[tokio::test]
async fn test_fan_out_runs_as_one_generation() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let mut events = engine.event_bus().subscribe();

    let state = completed(
        engine
            .start(conflux_test_utils::fixtures::diamond(), "topic")
            .await
            .unwrap(),
    );

    let order: Vec<&str> = state
        .messages
        .iter()
        .map(|m| m.agent_name.as_str())
        .collect();
    assert_eq!(order, vec!["start", "left", "right", "merge", "end"]);

    let merge_prompt = &model.prompts("merge")[0];
    assert!(merge_prompt.contains("Inputs from 2 upstream nodes:"));
    assert!(merge_prompt.contains("[left]\nleft reply 1"));
    assert!(merge_prompt.contains("[right]\nright reply 1"));

    // Both branches are dispatched before either is recorded.
    let mut trace = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            WorkflowEvent::NodeStarted { node_id, .. } => trace.push(format!("start:{}", node_id)),
            WorkflowEvent::NodeCompleted { node_id, .. } => trace.push(format!("done:{}", node_id)),
            _ => {}
        }
    }
    let pos = |s: &str| trace.iter().position(|t| t == s).unwrap();
    assert!(pos("start:right") < pos("done:left"));
    assert!(pos("done:left") < pos("start:merge"));
    assert!(pos("done:right") < pos("start:merge"));
}

#[tokio::test]
async fn test_resume_on_completed_execution_is_rejected() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let state = completed(engine.start(linear(&["a"]), "hi").await.unwrap());
    let before = engine.status(&state.id).await.unwrap();

    for _ in 0..2 {
        let err = engine
            .resume(&state.id, HumanInput::new("again"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfluxError::ResumeState { .. }));
    }
    assert_eq!(engine.status(&state.id).await.unwrap(), before);
    assert_eq!(model.total_calls(), 1);
}

#[tokio::test]
async fn test_continue_is_idempotent() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let state = completed(engine.start(linear(&["a", "b"]), "hi").await.unwrap());

    let again = completed(engine.continue_run(&state.id).await.unwrap());
    assert_eq!(again.messages, state.messages);
    assert_eq!(again.executed_nodes, state.executed_nodes);
    assert_eq!(model.total_calls(), 2);
}

#[tokio::test]
async fn test_continue_skips_recorded_nodes() {
    let model = ScriptedModel::new();
    let engine = engine(&model);

    let mut state = ExecutionState::new(linear(&["a", "b"]), "hi");
    state.executed_nodes.insert("start".into(), "hi".into());
    state.executed_nodes.insert("a".into(), "earlier answer".into());
    engine.store().insert(&state).await.unwrap();

    let done = completed(engine.continue_run(&state.id).await.unwrap());
    assert_eq!(model.calls("a"), 0);
    assert_eq!(model.calls("b"), 1);
    assert!(model.prompts("b")[0].ends_with("Input:\nearlier answer"));
    assert_eq!(done.output_of("a"), Some("earlier answer"));
}

#[tokio::test]
async fn test_sequences_increase_across_pauses() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![
            Node::start("start"),
            agent("a"),
            human("h1", InputMode::Admin),
            agent("b"),
            human("h2", InputMode::Admin),
            Node::end("end"),
        ],
        vec![
            Edge::sequential("start", "a"),
            Edge::sequential("a", "h1"),
            Edge::sequential("h1", "b"),
            Edge::sequential("b", "h2"),
            Edge::sequential("h2", "end"),
        ],
    );

    let first = engine.start(graph, "go").await.unwrap();
    let id = first.execution_id().clone();
    assert_eq!(first.status(), ExecutionStatus::AwaitingHumanInput);

    let second = engine.resume(&id, HumanInput::new("one")).await.unwrap();
    let RunOutcome::Suspended(pause) = second else {
        panic!("expected second pause");
    };
    assert_eq!(pause.target_node, "h2");
    assert_eq!(pause.last_message.as_deref(), Some("one"));

    let state = completed(engine.resume(&id, HumanInput::new("two")).await.unwrap());
    assert!(audit::is_well_ordered(&state));
    let sequences: Vec<u64> = state.messages.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, (1..=6).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_proxies_are_identified_by_id() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![
            Node::start("start"),
            human("h1", InputMode::Admin).with_name("Reviewer"),
            human("h2", InputMode::Admin).with_name("Reviewer"),
            Node::end("end"),
        ],
        vec![
            Edge::sequential("start", "h1"),
            Edge::sequential("h1", "h2"),
            Edge::sequential("h2", "end"),
        ],
    );

    let first = engine.start(graph, "go").await.unwrap();
    let id = first.execution_id().clone();
    let RunOutcome::Suspended(pause) = engine.resume(&id, HumanInput::new("first")).await.unwrap() else {
        panic!("expected second pause");
    };
    assert_eq!(pause.target_node, "h2");
    assert_eq!(pause.target_name, "Reviewer");

    let state = completed(engine.resume(&id, HumanInput::new("second")).await.unwrap());
    assert_eq!(state.output_of("h1"), Some("first"));
    assert_eq!(state.output_of("h2"), Some("second"));
}

#[tokio::test]
async fn test_deployment_pause_needs_token() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![Node::start("start"), human("approve", InputMode::Deployment), Node::end("end")],
        vec![
            Edge::sequential("start", "approve"),
            Edge::sequential("approve", "end"),
        ],
    );

    let RunOutcome::Suspended(pause) = engine.start(graph, "go").await.unwrap() else {
        panic!("expected suspension");
    };
    assert_eq!(pause.input_mode, InputMode::Deployment);
    let token = pause.input_token.clone().unwrap();
    let id = pause.execution_id;

    for input in [HumanInput::new("yes"), HumanInput::new("yes").with_token("forged")] {
        let err = engine.resume(&id, input).await.unwrap_err();
        assert!(matches!(err, ConfluxError::ResumeState { .. }));
    }
    assert_eq!(
        engine.status(&id).await.unwrap().status,
        ExecutionStatus::AwaitingHumanInput
    );

    let state = completed(engine.resume(&id, HumanInput::new("yes").with_token(token)).await.unwrap());
    assert_eq!(state.output_of("approve"), Some("yes"));
}

#[tokio::test]
async fn test_cyclic_graph_is_repaired_and_runs() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![Node::start("start"), agent("a"), agent("b"), Node::end("end")],
        vec![
            Edge::sequential("start", "a"),
            Edge::sequential("a", "b"),
            Edge::sequential("b", "a"),
            Edge::sequential("b", "end"),
        ],
    );

    let plan = ExecutionPlan::parse(&graph);
    assert_eq!(plan.order(), ["start", "a", "b", "end"]);
    assert_eq!(plan.repaired(), ["a", "b", "end"]);

    let state = completed(engine.start(graph, "loop").await.unwrap());
    assert_eq!(model.calls("a"), 1);
    assert_eq!(model.calls("b"), 1);
    assert!(model.prompts("a")[0].ends_with("Input:\nloop"));
    assert!(model.prompts("b")[0].ends_with("Input:\na reply 1"));
    assert_eq!(state.executed_nodes.len(), 4);
}

#[tokio::test]
async fn test_model_failure_fails_the_run() {
    let model = ScriptedModel::new().fail("a", "rate limited");
    let engine = engine(&model);

    let outcome = engine.start(linear(&["a", "b"]), "hi").await.unwrap();
    let RunOutcome::Failed { execution_id, error } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(error.contains("Model call failed for node 'a'"));
    assert!(error.contains("rate limited"));

    let state = engine.status(&execution_id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(state.error.as_deref(), Some(error.as_str()));
    assert!(!state.is_executed("b"));
    assert_eq!(model.calls("b"), 0);
}

#[tokio::test]
async fn test_empty_model_content_is_an_error() {
    let model = ScriptedModel::new().empty("a");
    let engine = engine(&model);
    let outcome = engine.start(linear(&["a"]), "hi").await.unwrap();
    assert_eq!(outcome.status(), ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_unknown_provider_fails_the_run() {
    let model = ScriptedModel::new().without_provider("mock");
    let engine = engine(&model);
    let outcome = engine.start(linear(&["a"]), "hi").await.unwrap();
    let RunOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure");
    };
    assert!(error.contains("No model provider configured: mock"));
    assert_eq!(model.total_calls(), 0);
}

#[tokio::test]
async fn test_stop_paused_execution() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![Node::start("start"), human("h", InputMode::Admin), Node::end("end")],
        vec![Edge::sequential("start", "h"), Edge::sequential("h", "end")],
    );
    let id = engine.start(graph, "go").await.unwrap().execution_id().clone();

    assert_eq!(engine.stop(&id).await.unwrap(), ExecutionStatus::Stopped);
    let state = engine.status(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Stopped);
    assert!(state.human_input_context.is_none());

    // Terminal: stop is a no-op, resume is rejected.
    assert_eq!(engine.stop(&id).await.unwrap(), ExecutionStatus::Stopped);
    assert!(engine.resume(&id, HumanInput::new("late")).await.is_err());
}

#[tokio::test]
async fn test_invalid_graph_is_rejected_before_running() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![Node::start("start")],
        vec![Edge::sequential("start", "ghost")],
    );
    let err = engine.start(graph, "hi").await.unwrap_err();
    assert!(matches!(err, ConfluxError::Graph(_)));
}

#[tokio::test]
async fn test_unknown_execution_is_not_found() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let id = conflux_core::types::ExecutionId::from_str("missing");
    let err = engine.resume(&id, HumanInput::new("x")).await.unwrap_err();
    assert!(matches!(err, ConfluxError::ExecutionNotFound(_)));
}
