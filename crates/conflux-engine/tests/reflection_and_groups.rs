use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use conflux_core::config::EngineConfig;
use conflux_core::error::Result;
use conflux_core::event::EventBus;
use conflux_core::graph::{CoordinationMode, Edge, Graph, InputMode, ModelSettings, Node};
use conflux_core::state::{ExecutionState, HumanInput, RunOutcome};
use conflux_core::traits::{ExecutionStore, ModelClient, ModelProvider};
use conflux_core::types::{
    ExecutionStatus, GenerateRequest, Generation, MessageKind, WorkflowEvent,
};
use conflux_engine::WorkflowEngine;
use conflux_store::{MemoryExecutionStore, SqliteExecutionStore};
use conflux_test_utils::fixtures::{agent, coordinator, delegate, human, tool_server};
use conflux_test_utils::{RecordingToolInvoker, ScriptedModel};

fn engine_with(
    store: Arc<dyn ExecutionStore>,
    models: Arc<dyn ModelProvider>,
    tools: RecordingToolInvoker,
) -> WorkflowEngine {
    WorkflowEngine::new(
        store,
        models,
        Arc::new(tools),
        Arc::new(EventBus::default()),
        EngineConfig::default(),
    )
}

fn engine(model: &ScriptedModel) -> WorkflowEngine {
    engine_with(
        Arc::new(MemoryExecutionStore::new()),
        Arc::new(model.clone()),
        RecordingToolInvoker::new(),
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

/// `start -> writer -> end` with `writer` reviewed by `reviewer`.
fn reviewed(reviewer: Node, max_iterations: u32) -> Graph {
    let reviewer_id = reviewer.id.clone();
    let mut edges = vec![
        Edge::sequential("start", "writer"),
        Edge::reflection("writer", &reviewer_id).with_max_iterations(max_iterations),
    ];
    if reviewer.requires_human_input() {
        edges.push(Edge::sequential(&reviewer_id, "end"));
    } else {
        edges.push(Edge::sequential("writer", "end"));
    }
    Graph::new(
        vec![Node::start("start"), agent("writer"), reviewer, Node::end("end")],
        edges,
    )
}

#[tokio::test]
async fn test_automatic_reviewer_revises_inline() {
    let model = ScriptedModel::new();
    let engine = engine(&model);

    let state = completed(engine.start(reviewed(agent("critic"), 1), "essay").await.unwrap());
    assert_eq!(model.calls("writer"), 2);
    assert_eq!(model.calls("critic"), 1);
    assert_eq!(state.output_of("writer"), Some("writer reply 2"));
    assert!(!state.is_executed("critic"));
    assert_eq!(
        kinds(&state),
        vec![
            MessageKind::WorkflowStart,
            MessageKind::Chat,
            MessageKind::ReflectionFeedback,
            MessageKind::ReflectionRevision,
            MessageKind::WorkflowEnd,
        ]
    );

    let revision = &state.messages[3];
    assert_eq!(revision.metadata.reflection_source.as_deref(), Some("writer"));
    assert_eq!(revision.metadata.iteration, Some(1));
    assert!(model.prompts("critic")[0].contains("writer reply 1"));
}

#[tokio::test]
async fn test_failed_review_keeps_original_response() {
    let model = ScriptedModel::new().fail("critic", "timeout");
    let engine = engine(&model);

    let state = completed(engine.start(reviewed(agent("critic"), 2), "essay").await.unwrap());
    assert_eq!(state.output_of("writer"), Some("writer reply 1"));
    assert_eq!(model.calls("writer"), 1);
    assert_eq!(
        kinds(&state),
        vec![MessageKind::WorkflowStart, MessageKind::Chat, MessageKind::WorkflowEnd]
    );
}

#[tokio::test]
async fn test_human_reflection_loop_is_bounded() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = reviewed(human("editor", InputMode::Admin), 2);

    let RunOutcome::Suspended(first) = engine.start(graph, "essay").await.unwrap() else {
        panic!("expected review pause");
    };
    assert_eq!(first.target_node, "editor");
    let reflection = first.reflection.clone().unwrap();
    assert_eq!(reflection.reflection_source, "writer");
    assert_eq!(reflection.source_message, "writer reply 1");
    assert_eq!(reflection.iteration, 1);
    assert_eq!(reflection.max_iterations, 2);

    let id = first.execution_id.clone();
    let paused = engine.status(&id).await.unwrap();
    assert!(!paused.is_executed("writer"));

    let RunOutcome::Suspended(second) = engine
        .resume(&id, HumanInput::new("shorter please"))
        .await
        .unwrap()
    else {
        panic!("expected a second review round");
    };
    let reflection = second.reflection.unwrap();
    assert_eq!(reflection.iteration, 2);
    assert_eq!(reflection.source_message, "writer reply 2");
    assert!(model.prompts("writer")[1].contains("shorter please"));

    let state = completed(engine.resume(&id, HumanInput::new("approved")).await.unwrap());
    assert_eq!(model.calls("writer"), 3);
    assert_eq!(state.output_of("writer"), Some("writer reply 3"));
    assert_eq!(state.output_of("editor"), Some("approved"));
    assert_eq!(
        kinds(&state),
        vec![
            MessageKind::WorkflowStart,
            MessageKind::Chat,
            MessageKind::IterationFeedback,
            MessageKind::ReflectionRevision,
            MessageKind::IterationFeedback,
            MessageKind::ReflectionRevision,
            MessageKind::WorkflowEnd,
        ]
    );
}

#[tokio::test]
async fn test_deployment_review_uses_same_bound() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = reviewed(human("editor", InputMode::Deployment), 1);

    let RunOutcome::Suspended(pause) = engine.start(graph, "essay").await.unwrap() else {
        panic!("expected review pause");
    };
    let token = pause.input_token.clone().unwrap();
    assert!(engine
        .resume(&pause.execution_id, HumanInput::new("ok"))
        .await
        .is_err());

    let state = completed(
        engine
            .resume(&pause.execution_id, HumanInput::new("ok").with_token(token))
            .await
            .unwrap(),
    );
    assert_eq!(model.calls("writer"), 2);
    assert_eq!(state.output_of("editor"), Some("ok"));
}

#[tokio::test]
async fn test_intelligent_coordinator_assigns_subqueries() {
    let model = ScriptedModel::new()
        .reply(
            "lead",
            r#"Plan: [{"delegate": "d1", "query": "find sources"}, {"delegate": "d2", "query": "draft outline"}]"#,
        )
        .reply("lead", "final answer");
    let engine = engine(&model);
    let graph = Graph::new(
        vec![
            Node::start("start"),
            coordinator("lead", CoordinationMode::Intelligent),
            delegate("d1"),
            delegate("d2"),
            Node::end("end"),
        ],
        vec![
            Edge::sequential("start", "lead"),
            Edge::delegate("lead", "d1"),
            Edge::delegate("lead", "d2"),
            Edge::sequential("lead", "end"),
        ],
    );

    let state = completed(engine.start(graph, "write a report").await.unwrap());
    assert_eq!(model.prompts("d1"), vec!["find sources".to_string()]);
    assert_eq!(model.prompts("d2"), vec!["draft outline".to_string()]);
    assert_eq!(state.output_of("lead"), Some("final answer"));
    assert!(!state.is_executed("d1"));

    assert_eq!(
        kinds(&state),
        vec![
            MessageKind::WorkflowStart,
            MessageKind::DelegateResponse,
            MessageKind::DelegateResponse,
            MessageKind::GroupChatSummary,
            MessageKind::WorkflowEnd,
        ]
    );
    assert_eq!(state.messages[1].metadata.subquery_id.as_deref(), Some("lead-q1"));
    assert_eq!(state.messages[2].metadata.subquery_id.as_deref(), Some("lead-q2"));
    assert_eq!(state.messages[3].metadata.coordinator.as_deref(), Some("lead"));
}

#[tokio::test]
async fn test_round_robin_delegates_see_discussion() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![
            Node::start("start"),
            coordinator("lead", CoordinationMode::RoundRobin),
            delegate("d1"),
            delegate("d2"),
        ],
        vec![
            Edge::sequential("start", "lead"),
            Edge::delegate("lead", "d1"),
            Edge::delegate("lead", "d2"),
        ],
    );

    let state = completed(engine.start(graph, "brainstorm").await.unwrap());
    assert!(model.prompts("d2")[0].contains("d1: d1 reply 1"));
    assert_eq!(state.messages[1].metadata.round, Some(1));
    assert_eq!(state.output_of("lead"), Some("lead reply 1"));
}

#[tokio::test]
async fn test_tool_server_calls_first_listed_tool() {
    let model = ScriptedModel::new();
    let tools = RecordingToolInvoker::new().with_simple_tool(
        "search",
        "lookup",
        serde_json::json!("three results"),
    );
    let engine = engine_with(
        Arc::new(MemoryExecutionStore::new()),
        Arc::new(model.clone()),
        tools.clone(),
    );
    let graph = Graph::new(
        vec![Node::start("start"), tool_server("web", "search", None), Node::end("end")],
        vec![Edge::sequential("start", "web"), Edge::sequential("web", "end")],
    );

    let state = completed(engine.start(graph, "rust async").await.unwrap());
    assert_eq!(state.output_of("web"), Some("three results"));
    assert_eq!(
        tools.invocations(),
        vec![(
            "search".to_string(),
            "lookup".to_string(),
            serde_json::json!({ "query": "rust async" })
        )]
    );
    let response = &state.messages[1];
    assert_eq!(response.kind, MessageKind::ToolResponse);
    assert_eq!(response.metadata.tool.as_deref(), Some("lookup"));
}

#[tokio::test]
async fn test_tool_failure_does_not_fail_run() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![Node::start("start"), tool_server("web", "offline", None), agent("a")],
        vec![Edge::sequential("start", "web"), Edge::sequential("web", "a")],
    );

    let state = completed(engine.start(graph, "q").await.unwrap());
    let output = state.output_of("web").unwrap();
    assert!(output.starts_with("Tool error:"));
    assert!(model.prompts("a")[0].ends_with(output));
}

/// Holds calls to one model until released.
#[derive(Clone)]
struct GatedModel {
    inner: ScriptedModel,
    gated: String,
    gate: Arc<Notify>,
}

impl ModelProvider for GatedModel {
    fn client_for(
        &self,
        _project: Option<&str>,
        _settings: &ModelSettings,
    ) -> Result<Arc<dyn ModelClient>> {
        Ok(Arc::new(self.clone()))
    }
}

impl ModelClient for GatedModel {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            if request.model == self.gated {
                self.gate.notified().await;
            }
            self.inner.generate(request).await
        })
    }
}

#[tokio::test]
async fn test_stop_is_observed_between_generations() {
    let scripted = ScriptedModel::new();
    let gate = Arc::new(Notify::new());
    let models = GatedModel {
        inner: scripted.clone(),
        gated: "a".to_string(),
        gate: gate.clone(),
    };
    let engine = Arc::new(engine_with(
        Arc::new(MemoryExecutionStore::new()),
        Arc::new(models),
        RecordingToolInvoker::new(),
    ));
    let mut events = engine.event_bus().subscribe();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .start(conflux_test_utils::fixtures::linear(&["a", "b"]), "go")
                .await
        })
    };

    let id = loop {
        match events.recv().await.unwrap() {
            WorkflowEvent::NodeStarted { execution_id, node_id } if node_id == "a" => {
                break execution_id
            }
            _ => {}
        }
    };
    assert_eq!(engine.stop(&id).await.unwrap(), ExecutionStatus::Stopped);
    gate.notify_one();

    let outcome = runner.await.unwrap().unwrap();
    assert!(matches!(outcome, RunOutcome::Stopped { .. }));
    assert_eq!(scripted.calls("b"), 0);
    let state = engine.status(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Stopped);
    assert!(!state.is_executed("b"));
}

#[tokio::test]
async fn test_second_concurrent_invocation_is_rejected() {
    let scripted = ScriptedModel::new();
    let gate = Arc::new(Notify::new());
    let models = GatedModel {
        inner: scripted.clone(),
        gated: "a".to_string(),
        gate: gate.clone(),
    };
    let engine = Arc::new(engine_with(
        Arc::new(MemoryExecutionStore::new()),
        Arc::new(models),
        RecordingToolInvoker::new(),
    ));
    let mut events = engine.event_bus().subscribe();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .start(conflux_test_utils::fixtures::linear(&["a"]), "go")
                .await
        })
    };
    let id = loop {
        if let WorkflowEvent::RunStarted { execution_id } = events.recv().await.unwrap() {
            break execution_id;
        }
    };

    let err = engine.continue_run(&id).await.unwrap_err();
    assert!(err.to_string().contains("already running"));

    gate.notify_one();
    let outcome = runner.await.unwrap().unwrap();
    assert_eq!(outcome.status(), ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_sqlite_store_survives_restart_while_paused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("executions.db");
    let model = ScriptedModel::new();
    let graph = Graph::new(
        vec![Node::start("start"), agent("a"), human("h", InputMode::Admin), Node::end("end")],
        vec![
            Edge::sequential("start", "a"),
            Edge::sequential("a", "h"),
            Edge::sequential("h", "end"),
        ],
    );

    let id = {
        let store = Arc::new(SqliteExecutionStore::open(&path).unwrap());
        let engine = engine_with(store, Arc::new(model.clone()), RecordingToolInvoker::new());
        let outcome = engine.start(graph, "go").await.unwrap();
        assert_eq!(outcome.status(), ExecutionStatus::AwaitingHumanInput);
        outcome.execution_id().clone()
    };

    let store = Arc::new(SqliteExecutionStore::open(&path).unwrap());
    let engine = engine_with(store, Arc::new(model.clone()), RecordingToolInvoker::new());
    let state = completed(engine.resume(&id, HumanInput::new("fine")).await.unwrap());
    assert_eq!(state.output_of("h"), Some("fine"));
    assert_eq!(model.calls("a"), 1);
    assert_eq!(
        state.messages.iter().map(|m| m.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
}

#[tokio::test]
async fn test_human_reviewer_shared_by_two_sources_answers_once() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![
            Node::start("start"),
            agent("x"),
            agent("y"),
            human("editor", InputMode::Admin),
            Node::end("end"),
        ],
        vec![
            Edge::sequential("start", "x"),
            Edge::sequential("x", "y"),
            Edge::sequential("y", "end"),
            Edge::reflection("x", "editor").with_max_iterations(1),
            Edge::reflection("y", "editor").with_max_iterations(1),
        ],
    );

    let RunOutcome::Suspended(pause) = engine.start(graph, "essay").await.unwrap() else {
        panic!("expected review pause");
    };
    assert_eq!(pause.target_node, "editor");
    assert_eq!(pause.reflection.unwrap().reflection_source, "x");

    let resumed = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        engine.resume(&pause.execution_id, HumanInput::new("ok")),
    )
    .await
    .expect("run settles after the review");
    let state = completed(resumed.unwrap());
    assert_eq!(model.calls("x"), 2);
    assert_eq!(model.calls("y"), 1);
    assert_eq!(state.output_of("x"), Some("x reply 2"));
    assert_eq!(state.output_of("y"), Some("y reply 1"));
    assert_eq!(state.output_of("editor"), Some("ok"));
}

#[tokio::test]
async fn test_automatic_reviewer_runs_before_human_pause() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![
            Node::start("start"),
            agent("x"),
            human("editor", InputMode::Admin),
            agent("critic"),
            Node::end("end"),
        ],
        vec![
            Edge::sequential("start", "x"),
            Edge::reflection("x", "editor").with_max_iterations(1),
            Edge::reflection("x", "critic").with_max_iterations(1),
            Edge::sequential("x", "end"),
        ],
    );

    let RunOutcome::Suspended(pause) = engine.start(graph, "essay").await.unwrap() else {
        panic!("expected review pause");
    };
    assert_eq!(model.calls("critic"), 1);
    assert_eq!(pause.target_node, "editor");
    assert_eq!(pause.reflection.unwrap().source_message, "x reply 2");

    let state = completed(engine.resume(&pause.execution_id, HumanInput::new("ok")).await.unwrap());
    assert_eq!(model.calls("critic"), 1);
    assert_eq!(model.calls("x"), 3);
    assert_eq!(state.output_of("x"), Some("x reply 3"));
    assert_eq!(
        kinds(&state),
        vec![
            MessageKind::WorkflowStart,
            MessageKind::Chat,
            MessageKind::ReflectionFeedback,
            MessageKind::ReflectionRevision,
            MessageKind::IterationFeedback,
            MessageKind::ReflectionRevision,
            MessageKind::WorkflowEnd,
        ]
    );
}

#[tokio::test]
async fn test_human_reviewers_of_one_source_take_turns() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![
            Node::start("start"),
            agent("x"),
            human("editor", InputMode::Admin),
            human("legal", InputMode::Admin),
        ],
        vec![
            Edge::sequential("start", "x"),
            Edge::reflection("x", "editor").with_max_iterations(1),
            Edge::reflection("x", "legal").with_max_iterations(1),
        ],
    );

    let RunOutcome::Suspended(first) = engine.start(graph, "essay").await.unwrap() else {
        panic!("expected review pause");
    };
    assert_eq!(first.target_node, "editor");

    let id = first.execution_id.clone();
    let RunOutcome::Suspended(second) = engine.resume(&id, HumanInput::new("tighter")).await.unwrap()
    else {
        panic!("expected the second reviewer");
    };
    assert_eq!(second.target_node, "legal");
    let reflection = second.reflection.unwrap();
    assert_eq!(reflection.reflection_source, "x");
    assert_eq!(reflection.source_message, "x reply 2");
    assert!(!engine.status(&id).await.unwrap().is_executed("x"));

    let state = completed(engine.resume(&id, HumanInput::new("cleared")).await.unwrap());
    assert_eq!(state.output_of("x"), Some("x reply 3"));
    assert_eq!(state.output_of("editor"), Some("tighter"));
    assert_eq!(state.output_of("legal"), Some("cleared"));
}

#[tokio::test]
async fn test_review_partial_keeps_plan_order_in_generation() {
    let model = ScriptedModel::new();
    let engine = engine(&model);
    let graph = Graph::new(
        vec![
            Node::start("start"),
            agent("left"),
            agent("right"),
            human("editor", InputMode::Admin),
            Node::end("end"),
        ],
        vec![
            Edge::sequential("start", "left"),
            Edge::sequential("start", "right"),
            Edge::reflection("left", "editor").with_max_iterations(1),
            Edge::sequential("editor", "end"),
            Edge::sequential("right", "end"),
        ],
    );

    let RunOutcome::Suspended(pause) = engine.start(graph, "essay").await.unwrap() else {
        panic!("expected review pause");
    };
    let paused = engine.status(&pause.execution_id).await.unwrap();
    let order: Vec<(u64, &str)> = paused
        .messages
        .iter()
        .map(|m| (m.sequence, m.agent_name.as_str()))
        .collect();
    assert_eq!(order, vec![(1, "start"), (2, "left"), (3, "right")]);
    assert!(paused.is_executed("right"));
    assert!(!paused.is_executed("left"));

    let state = completed(engine.resume(&pause.execution_id, HumanInput::new("ok")).await.unwrap());
    assert_eq!(state.output_of("left"), Some("left reply 2"));
    assert!(state.is_executed("end"));
}

#[tokio::test]
async fn test_intelligent_coordinator_respects_parallel_limit() {
    let model = ScriptedModel::new().reply(
        "lead",
        r#"[{"delegate": "d1", "query": "one"}, {"delegate": "d2", "query": "two"}]"#,
    );
    let engine = WorkflowEngine::new(
        Arc::new(MemoryExecutionStore::new()),
        Arc::new(model.clone()),
        Arc::new(RecordingToolInvoker::new()),
        Arc::new(EventBus::default()),
        EngineConfig {
            max_parallel_nodes: 1,
            ..EngineConfig::default()
        },
    );
    let graph = Graph::new(
        vec![
            Node::start("start"),
            coordinator("lead", CoordinationMode::Intelligent),
            delegate("d1"),
            delegate("d2"),
        ],
        vec![
            Edge::sequential("start", "lead"),
            Edge::delegate("lead", "d1"),
            Edge::delegate("lead", "d2"),
        ],
    );

    let state = completed(engine.start(graph, "report").await.unwrap());
    assert_eq!(model.prompts("d1"), vec!["one".to_string()]);
    assert_eq!(model.prompts("d2"), vec!["two".to_string()]);
    assert_eq!(state.messages[1].metadata.subquery_id.as_deref(), Some("lead-q1"));
    assert_eq!(state.messages[2].metadata.subquery_id.as_deref(), Some("lead-q2"));
}
