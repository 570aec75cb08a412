//! Group coordination.
//!
//! A GroupCoordinator owns the Delegate nodes reachable over its `delegate`
//! edges. In round-robin mode every delegate answers in turn, seeing the
//! discussion so far. In intelligent mode the coordinator first splits the
//! task into subqueries, the delegates answer them concurrently, and the
//! coordinator synthesizes the answers.

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use conflux_core::error::Result;
use conflux_core::graph::{CoordinationMode, CoordinatorConfig, EdgeKind, Node};
use conflux_core::state::ExecutionState;
use conflux_core::types::{MessageDraft, MessageKind};

use crate::runtime::{ModelReply, NodeOutput, NodeRuntime};

/// A unit of work handed to one delegate.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Subquery {
    pub delegate: String,
    pub query: String,
}

/// Run the coordinator's delegates. Returns the synthesized summary and
/// one message per delegate response; the summary message itself is
/// recorded by the caller once reflection is done.
pub(crate) async fn coordinate(
    rt: &NodeRuntime,
    state: &ExecutionState,
    coordinator: &Node,
    config: &CoordinatorConfig,
    task: &str,
) -> Result<(ModelReply, NodeOutput)> {
    let delegates = delegates_of(state, coordinator);
    let mut out = NodeOutput::default();
    let project = state.project.as_deref();

    if delegates.is_empty() {
        debug!(node_id = %coordinator.id, "Coordinator has no delegates, answering directly");
        let reply = rt
            .call_model(project, coordinator, &config.agent, task.to_string())
            .await?;
        return Ok((reply, out));
    }

    info!(
        node_id = %coordinator.id,
        delegates = delegates.len(),
        mode = ?config.mode,
        "Coordinating delegates"
    );

    let responses = match config.mode {
        CoordinationMode::RoundRobin => round_robin(rt, state, coordinator, config, &delegates, task, &mut out).await?,
        CoordinationMode::Intelligent => intelligent(rt, state, coordinator, config, &delegates, task, &mut out).await?,
    };

    let mut synthesis = format!(
        "You coordinated a group working on this task:\n{task}\n\nTheir responses:\n"
    );
    for (name, text) in &responses {
        synthesis.push_str(&format!("\n[{name}]\n{text}\n"));
    }
    synthesis.push_str("\nWrite one consolidated answer to the task.");

    let summary = rt
        .call_model(project, coordinator, &config.agent, synthesis)
        .await?;
    Ok((summary, out))
}

async fn round_robin(
    rt: &NodeRuntime,
    state: &ExecutionState,
    coordinator: &Node,
    config: &CoordinatorConfig,
    delegates: &[&Node],
    task: &str,
    out: &mut NodeOutput,
) -> Result<Vec<(String, String)>> {
    let mut responses: Vec<(String, String)> = Vec::new();

    for round in 1..=config.max_rounds.max(1) {
        for delegate in delegates {
            let Some(agent) = delegate.agent_config() else {
                continue;
            };
            let mut prompt = format!("Task:\n{task}");
            if !responses.is_empty() {
                prompt.push_str("\n\nDiscussion so far:");
                for (name, text) in &responses {
                    prompt.push_str(&format!("\n{name}: {text}"));
                }
            }

            let reply = rt
                .call_model(state.project.as_deref(), delegate, agent, prompt)
                .await?;
            let mut metadata = reply.metadata(&delegate.id);
            metadata.coordinator = Some(coordinator.id.clone());
            metadata.round = Some(round);
            out.push(
                MessageDraft::new(&delegate.name, delegate.kind(), MessageKind::DelegateResponse, &reply.text)
                    .with_metadata(metadata),
            );
            out.say(&delegate.name, &reply.text);
            responses.push((delegate.name.clone(), reply.text));
        }
    }

    Ok(responses)
}

async fn intelligent(
    rt: &NodeRuntime,
    state: &ExecutionState,
    coordinator: &Node,
    config: &CoordinatorConfig,
    delegates: &[&Node],
    task: &str,
    out: &mut NodeOutput,
) -> Result<Vec<(String, String)>> {
    let mut planning = format!(
        "Split the task below into focused subqueries for your team.\n\nTask:\n{task}\n\nTeam:\n"
    );
    for delegate in delegates {
        planning.push_str(&format!(
            "- {} ({}): {}\n",
            delegate.id,
            delegate.name,
            delegate.description().unwrap_or("general assistant")
        ));
    }
    planning.push_str(
        "\nReply with a JSON array of objects {\"delegate\": \"<id>\", \"query\": \"<subquery>\"}.",
    );

    let plan = rt
        .call_model(state.project.as_deref(), coordinator, &config.agent, planning)
        .await?;
    let mut subqueries = parse_subqueries(&plan.text, delegates);
    if subqueries.is_empty() {
        warn!(node_id = %coordinator.id, "No usable subqueries in plan, assigning the task to every delegate");
        subqueries = delegates
            .iter()
            .map(|d| Subquery {
                delegate: d.id.clone(),
                query: task.to_string(),
            })
            .collect();
    }

    let mut calls = Vec::new();
    for sq in &subqueries {
        let Some(delegate) = delegates.iter().find(|d| d.id == sq.delegate) else {
            continue;
        };
        let Some(agent) = delegate.agent_config() else {
            continue;
        };
        calls.push(async move {
            let reply = rt
                .call_model(state.project.as_deref(), delegate, agent, sq.query.clone())
                .await;
            (*delegate, reply)
        });
    }
    let limit = rt.config.max_parallel_nodes.max(1);
    let results: Vec<_> = stream::iter(calls).buffered(limit).collect().await;

    let mut responses = Vec::with_capacity(results.len());
    for (n, (delegate, reply)) in results.into_iter().enumerate() {
        let reply = reply?;
        let mut metadata = reply.metadata(&delegate.id);
        metadata.coordinator = Some(coordinator.id.clone());
        metadata.subquery_id = Some(format!("{}-q{}", coordinator.id, n + 1));
        out.push(
            MessageDraft::new(&delegate.name, delegate.kind(), MessageKind::DelegateResponse, &reply.text)
                .with_metadata(metadata),
        );
        out.say(&delegate.name, &reply.text);
        responses.push((delegate.name.clone(), reply.text));
    }
    Ok(responses)
}

/// Delegate targets of the coordinator, in edge order.
fn delegates_of<'a>(state: &'a ExecutionState, coordinator: &Node) -> Vec<&'a Node> {
    let mut out: Vec<&Node> = Vec::new();
    for edge in state.graph.outgoing(&coordinator.id) {
        if edge.kind != EdgeKind::Delegate || edge.is_self_loop() {
            continue;
        }
        if let Some(node) = state.graph.node(&edge.target) {
            if !out.iter().any(|n| n.id == node.id) {
                out.push(node);
            }
        }
    }
    out
}

/// Extract the subquery list from a planning reply. Entries naming an
/// unknown delegate are dropped; a delegate may be named by id or name.
pub fn parse_subqueries(text: &str, delegates: &[&Node]) -> Vec<Subquery> {
    let Ok(array) = Regex::new(r"(?s)\[.*\]") else {
        return Vec::new();
    };
    let Some(found) = array.find(text) else {
        return Vec::new();
    };
    let Ok(parsed) = serde_json::from_str::<Vec<Subquery>>(found.as_str()) else {
        return Vec::new();
    };

    parsed
        .into_iter()
        .filter_map(|sq| {
            let delegate = delegates
                .iter()
                .find(|d| d.id == sq.delegate || d.name == sq.delegate)?;
            Some(Subquery {
                delegate: delegate.id.clone(),
                query: sq.query,
            })
        })
        .filter(|sq| !sq.query.trim().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subqueries_from_prose() {
        let a = Node::assistant("a").with_name("Analyst");
        let b = Node::assistant("b");
        let delegates = vec![&a, &b];
        let text = "Here is the plan:\n```json\n[{\"delegate\": \"Analyst\", \"query\": \"numbers\"},\
                    {\"delegate\": \"b\", \"query\": \"risks\"},\
                    {\"delegate\": \"ghost\", \"query\": \"x\"}]\n```";
        let parsed = parse_subqueries(text, &delegates);
        assert_eq!(
            parsed,
            vec![
                Subquery { delegate: "a".into(), query: "numbers".into() },
                Subquery { delegate: "b".into(), query: "risks".into() },
            ]
        );
    }

    #[test]
    fn test_parse_subqueries_garbage() {
        let a = Node::assistant("a");
        assert!(parse_subqueries("no plan here", &[&a]).is_empty());
        assert!(parse_subqueries("[not json]", &[&a]).is_empty());
    }
}
