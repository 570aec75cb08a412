//! Workflow graph model.
//!
//! A workflow is an ordered list of [`Node`]s connected by [`Edge`]s. Node
//! configuration arrives as an untyped JSON object and is decoded once, at
//! load time, into a [`NodeConfig`] variant matching the node's type.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ConfluxError, Result};

/// The closed set of node types a workflow may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Assistant,
    UserProxy,
    GroupCoordinator,
    Delegate,
    ToolServer,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Assistant => "assistant",
            Self::UserProxy => "user_proxy",
            Self::GroupCoordinator => "group_coordinator",
            Self::Delegate => "delegate",
            Self::ToolServer => "tool_server",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which model a node talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_temperature() -> f32 { 0.7 }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartConfig {
    /// Used when the caller starts the run with an empty input.
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndConfig {
    #[serde(default)]
    pub message: Option<String>,
}

impl EndConfig {
    pub fn closing_message(&self) -> &str {
        self.message.as_deref().unwrap_or("Workflow completed.")
    }
}

/// Settings shared by every node that calls a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub max_reflection_iterations: Option<u32>,
}

/// How a paused workflow expects its human input to arrive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// The operator resumes the execution directly by id.
    #[default]
    Admin,
    /// The prompt is surfaced to an end user; resuming requires the input
    /// token issued with the suspension.
    Deployment,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProxyConfig {
    #[serde(flatten)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub human_input: bool,
    #[serde(default)]
    pub input_mode: InputMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationMode {
    /// Every delegate answers in turn, for `max_rounds` rounds.
    #[default]
    RoundRobin,
    /// The coordinator splits the task into subqueries and assigns them.
    Intelligent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(flatten)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub mode: CoordinationMode,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            mode: CoordinationMode::default(),
            max_rounds: default_max_rounds(),
        }
    }
}

fn default_max_rounds() -> u32 { 1 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub server_type: String,
    /// Tool invoked when upstream output carries no structured call.
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
}

/// Typed node configuration, one shape per node kind.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    Start(StartConfig),
    End(EndConfig),
    Assistant(AgentConfig),
    UserProxy(UserProxyConfig),
    GroupCoordinator(CoordinatorConfig),
    Delegate(AgentConfig),
    ToolServer(ToolServerConfig),
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Start(_) => NodeKind::Start,
            Self::End(_) => NodeKind::End,
            Self::Assistant(_) => NodeKind::Assistant,
            Self::UserProxy(_) => NodeKind::UserProxy,
            Self::GroupCoordinator(_) => NodeKind::GroupCoordinator,
            Self::Delegate(_) => NodeKind::Delegate,
            Self::ToolServer(_) => NodeKind::ToolServer,
        }
    }

    fn decode(kind: NodeKind, raw: serde_json::Value) -> serde_json::Result<Self> {
        let raw = if raw.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            raw
        };
        Ok(match kind {
            NodeKind::Start => Self::Start(serde_json::from_value(raw)?),
            NodeKind::End => Self::End(serde_json::from_value(raw)?),
            NodeKind::Assistant => Self::Assistant(serde_json::from_value(raw)?),
            NodeKind::UserProxy => Self::UserProxy(serde_json::from_value(raw)?),
            NodeKind::GroupCoordinator => Self::GroupCoordinator(serde_json::from_value(raw)?),
            NodeKind::Delegate => Self::Delegate(serde_json::from_value(raw)?),
            NodeKind::ToolServer => Self::ToolServer(serde_json::from_value(raw)?),
        })
    }

    fn encode(&self) -> serde_json::Value {
        let value = match self {
            Self::Start(c) => serde_json::to_value(c),
            Self::End(c) => serde_json::to_value(c),
            Self::Assistant(c) | Self::Delegate(c) => serde_json::to_value(c),
            Self::UserProxy(c) => serde_json::to_value(c),
            Self::GroupCoordinator(c) => serde_json::to_value(c),
            Self::ToolServer(c) => serde_json::to_value(c),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Display name. Several nodes may share one.
    pub name: String,
    pub config: NodeConfig,
}

/// Wire shape of a node: `{ "id", "name", "type", "config": {...} }`.
#[derive(Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: NodeKind,
    #[serde(default)]
    config: serde_json::Value,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> std::result::Result<Self, Self::Error> {
        let config = NodeConfig::decode(raw.kind, raw.config)
            .map_err(|e| format!("node '{}' has invalid {} config: {}", raw.id, raw.kind, e))?;
        Ok(Node {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            config,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        RawNode {
            kind: node.kind(),
            config: node.config.encode(),
            id: node.id,
            name: Some(node.name),
        }
    }
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            config,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id, NodeConfig::Start(StartConfig::default()))
    }

    pub fn end(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id, NodeConfig::End(EndConfig::default()))
    }

    pub fn assistant(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id, NodeConfig::Assistant(AgentConfig::default()))
    }

    /// A UserProxy that suspends the workflow for human input.
    pub fn human_proxy(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(
            id.clone(),
            id,
            NodeConfig::UserProxy(UserProxyConfig {
                human_input: true,
                ..Default::default()
            }),
        )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }

    /// Whether this node suspends the workflow waiting for a human.
    pub fn requires_human_input(&self) -> bool {
        matches!(&self.config, NodeConfig::UserProxy(c) if c.human_input)
    }

    /// Model-calling settings, for node kinds that call a model.
    pub fn agent_config(&self) -> Option<&AgentConfig> {
        match &self.config {
            NodeConfig::Assistant(c) | NodeConfig::Delegate(c) => Some(c),
            NodeConfig::UserProxy(c) => Some(&c.agent),
            NodeConfig::GroupCoordinator(c) => Some(&c.agent),
            _ => None,
        }
    }

    /// The human-facing description, if configured.
    pub fn description(&self) -> Option<&str> {
        self.agent_config().and_then(|c| c.description.as_deref())
    }
}

/// How an edge participates in scheduling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Sequential,
    Reflection,
    Delegate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_prompt: Option<String>,
}

/// An edge connecting two nodes in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub kind: EdgeKind,
    #[serde(default)]
    pub data: EdgeData,
}

impl Edge {
    pub fn sequential(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: EdgeKind::Sequential,
            data: EdgeData::default(),
        }
    }

    pub fn reflection(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: EdgeKind::Reflection,
            ..Self::sequential(source, target)
        }
    }

    pub fn delegate(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: EdgeKind::Delegate,
            ..Self::sequential(source, target)
        }
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.data.max_iterations = Some(n);
        self
    }

    pub fn with_reflection_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.data.reflection_prompt = Some(prompt.into());
        self
    }

    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Parse and validate a graph from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let graph: Graph =
            serde_json::from_str(json).map_err(|e| ConfluxError::Graph(e.to_string()))?;
        graph.validate()?;
        Ok(graph)
    }

    /// Reject duplicate node ids and edges that point at unknown nodes.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ConfluxError::Graph(format!("duplicate node id '{}'", node.id)));
            }
        }
        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !seen.contains(end.as_str()) {
                    return Err(ConfluxError::Graph(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, end
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Position of a node in declaration order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }
}
