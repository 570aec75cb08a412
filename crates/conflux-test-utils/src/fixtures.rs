use conflux_core::graph::{
    AgentConfig, CoordinationMode, CoordinatorConfig, Edge, Graph, InputMode, ModelSettings, Node,
    NodeConfig, ToolServerConfig, UserProxyConfig,
};

/// Agent settings whose model name is `id`.
pub fn agent_config(id: &str) -> AgentConfig {
    AgentConfig {
        model: ModelSettings {
            provider: "mock".to_string(),
            model: id.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn agent(id: &str) -> Node {
    Node::new(id, id, NodeConfig::Assistant(agent_config(id)))
}

pub fn delegate(id: &str) -> Node {
    Node::new(id, id, NodeConfig::Delegate(agent_config(id)))
}

/// A UserProxy that answers through its model.
pub fn auto_proxy(id: &str) -> Node {
    Node::new(
        id,
        id,
        NodeConfig::UserProxy(UserProxyConfig {
            agent: agent_config(id),
            human_input: false,
            input_mode: InputMode::Admin,
        }),
    )
}

/// A UserProxy that suspends the run for a human.
pub fn human(id: &str, mode: InputMode) -> Node {
    Node::new(
        id,
        id,
        NodeConfig::UserProxy(UserProxyConfig {
            agent: agent_config(id),
            human_input: true,
            input_mode: mode,
        }),
    )
}

pub fn coordinator(id: &str, mode: CoordinationMode) -> Node {
    Node::new(
        id,
        id,
        NodeConfig::GroupCoordinator(CoordinatorConfig {
            agent: agent_config(id),
            mode,
            max_rounds: 1,
        }),
    )
}

pub fn tool_server(id: &str, server_type: &str, tool: Option<&str>) -> Node {
    Node::new(
        id,
        id,
        NodeConfig::ToolServer(ToolServerConfig {
            server_type: server_type.to_string(),
            tool: tool.map(str::to_string),
            arguments: None,
        }),
    )
}

/// `start -> ids... -> end`, every middle node an assistant.
pub fn linear(ids: &[&str]) -> Graph {
    let mut nodes = vec![Node::start("start")];
    nodes.extend(ids.iter().map(|id| agent(id)));
    nodes.push(Node::end("end"));
    let edges = nodes
        .windows(2)
        .map(|pair| Edge::sequential(&pair[0].id, &pair[1].id))
        .collect();
    Graph::new(nodes, edges)
}

/// `start -> {left, right} -> merge -> end`.
pub fn diamond() -> Graph {
    Graph::new(
        vec![
            Node::start("start"),
            agent("left"),
            agent("right"),
            agent("merge"),
            Node::end("end"),
        ],
        vec![
            Edge::sequential("start", "left"),
            Edge::sequential("start", "right"),
            Edge::sequential("left", "merge"),
            Edge::sequential("right", "merge"),
            Edge::sequential("merge", "end"),
        ],
    )
}
