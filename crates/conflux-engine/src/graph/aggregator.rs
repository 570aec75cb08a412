use std::collections::BTreeMap;

use conflux_core::error::{ConfluxError, Result};
use conflux_core::graph::{Graph, NodeKind};

use super::parser::{included_nodes, is_dependency_edge};

/// One upstream node's recorded output.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamInput {
    pub node_id: String,
    pub node_name: String,
    pub kind: NodeKind,
    pub output: String,
}

/// Upstream outputs merged for a fan-in node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedContext {
    /// Output of the highest-priority source.
    pub primary_input: String,
    pub secondary_inputs: Vec<UpstreamInput>,
    /// Rendered text of every source, used as the prompt input.
    pub summary: String,
    sources: Vec<UpstreamInput>,
}

impl AggregatedContext {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> &[UpstreamInput] {
        &self.sources
    }
}

/// Upstream sources of `node_id`, in edge declaration order.
///
/// Uses the same edge set the parser turns into dependencies, so an
/// automatic reviewer in a cross-agent reflection never aggregates its
/// reviewee.
pub fn find_inputs(graph: &Graph, node_id: &str) -> Vec<String> {
    let included = included_nodes(graph);
    let mut sources: Vec<String> = Vec::new();
    for edge in graph.incoming(node_id) {
        if is_dependency_edge(graph, &included, edge) && !sources.contains(&edge.source) {
            sources.push(edge.source.clone());
        }
    }
    sources
}

/// Merge the recorded outputs of `sources`.
///
/// Sources are ordered Start first, then Assistant and UserProxy, then the
/// rest, keeping edge order within each group. A source without recorded
/// output is a dependency error.
pub fn aggregate(
    graph: &Graph,
    node_id: &str,
    sources: &[String],
    executed: &BTreeMap<String, String>,
) -> Result<AggregatedContext> {
    let mut inputs = Vec::with_capacity(sources.len());
    for source in sources {
        let output = executed.get(source).ok_or_else(|| ConfluxError::Dependency {
            node: node_id.to_string(),
            missing: source.clone(),
        })?;
        let node = graph.node(source);
        inputs.push(UpstreamInput {
            node_id: source.clone(),
            node_name: node.map_or_else(|| source.clone(), |n| n.name.clone()),
            kind: node.map_or(NodeKind::Assistant, |n| n.kind()),
            output: output.clone(),
        });
    }
    inputs.sort_by_key(|i| priority(i.kind));

    let Some(first) = inputs.first() else {
        return Ok(AggregatedContext::default());
    };

    let summary = if inputs.len() == 1 {
        first.output.clone()
    } else {
        let mut out = format!("Inputs from {} upstream nodes:\n", inputs.len());
        for input in &inputs {
            out.push_str(&format!("\n[{}]\n{}\n", input.node_name, input.output));
        }
        out
    };

    Ok(AggregatedContext {
        primary_input: first.output.clone(),
        secondary_inputs: inputs[1..].to_vec(),
        summary,
        sources: inputs,
    })
}

fn priority(kind: NodeKind) -> u8 {
    match kind {
        NodeKind::Start => 0,
        NodeKind::Assistant | NodeKind::UserProxy => 1,
        _ => 2,
    }
}
