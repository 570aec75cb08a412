use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use conflux_core::graph::{Edge, EdgeKind, Graph, NodeKind};

/// Deterministic linear execution order for a workflow.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    order: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
    repaired: Vec<String>,
}

impl ExecutionPlan {
    /// Build the execution order of `graph`.
    ///
    /// Delegates and pure reflection reviewers are left out (their owners
    /// invoke them). The rest is sorted with Kahn's algorithm, ties broken
    /// by declaration order. Nodes a cycle keeps out of the sort are
    /// reinserted after their latest placed dependency and reported in
    /// [`repaired`](Self::repaired). Start nodes lead, End nodes trail.
    pub fn parse(graph: &Graph) -> Self {
        if graph.nodes.is_empty() {
            return Self::default();
        }

        let included = included_nodes(graph);
        let position: HashMap<&str, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in graph.edges.iter().filter(|e| is_dependency_edge(graph, &included, e)) {
            let deps = dependencies.entry(edge.target.clone()).or_default();
            if deps.contains(&edge.source) {
                continue;
            }
            deps.push(edge.source.clone());
            successors
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }

        // Kahn's algorithm over declaration positions.
        let mut in_degree: HashMap<&str, usize> = included
            .iter()
            .map(|id| (*id, dependencies.get(*id).map_or(0, |d| d.len())))
            .collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| position[id])
            .collect();

        let mut order: Vec<String> = Vec::with_capacity(included.len());
        while let Some(pos) = ready.pop_first() {
            let id = graph.nodes[pos].id.as_str();
            order.push(id.to_string());
            for next in successors.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(position[next]);
                    }
                }
            }
        }

        // Repair pass for nodes left behind by cycles.
        let mut repaired = Vec::new();
        for node in &graph.nodes {
            if !included.contains(node.id.as_str()) || order.contains(&node.id) {
                continue;
            }
            let anchor = dependencies
                .get(&node.id)
                .into_iter()
                .flatten()
                .filter_map(|dep| order.iter().position(|id| id == dep))
                .max();
            match anchor {
                Some(i) => order.insert(i + 1, node.id.clone()),
                None => order.push(node.id.clone()),
            }
            warn!(node_id = %node.id, "Node is part of a dependency cycle, reinserted by repair pass");
            repaired.push(node.id.clone());
        }

        // Start nodes lead, End nodes trail.
        let kind_of = |id: &String| graph.node(id).map(|n| n.kind());
        let (starts, rest): (Vec<String>, Vec<String>) = order
            .into_iter()
            .partition(|id| kind_of(id) == Some(NodeKind::Start));
        let (middle, ends): (Vec<String>, Vec<String>) = rest
            .into_iter()
            .partition(|id| kind_of(id) != Some(NodeKind::End));
        let order: Vec<String> = starts.into_iter().chain(middle).chain(ends).collect();

        // A dependency that ended up at or after its dependent can never be
        // satisfied first; drop it so the scheduler can progress.
        let placed: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        for (node_id, deps) in dependencies.iter_mut() {
            let Some(&at) = placed.get(node_id.as_str()) else {
                continue;
            };
            deps.retain(|dep| {
                let keep = placed.get(dep.as_str()).is_some_and(|&p| p < at);
                if !keep {
                    warn!(node_id = %node_id, dependency = %dep, "Dropping unsatisfiable dependency");
                }
                keep
            });
        }

        debug!(order = ?order, repaired = repaired.len(), "Execution plan built");

        Self {
            order,
            dependencies,
            repaired,
        }
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.order.iter().any(|n| n == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|n| n == id)
    }

    /// Nodes that must be executed before `id` can run.
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map_or(&[], |d| d.as_slice())
    }

    /// Nodes placed by the cycle repair pass.
    pub fn repaired(&self) -> &[String] {
        &self.repaired
    }
}

/// Nodes the main sequence schedules.
pub(crate) fn included_nodes(graph: &Graph) -> HashSet<&str> {
    graph
        .nodes
        .iter()
        .filter(|node| {
            let kinds: Vec<EdgeKind> = graph
                .incoming(&node.id)
                .filter(|e| !e.is_self_loop())
                .map(|e| e.kind)
                .collect();
            if kinds.is_empty() {
                return true;
            }
            if kinds.iter().all(|k| *k == EdgeKind::Delegate) {
                return false;
            }
            if kinds.iter().all(|k| *k == EdgeKind::Reflection) {
                return node.requires_human_input();
            }
            true
        })
        .map(|n| n.id.as_str())
        .collect()
}

/// Sequential edges, plus reflection edges into a human reviewer, between
/// two scheduled nodes.
pub(crate) fn is_dependency_edge(graph: &Graph, included: &HashSet<&str>, edge: &Edge) -> bool {
    if edge.is_self_loop()
        || !included.contains(edge.source.as_str())
        || !included.contains(edge.target.as_str())
    {
        return false;
    }
    match edge.kind {
        EdgeKind::Sequential => true,
        EdgeKind::Reflection => graph
            .node(&edge.target)
            .is_some_and(|n| n.requires_human_input()),
        EdgeKind::Delegate => false,
    }
}
