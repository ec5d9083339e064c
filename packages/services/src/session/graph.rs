//! Graph validation and ordering.

use std::collections::{BTreeMap, BTreeSet};

use conductor_core::{Batch, Graph, InvocationOutput, Node};
use serde_json::{Map, Value};
use thiserror::Error;

use super::engine::{GraphEngine, InvocationError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Batch must request at least one run")]
    NoRuns,

    #[error("Batch requests {runs} runs, at most {max} are allowed")]
    TooManyRuns { runs: u32, max: u32 },

    #[error("Graph has no executable nodes")]
    NothingExecutable,

    #[error("Node {0} has a type the engine cannot execute")]
    NotExecutable(String),

    #[error("Node stored under key {key} has id {id}")]
    KeyMismatch { key: String, id: String },

    #[error("Edge references unknown node {0}")]
    UnknownNode(String),

    #[error("Graph contains a cycle through {0}")]
    Cycle(String),
}

/// Upper bound on the runs of a single batch.
pub const MAX_RUNS: u32 = 10_000;

/// Check a batch before any of its items are queued.
pub fn validate_batch(batch: &Batch, engine: &dyn GraphEngine) -> Result<(), GraphError> {
    if batch.runs == 0 {
        return Err(GraphError::NoRuns);
    }
    if batch.runs > MAX_RUNS {
        return Err(GraphError::TooManyRuns {
            runs: batch.runs,
            max: MAX_RUNS,
        });
    }
    validate(&batch.graph, engine)
}

pub fn validate(graph: &Graph, engine: &dyn GraphEngine) -> Result<(), GraphError> {
    for (key, node) in &graph.nodes {
        if *key != node.id {
            return Err(GraphError::KeyMismatch {
                key: key.clone(),
                id: node.id.clone(),
            });
        }
    }
    if graph.nodes.is_empty() {
        return Err(GraphError::NothingExecutable);
    }
    if let Some(node) = graph.nodes.values().find(|node| !engine.is_executable(&node.node_type)) {
        return Err(GraphError::NotExecutable(node.id.clone()));
    }
    execution_order(graph).map(|_| ())
}

/// Topological order of the node ids. Ties are broken by node id, so the
/// order is stable for a given graph.
pub fn execution_order(graph: &Graph) -> Result<Vec<&str>, GraphError> {
    let mut incoming: BTreeMap<&str, usize> =
        graph.nodes.keys().map(|id| (id.as_str(), 0)).collect();
    let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for edge in &graph.edges {
        let source = edge.source.node_id.as_str();
        let destination = edge.destination.node_id.as_str();
        for id in [source, destination] {
            if !graph.nodes.contains_key(id) {
                return Err(GraphError::UnknownNode(id.to_string()));
            }
        }
        // Several edges between the same pair of nodes are one dependency.
        if outgoing.entry(source).or_default().insert(destination)
            && let Some(count) = incoming.get_mut(destination)
        {
            *count += 1;
        }
    }

    let mut ready: BTreeSet<&str> = incoming
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(graph.nodes.len());

    while let Some(id) = ready.pop_first() {
        order.push(id);
        for next in outgoing.get(id).into_iter().flatten() {
            if let Some(count) = incoming.get_mut(next) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() < graph.nodes.len() {
        let stuck = incoming
            .iter()
            .find(|(_, count)| **count > 0)
            .map(|(id, _)| id.to_string())
            .unwrap_or_default();
        return Err(GraphError::Cycle(stuck));
    }
    Ok(order)
}

/// Merge a node's literal inputs with the outputs its incoming edges carry.
pub fn collect_inputs(
    node: &Node,
    graph: &Graph,
    results: &BTreeMap<String, InvocationOutput>,
) -> Result<Map<String, Value>, InvocationError> {
    let mut inputs = node.inputs.clone();
    for edge in graph.edges.iter().filter(|edge| edge.destination.node_id == node.id) {
        let value = results
            .get(&edge.source.node_id)
            .and_then(|output| output.field(&edge.source.field))
            .ok_or_else(|| InvocationError::InvalidInput {
                field: edge.destination.field.clone(),
                reason: format!("{}.{} produced no value", edge.source.node_id, edge.source.field),
            })?;
        inputs.insert(edge.destination.field.clone(), value);
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::engine::InvocationContext;
    use conductor_core::{Edge, Node};
    use futures_util::future::BoxFuture;

    struct OnlyAdd;

    impl GraphEngine for OnlyAdd {
        fn is_executable(&self, node_type: &str) -> bool {
            node_type == "add"
        }

        fn invoke<'a>(
            &'a self,
            _node: &'a Node,
            _inputs: Map<String, Value>,
            _ctx: &'a InvocationContext,
        ) -> BoxFuture<'a, Result<InvocationOutput, InvocationError>> {
            Box::pin(async { Err(InvocationError::Failed("not used".into())) })
        }
    }

    fn chain() -> Graph {
        Graph::default()
            .with_node(Node::new("c", "add"))
            .with_node(Node::new("a", "add"))
            .with_node(Node::new("b", "add"))
            .with_edge(Edge::new("a", "value", "b", "x"))
            .with_edge(Edge::new("b", "value", "c", "x"))
    }

    #[test]
    fn order_follows_edges() {
        assert_eq!(execution_order(&chain()).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn independent_nodes_are_ordered_by_id() {
        let graph = Graph::default()
            .with_node(Node::new("z", "add"))
            .with_node(Node::new("m", "add"));
        assert_eq!(execution_order(&graph).unwrap(), vec!["m", "z"]);
    }

    #[test]
    fn cycles_and_dangling_edges_are_rejected() {
        let cyclic = chain().with_edge(Edge::new("c", "value", "a", "y"));
        assert!(matches!(execution_order(&cyclic), Err(GraphError::Cycle(_))));

        let dangling = chain().with_edge(Edge::new("a", "value", "ghost", "x"));
        assert_eq!(
            execution_order(&dangling),
            Err(GraphError::UnknownNode("ghost".into()))
        );
    }

    #[test]
    fn batches_need_runs_and_executable_nodes() {
        let batch = Batch::new(chain()).with_runs(0);
        assert_eq!(validate_batch(&batch, &OnlyAdd), Err(GraphError::NoRuns));

        let batch = Batch::new(chain()).with_runs(MAX_RUNS + 1);
        assert!(matches!(
            validate_batch(&batch, &OnlyAdd),
            Err(GraphError::TooManyRuns { .. })
        ));

        assert_eq!(validate(&Graph::default(), &OnlyAdd), Err(GraphError::NothingExecutable));

        let graph = chain().with_node(Node::new("z", "mystery"));
        assert_eq!(validate(&graph, &OnlyAdd), Err(GraphError::NotExecutable("z".into())));

        let mut graph = chain();
        if let Some(node) = graph.nodes.get_mut("a") {
            node.id = "renamed".into();
        }
        assert!(matches!(validate(&graph, &OnlyAdd), Err(GraphError::KeyMismatch { .. })));
    }

    #[test]
    fn inputs_merge_literals_and_edge_values() {
        let graph = Graph::default()
            .with_node(Node::new("a", "add"))
            .with_node(Node::new("b", "add").with_input("y", 2))
            .with_edge(Edge::new("a", "value", "b", "x"));
        let mut results = BTreeMap::new();
        results.insert("a".to_string(), InvocationOutput::IntegerOutput { value: 5 });

        let inputs = collect_inputs(&graph.nodes["b"], &graph, &results).unwrap();
        assert_eq!(inputs.get("x"), Some(&Value::from(5)));
        assert_eq!(inputs.get("y"), Some(&Value::from(2)));

        let missing = collect_inputs(&graph.nodes["b"], &graph, &BTreeMap::new());
        assert!(matches!(missing, Err(InvocationError::InvalidInput { .. })));
    }
}
