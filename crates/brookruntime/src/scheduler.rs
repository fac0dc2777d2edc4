//! Topological scheduling of workflow nodes.

use brookcore::{NodeId, Workflow, WorkflowError};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, VecDeque};

/// Execution order computed for one workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// Every edge's source precedes its target.
    pub order: Vec<NodeId>,
    /// Nodes on a cycle or only reachable through one, in declaration order.
    pub unscheduled: Vec<NodeId>,
}

impl Schedule {
    pub fn is_complete(&self) -> bool {
        self.unscheduled.is_empty()
    }
}

/// Build the dependency graph, rejecting duplicate ids and dangling edges.
pub fn build_graph(workflow: &Workflow) -> Result<DiGraph<NodeId, ()>, WorkflowError> {
    let mut graph = DiGraph::with_capacity(workflow.nodes.len(), workflow.edges.len());
    let mut node_to_index: HashMap<&str, NodeIndex> = HashMap::new();

    for node in &workflow.nodes {
        if node_to_index.contains_key(node.id.as_str()) {
            return Err(WorkflowError::Invalid(format!("duplicate node id: {}", node.id)));
        }
        let idx = graph.add_node(node.id.clone());
        node_to_index.insert(node.id.as_str(), idx);
    }

    for edge in &workflow.edges {
        if edge.from_port.is_empty() || edge.to_port.is_empty() {
            return Err(WorkflowError::InvalidConnection(format!(
                "{} -> {}: empty port name",
                edge.from_node, edge.to_node
            )));
        }
        let from = node_to_index
            .get(edge.from_node.as_str())
            .ok_or_else(|| WorkflowError::NodeNotFound(edge.from_node.clone()))?;
        let to = node_to_index
            .get(edge.to_node.as_str())
            .ok_or_else(|| WorkflowError::NodeNotFound(edge.to_node.clone()))?;
        graph.add_edge(*from, *to, ());
    }

    Ok(graph)
}

/// Kahn's algorithm with a FIFO ready queue.
///
/// Ready nodes are taken in discovery order, seeded in declaration order. The
/// order among independent nodes is not part of the contract.
pub fn schedule(workflow: &Workflow) -> Result<Schedule, WorkflowError> {
    let graph = build_graph(workflow)?;

    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.edges_directed(idx, Direction::Incoming).count())
        .collect();

    let mut queue: VecDeque<NodeIndex> = graph
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    let mut scheduled = vec![false; graph.node_count()];

    while let Some(idx) = queue.pop_front() {
        order.push(graph[idx].clone());
        scheduled[idx.index()] = true;

        // Outgoing edges come back newest first; walk them in declaration order.
        let mut successors: Vec<NodeIndex> = graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|edge| edge.target())
            .collect();
        successors.reverse();

        for succ in successors {
            in_degree[succ.index()] -= 1;
            if in_degree[succ.index()] == 0 {
                queue.push_back(succ);
            }
        }
    }

    let unscheduled = graph
        .node_indices()
        .filter(|idx| !scheduled[idx.index()])
        .map(|idx| graph[idx].clone())
        .collect();

    Ok(Schedule { order, unscheduled })
}

#[cfg(test)]
mod tests {
    use super::*;
    use brookcore::NodeSpec;

    fn workflow(nodes: &[&str], edges: &[(&str, &str)]) -> Workflow {
        let mut wf = Workflow::new("wf", "test");
        for id in nodes {
            wf.add_node(NodeSpec::new(*id, "echo"));
        }
        for (from, to) in edges {
            wf.connect_main(*from, *to);
        }
        wf
    }

    fn position(order: &[NodeId], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    #[test]
    fn order_respects_every_edge() {
        let wf = workflow(
            &["e", "d", "c", "b", "a"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("d", "e"), ("a", "e")],
        );
        let schedule = schedule(&wf).unwrap();

        assert!(schedule.is_complete());
        assert_eq!(schedule.order.len(), 5);
        for edge in &wf.edges {
            assert!(position(&schedule.order, &edge.from_node) < position(&schedule.order, &edge.to_node));
        }
    }

    #[test]
    fn parallel_edges_count_towards_in_degree() {
        let wf = workflow(&["a", "b", "c"], &[("a", "c"), ("a", "c"), ("b", "c")]);
        let schedule = schedule(&wf).unwrap();
        assert_eq!(schedule.order.last().map(String::as_str), Some("c"));
    }

    #[test]
    fn cycle_and_downstream_nodes_are_unscheduled() {
        let wf = workflow(
            &["start", "x", "y", "after", "free"],
            &[("start", "x"), ("x", "y"), ("y", "x"), ("y", "after")],
        );
        let schedule = schedule(&wf).unwrap();

        assert_eq!(schedule.order, vec!["start".to_string(), "free".to_string()]);
        assert_eq!(
            schedule.unscheduled,
            vec!["x".to_string(), "y".to_string(), "after".to_string()]
        );
        assert!(!schedule.is_complete());
    }

    #[test]
    fn self_loop_is_unschedulable() {
        let wf = workflow(&["a"], &[("a", "a")]);
        let schedule = schedule(&wf).unwrap();
        assert!(schedule.order.is_empty());
        assert_eq!(schedule.unscheduled, vec!["a".to_string()]);
    }

    #[test]
    fn dangling_edge_is_a_configuration_error() {
        let wf = workflow(&["a"], &[("a", "ghost")]);
        assert_eq!(
            schedule(&wf).unwrap_err(),
            WorkflowError::NodeNotFound("ghost".to_string())
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let wf = workflow(&["a", "a"], &[]);
        assert!(matches!(schedule(&wf), Err(WorkflowError::Invalid(_))));
    }
}
