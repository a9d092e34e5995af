//! Graph validation and the execution plan derived from it.
//!
//! Uses `petgraph` over the non-loop edges: a topological sort rejects
//! cycles, and path queries check that every loop edge closes one. Loop
//! edges are bounded re-entries and never count toward a node's
//! dependencies.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use machina_types::graph::{EdgeCondition, EdgeDefinition, WorkflowGraph};

use super::condition::ConditionEvaluator;
use super::context::parse_key;
use super::error::InvalidGraphError;
use super::registry::Registry;

/// Validated, index-friendly view of a [`WorkflowGraph`].
#[derive(Debug, Clone)]
pub struct GraphPlan {
    /// Node ids in a topological order of the non-loop edges.
    pub order: Vec<String>,
    pub edges: Vec<EdgeDefinition>,
    /// Non-loop inbound edge indices per node.
    pub inbound: HashMap<String, Vec<usize>>,
    /// Outbound edge indices per node, loop edges included.
    pub outbound: HashMap<String, Vec<usize>>,
    /// For each loop edge index, the nodes re-executed when it fires.
    pub loop_bodies: HashMap<usize, Vec<String>>,
}

impl GraphPlan {
    pub fn inbound(&self, node: &str) -> &[usize] {
        self.inbound.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outbound(&self, node: &str) -> &[usize] {
        self.outbound.get(node).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Validate `graph` against `registry` and build its plan.
pub fn validate(
    graph: &WorkflowGraph,
    registry: &Registry,
    conditions: &ConditionEvaluator,
) -> Result<GraphPlan, InvalidGraphError> {
    if graph.entry.is_empty() {
        return Err(InvalidGraphError::NoEntry(graph.name.clone()));
    }

    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    let mut dag = DiGraph::<&str, ()>::new();
    for node in &graph.nodes {
        if index.contains_key(node.id.as_str()) {
            return Err(InvalidGraphError::DuplicateNode(node.id.clone()));
        }
        index.insert(node.id.as_str(), dag.add_node(node.id.as_str()));
    }

    for entry in &graph.entry {
        if !index.contains_key(entry.as_str()) {
            return Err(InvalidGraphError::UnknownEntry(entry.clone()));
        }
    }

    let mut inbound: HashMap<String, Vec<usize>> = HashMap::new();
    let mut outbound: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, edge) in graph.edges.iter().enumerate() {
        let (Some(&from), Some(&to)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str()))
        else {
            return Err(InvalidGraphError::DanglingEdge {
                from: edge.from.clone(),
                to: edge.to.clone(),
            });
        };
        outbound.entry(edge.from.clone()).or_default().push(i);
        match edge.max_iterations {
            Some(0) => {
                return Err(InvalidGraphError::ZeroLoopBound {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
            Some(_) => {}
            None => {
                dag.add_edge(from, to, ());
                inbound.entry(edge.to.clone()).or_default().push(i);
            }
        }
    }

    let sorted = toposort(&dag, None)
        .map_err(|cycle| InvalidGraphError::Cycle(dag[cycle.node_id()].to_string()))?;

    for entry in &graph.entry {
        if inbound.get(entry).is_some_and(|edges| !edges.is_empty()) {
            return Err(InvalidGraphError::EntryHasInbound(entry.clone()));
        }
    }

    // Loop edges must point back to a node their source depends on.
    let mut loop_bodies = HashMap::new();
    for (i, edge) in graph.edges.iter().enumerate().filter(|(_, e)| e.is_loop()) {
        let from = index[edge.from.as_str()];
        let to = index[edge.to.as_str()];
        if !has_path_connecting(&dag, to, from, None) {
            return Err(InvalidGraphError::LoopEdgeNotCycle {
                from: edge.from.clone(),
                to: edge.to.clone(),
            });
        }
        let body: Vec<String> = sorted
            .iter()
            .filter(|&&n| has_path_connecting(&dag, to, n, None) && has_path_connecting(&dag, n, from, None))
            .map(|&n| dag[n].to_string())
            .collect();
        loop_bodies.insert(i, body);
    }

    check_reachable(graph)?;
    check_outputs(graph)?;
    check_bindings(graph, registry, conditions)?;

    Ok(GraphPlan {
        order: sorted.iter().map(|&n| dag[n].to_string()).collect(),
        edges: graph.edges.clone(),
        inbound,
        outbound,
        loop_bodies,
    })
}

fn check_reachable(graph: &WorkflowGraph) -> Result<(), InvalidGraphError> {
    let mut seen: HashSet<&str> = graph.entry.iter().map(String::as_str).collect();
    let mut queue: VecDeque<&str> = seen.iter().copied().collect();
    while let Some(current) = queue.pop_front() {
        for edge in graph.edges.iter().filter(|e| e.from == current) {
            if seen.insert(edge.to.as_str()) {
                queue.push_back(edge.to.as_str());
            }
        }
    }
    match graph.nodes.iter().find(|n| !seen.contains(n.id.as_str())) {
        Some(node) => Err(InvalidGraphError::Unreachable(node.id.clone())),
        None => Ok(()),
    }
}

fn check_outputs(graph: &WorkflowGraph) -> Result<(), InvalidGraphError> {
    let mut writers: HashMap<&str, &str> = HashMap::new();
    for node in &graph.nodes {
        let Some(key) = node.output.as_deref() else {
            continue;
        };
        let (_, name) = parse_key(key);
        if name.is_empty() || name.contains('.') {
            return Err(InvalidGraphError::InvalidOutputKey {
                node: node.id.clone(),
                key: key.to_string(),
            });
        }
        if let Some(first) = writers.insert(key, node.id.as_str()) {
            return Err(InvalidGraphError::DuplicateOutputKey {
                key: key.to_string(),
                first: first.to_string(),
                second: node.id.clone(),
            });
        }
    }
    Ok(())
}

fn check_condition(
    condition: &EdgeCondition,
    registry: &Registry,
    conditions: &ConditionEvaluator,
) -> Result<(), InvalidGraphError> {
    match condition {
        EdgeCondition::Predicate { name } if registry.predicate(name).is_none() => {
            Err(InvalidGraphError::UnboundPredicate(name.clone()))
        }
        EdgeCondition::Expression { expr } => {
            conditions
                .check_syntax(expr)
                .map_err(|reason| InvalidGraphError::InvalidExpression {
                    expr: expr.clone(),
                    reason,
                })
        }
        _ => Ok(()),
    }
}

fn check_bindings(
    graph: &WorkflowGraph,
    registry: &Registry,
    conditions: &ConditionEvaluator,
) -> Result<(), InvalidGraphError> {
    for node in &graph.nodes {
        if registry.handler(&node.task).is_none() {
            return Err(InvalidGraphError::UnboundHandler {
                node: node.id.clone(),
                task: node.task.clone(),
            });
        }
        if let Some(task) = node.compensation.as_ref().filter(|t| registry.handler(t).is_none()) {
            return Err(InvalidGraphError::UnboundCompensation {
                node: node.id.clone(),
                task: task.clone(),
            });
        }
        if let Some(guard) = node.guards.all().find(|g| registry.guard(g).is_none()) {
            return Err(InvalidGraphError::UnboundGuard {
                node: node.id.clone(),
                guard: guard.clone(),
            });
        }
        if let Some(condition) = &node.condition {
            check_condition(condition, registry, conditions)?;
        }
    }
    for condition in graph.edges.iter().filter_map(|e| e.condition.as_ref()) {
        check_condition(condition, registry, conditions)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
