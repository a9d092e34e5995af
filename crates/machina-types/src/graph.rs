//! Workflow graph definition types.
//!
//! A [`WorkflowGraph`] is declared once (YAML, TOML or code) and stays
//! immutable while a run executes. Task handlers, guards and predicates are
//! referenced by registry key; the engine resolves every key before the
//! first node is dispatched.

use serde::{Deserialize, Serialize};

use crate::resilience::RetryPolicy;

/// Prefix that routes a context key to the shared scope.
pub const SHARED_PREFIX: &str = "shared:";

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Declarative graph of task nodes and dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowGraph {
    pub name: String,

    /// Nodes that start the run. Must have no inbound non-loop edges.
    pub entry: Vec<String>,

    pub nodes: Vec<NodeDefinition>,

    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,

    #[serde(default)]
    pub settings: RunSettings,

    /// Effects that action-producing nodes may declare. `None` permits any
    /// effect and leaves the decision to the node's action guards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permitted_effects: Option<Vec<String>>,
}

impl WorkflowGraph {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Per-graph run behaviour. Unset fields fall back to the engine config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSettings {
    /// Cancel in-flight sibling branches on the first node failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,

    /// Compensate succeeded nodes in reverse order when the run fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A single unit of work in the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDefinition {
    pub id: String,

    /// Registry key of the task handler.
    pub task: String,

    /// Context keys resolved and handed to the handler. Dotted paths read
    /// into JSON values (`fetch.target`).
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Context key the node's result is written to. Write-once per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Circuit-breaker key. Defaults to the task key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Evaluated when the node becomes eligible; false skips the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,

    #[serde(default)]
    pub guards: GuardBindings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionDeclaration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Registry key of the handler that undoes this node in saga mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<String>,

    /// Per-attempt timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl NodeDefinition {
    /// Create a node with only an id and a task key.
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            inputs: Vec::new(),
            output: None,
            service: None,
            condition: None,
            guards: GuardBindings::default(),
            action: None,
            retry: None,
            compensation: None,
            timeout_secs: None,
        }
    }

    /// The key the circuit breaker for this node is registered under.
    pub fn service_key(&self) -> &str {
        self.service.as_deref().unwrap_or(&self.task)
    }
}

/// Guard names applied at each pipeline point, in evaluation order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GuardBindings {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action: Vec<String>,
}

impl GuardBindings {
    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.output.is_empty() && self.action.is_empty()
    }

    /// All referenced guard names across the three classes.
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.input.iter().chain(&self.output).chain(&self.action)
    }
}

/// External effect a node produces, checked by action guards before the
/// node runs at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionDeclaration {
    /// Effect kind, e.g. `http_post` or `send_email`.
    pub effect: String,

    /// Context key holding the effect's target (URL, domain, address).
    pub target_key: String,
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// Dependency between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,

    /// Unconditioned edges always fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,

    /// Marks a bounded loop-back edge and caps how often it re-enters `to`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl EdgeDefinition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            max_iterations: None,
        }
    }

    pub fn when(mut self, condition: EdgeCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn looping(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn is_loop(&self) -> bool {
        self.max_iterations.is_some()
    }
}

/// Serializable condition evaluated against the execution context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Value at `key` equals `value`.
    KeyEquals {
        key: String,
        value: serde_json::Value,
    },
    /// A value is present at `key`.
    KeyPresent { key: String },
    /// JEXL boolean expression over the context values.
    Expression { expr: String },
    /// Named predicate from the registry.
    Predicate { name: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
