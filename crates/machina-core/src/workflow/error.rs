//! Error types for graph validation, node dispatch and workflow runs.

use std::time::Duration;

use uuid::Uuid;

use machina_types::error::RepositoryError;

use crate::guardrail::GuardrailViolation;
use crate::resilience::CircuitOpenError;
use crate::task::TaskError;

use super::context::{ContextError, ExecutionContext};

// ---------------------------------------------------------------------------
// InvalidGraphError
// ---------------------------------------------------------------------------

/// Structural problem found before the first dispatch. No node has run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidGraphError {
    #[error("graph '{0}' declares no entry node")]
    NoEntry(String),

    #[error("entry node '{0}' is not defined")]
    UnknownEntry(String),

    #[error("entry node '{0}' has an inbound edge")]
    EntryHasInbound(String),

    #[error("edge {from} -> {to} references an undefined node")]
    DanglingEdge { from: String, to: String },

    #[error("node id '{0}' is defined more than once")]
    DuplicateNode(String),

    #[error("cycle detected involving node '{0}'")]
    Cycle(String),

    #[error("node '{0}' is unreachable from the entry nodes")]
    Unreachable(String),

    #[error("output key '{key}' is written by both '{first}' and '{second}'")]
    DuplicateOutputKey {
        key: String,
        first: String,
        second: String,
    },

    #[error("loop edge {from} -> {to} does not close a cycle")]
    LoopEdgeNotCycle { from: String, to: String },

    #[error("loop edge {from} -> {to} has a zero iteration bound")]
    ZeroLoopBound { from: String, to: String },

    #[error("node '{node}' declares invalid output key '{key}'")]
    InvalidOutputKey { node: String, key: String },

    #[error("node '{node}' uses unregistered task handler '{task}'")]
    UnboundHandler { node: String, task: String },

    #[error("node '{node}' uses unregistered guard '{guard}'")]
    UnboundGuard { node: String, guard: String },

    #[error("condition uses unregistered predicate '{0}'")]
    UnboundPredicate(String),

    #[error("node '{node}' uses unregistered compensation handler '{task}'")]
    UnboundCompensation { node: String, task: String },

    #[error("invalid expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },
}

// ---------------------------------------------------------------------------
// NodeError
// ---------------------------------------------------------------------------

/// Why a single node failed. Recorded as the history reason.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Guardrail(#[from] GuardrailViolation),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("retry exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: TaskError },

    #[error(transparent)]
    Task(TaskError),

    #[error("loop-limit-exceeded: node '{node}' re-entered more than {limit} times")]
    LoopLimitExceeded { node: String, limit: u32 },

    #[error("missing input '{0}'")]
    MissingInput(String),

    #[error("condition evaluation failed: {0}")]
    Condition(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("node timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    /// Guard blocks are never retried.
    pub fn is_guard_block(&self) -> bool {
        matches!(self, NodeError::Guardrail(_))
    }
}

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

/// A run ended in a non-SUCCEEDED state.
#[derive(Debug, thiserror::Error)]
#[error("workflow run {run_id} failed at node '{node_id}': {reason}")]
pub struct WorkflowExecutionError {
    pub run_id: Uuid,
    /// First node that failed.
    pub node_id: String,
    pub reason: String,
    pub context: ExecutionContext,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid graph: {0}")]
    InvalidGraph(#[from] InvalidGraphError),

    #[error(transparent)]
    Execution(Box<WorkflowExecutionError>),

    #[error("saga compensation failed for nodes [{}]", .failed.join(", "))]
    SagaCompensationFailed {
        failed: Vec<String>,
        context: Box<ExecutionContext>,
    },

    #[error("workflow run {} cancelled: {reason}", .context.run_id)]
    Cancelled {
        reason: String,
        context: Box<ExecutionContext>,
    },

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl WorkflowError {
    /// Final context of the run, when one exists.
    pub fn context(&self) -> Option<&ExecutionContext> {
        match self {
            WorkflowError::Execution(e) => Some(&e.context),
            WorkflowError::SagaCompensationFailed { context, .. }
            | WorkflowError::Cancelled { context, .. } => Some(context),
            WorkflowError::InvalidGraph(_)
            | WorkflowError::RunNotFound(_)
            | WorkflowError::Repository(_) => None,
        }
    }
}
