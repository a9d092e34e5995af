//! Workflow engine: graph validation, run scheduling and durable checkpoints.
//!
//! - `graph` -- structural validation and the topological plan
//! - `context` -- run-scoped and shared key/value state plus history
//! - `condition` -- edge and node condition evaluation (JEXL)
//! - `registry` -- task handlers, guards and predicates bound by name
//! - `engine` -- the run loop: dispatch, loops, fail-fast, saga mode, resume

pub mod condition;
pub mod context;
mod dispatch;
pub mod engine;
pub mod error;
pub mod graph;
pub mod registry;

pub use context::{ContextError, ExecutionContext};
pub use dispatch::PERMITTED_EFFECTS_GUARD;
pub use engine::WorkflowEngine;
pub use error::{InvalidGraphError, NodeError, WorkflowError, WorkflowExecutionError};
pub use graph::GraphPlan;
pub use registry::Registry;
