//! Event types emitted by the workflow core.
//!
//! `WorkflowEvent` is the unified event type handed to the injected event
//! sink. All variants are Clone + Send + Sync for use with tokio broadcast
//! channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::guardrail::GuardClass;
use crate::resilience::CircuitState;
use crate::run::RunStatus;

/// Structured events for run lifecycle, resilience and guard decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // -- Run lifecycle --
    RunStarted {
        run_id: Uuid,
        graph: String,
        resumed: bool,
    },

    RunCompleted {
        run_id: Uuid,
        graph: String,
        status: RunStatus,
        duration_ms: u64,
    },

    RunCancelled {
        run_id: Uuid,
        reason: String,
    },

    // -- Node lifecycle --
    NodeStarted {
        run_id: Uuid,
        node_id: String,
    },

    NodeCompleted {
        run_id: Uuid,
        node_id: String,
        attempts: u32,
        duration_ms: u64,
    },

    NodeFailed {
        run_id: Uuid,
        node_id: String,
        error: String,
    },

    NodeSkipped {
        run_id: Uuid,
        node_id: String,
        reason: String,
    },

    // -- Resilience --
    /// A retryable failure; the operation runs again after `delay_ms`.
    RetryAttempt {
        operation: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    CircuitTransition {
        service: String,
        from: CircuitState,
        to: CircuitState,
    },

    // -- Guardrails --
    GuardBlocked {
        run_id: Uuid,
        node_id: String,
        class: GuardClass,
        guard: String,
        reason: String,
    },

    // -- Saga --
    CompensationStarted {
        run_id: Uuid,
        step: String,
    },

    CompensationCompleted {
        run_id: Uuid,
        step: String,
    },

    CompensationFailed {
        run_id: Uuid,
        step: String,
        error: String,
    },
}

impl WorkflowEvent {
    /// Returns the run id for run-scoped variants, None for process-scoped
    /// events (retries, circuit transitions).
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id, .. }
            | WorkflowEvent::RunCancelled { run_id, .. }
            | WorkflowEvent::NodeStarted { run_id, .. }
            | WorkflowEvent::NodeCompleted { run_id, .. }
            | WorkflowEvent::NodeFailed { run_id, .. }
            | WorkflowEvent::NodeSkipped { run_id, .. }
            | WorkflowEvent::GuardBlocked { run_id, .. }
            | WorkflowEvent::CompensationStarted { run_id, .. }
            | WorkflowEvent::CompensationCompleted { run_id, .. }
            | WorkflowEvent::CompensationFailed { run_id, .. } => Some(*run_id),
            WorkflowEvent::RetryAttempt { .. } | WorkflowEvent::CircuitTransition { .. } => None,
        }
    }
}
