//! Forwards bus events to `tracing`.
//!
//! Failures, guard blocks and circuit transitions log at WARN, lifecycle
//! events at INFO and retry attempts at DEBUG.

use machina_core::event::EventBus;
use machina_types::event::WorkflowEvent;
use machina_types::resilience::CircuitState;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Log one event with structured fields.
pub fn log_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::RunStarted { run_id, graph, resumed } => {
            tracing::info!(run_id = %run_id, graph = %graph, resumed, "run started");
        }
        WorkflowEvent::RunCompleted { run_id, graph, status, duration_ms } => {
            tracing::info!(run_id = %run_id, graph = %graph, status = %status, duration_ms, "run completed");
        }
        WorkflowEvent::RunCancelled { run_id, reason } => {
            tracing::warn!(run_id = %run_id, reason = %reason, "run cancelled");
        }
        WorkflowEvent::NodeStarted { run_id, node_id } => {
            tracing::debug!(run_id = %run_id, node_id = %node_id, "node started");
        }
        WorkflowEvent::NodeCompleted { run_id, node_id, attempts, duration_ms } => {
            tracing::info!(run_id = %run_id, node_id = %node_id, attempts, duration_ms, "node completed");
        }
        WorkflowEvent::NodeFailed { run_id, node_id, error } => {
            tracing::warn!(run_id = %run_id, node_id = %node_id, error = %error, "node failed");
        }
        WorkflowEvent::NodeSkipped { run_id, node_id, reason } => {
            tracing::info!(run_id = %run_id, node_id = %node_id, reason = %reason, "node skipped");
        }
        WorkflowEvent::RetryAttempt { operation, attempt, delay_ms, error } => {
            tracing::debug!(operation = %operation, attempt, delay_ms, error = %error, "retrying");
        }
        WorkflowEvent::CircuitTransition { service, from, to } => {
            if *to == CircuitState::Closed {
                tracing::info!(service = %service, from = %from, to = %to, "circuit transition");
            } else {
                tracing::warn!(service = %service, from = %from, to = %to, "circuit transition");
            }
        }
        WorkflowEvent::GuardBlocked { run_id, node_id, class, guard, reason } => {
            tracing::warn!(
                run_id = %run_id,
                node_id = %node_id,
                class = %class,
                guard = %guard,
                reason = %reason,
                "guard blocked"
            );
        }
        WorkflowEvent::CompensationStarted { run_id, step } => {
            tracing::info!(run_id = %run_id, step = %step, "compensation started");
        }
        WorkflowEvent::CompensationCompleted { run_id, step } => {
            tracing::info!(run_id = %run_id, step = %step, "compensation completed");
        }
        WorkflowEvent::CompensationFailed { run_id, step, error } => {
            tracing::warn!(run_id = %run_id, step = %step, error = %error, "compensation failed");
        }
    }
}

/// Subscribe to `bus` and log every event until all senders are dropped.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event logger lagged behind the bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
