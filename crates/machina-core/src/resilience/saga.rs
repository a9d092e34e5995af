//! Saga coordination: ordered steps with reverse-order compensation.
//!
//! Steps run strictly in declared order, each through the [`RetryExecutor`]
//! with its own policy. When a step fails for good, every step that already
//! finished is compensated in reverse order. A failing compensation is
//! recorded and the sweep continues; the caller receives
//! [`SagaError::CompensationFailed`] naming every step left uncompensated.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use machina_types::event::WorkflowEvent;
use machina_types::resilience::{RetryPolicy, SagaStepStatus};
use machina_types::run::{HistoryEntry, NodeStatus, RunStatus};

use crate::event::{NoopSink, SharedSink};
use crate::resilience::retry::{RetryError, RetryExecutor};
use crate::task::{Classifier, TaskError, default_classifier};
use crate::workflow::context::ExecutionContext;

/// Async callable used for step actions and compensations.
pub type SagaFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync>;

fn boxed<F, Fut>(f: F) -> SagaFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

// ---------------------------------------------------------------------------
// SagaStep
// ---------------------------------------------------------------------------

/// One step of a saga: an action and the compensation that undoes it.
///
/// The action receives `{"context": <context values>, "outputs": [...]}`
/// where `outputs` holds the outputs of the steps before it, in order. The
/// compensation receives the action's own output. Step names label history
/// entries and events only; they need not be unique.
pub struct SagaStep {
    name: String,
    action: SagaFn,
    compensation: SagaFn,
    policy: RetryPolicy,
    status: SagaStepStatus,
    output: Option<Value>,
}

impl SagaStep {
    pub fn new<A, AFut, C, CFut>(name: impl Into<String>, action: A, compensation: C) -> Self
    where
        A: Fn(Value) -> AFut + Send + Sync + 'static,
        AFut: Future<Output = Result<Value, TaskError>> + Send + 'static,
        C: Fn(Value) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: boxed(action),
            compensation: boxed(compensation),
            policy: RetryPolicy::none(),
            status: SagaStepStatus::Pending,
            output: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> SagaStepStatus {
        self.status
    }

    /// Output of the last successful action.
    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }
}

impl std::fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("status", &self.status)
            .finish()
    }
}

/// A compensation queued for the reverse sweep.
pub struct Compensation {
    pub name: String,
    pub task: BoxFuture<'static, Result<Value, TaskError>>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    /// A step failed and every completed step was compensated.
    #[error("saga step '{step}' failed: {error}")]
    StepFailed {
        step: String,
        error: RetryError<TaskError>,
        context: Box<ExecutionContext>,
    },

    /// A step failed and at least one compensation failed as well. Requires
    /// manual intervention.
    #[error("saga compensation failed for steps [{}] after step '{step}' failed", .failed.join(", "))]
    CompensationFailed {
        step: String,
        failed: Vec<String>,
        context: Box<ExecutionContext>,
    },
}

impl SagaError {
    pub fn context(&self) -> &ExecutionContext {
        match self {
            SagaError::StepFailed { context, .. } | SagaError::CompensationFailed { context, .. } => {
                context
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SagaCoordinator
// ---------------------------------------------------------------------------

/// Executes sagas and compensation sweeps.
#[derive(Clone)]
pub struct SagaCoordinator {
    retry: RetryExecutor,
    classifier: Classifier,
    sink: SharedSink,
    cancel: CancellationToken,
}

impl SagaCoordinator {
    pub fn new(retry: RetryExecutor, sink: SharedSink) -> Self {
        Self {
            retry,
            classifier: default_classifier(),
            sink,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Abort pending retries of step actions when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `steps` in order against `context`.
    ///
    /// Outputs are kept on the steps (see [`SagaStep::output`]); the context
    /// only receives history entries for every action and compensation.
    pub async fn run(
        &self,
        steps: &mut [SagaStep],
        mut context: ExecutionContext,
    ) -> Result<ExecutionContext, SagaError> {
        let mut outputs: Vec<Value> = Vec::with_capacity(steps.len());

        for index in 0..steps.len() {
            let step = &mut steps[index];
            step.output = None;
            let input = json!({
                "context": context.to_expression_context(),
                "outputs": outputs,
            });
            let action = Arc::clone(&step.action);
            let classifier = Arc::clone(&self.classifier);

            let result = self
                .retry
                .run_classified(
                    &step.name,
                    &step.policy,
                    |e: &TaskError| classifier(e),
                    &self.cancel,
                    |_| action(input.clone()),
                )
                .await;

            let error = match result {
                Ok(value) => {
                    step.status = SagaStepStatus::Done;
                    step.output = Some(value.clone());
                    context.record(HistoryEntry::new(&step.name, NodeStatus::Succeeded));
                    outputs.push(value);
                    continue;
                }
                Err(error) => error,
            };

            step.status = SagaStepStatus::Failed;
            let failed_step = step.name.clone();
            tracing::warn!(
                run_id = %context.run_id,
                step = %failed_step,
                step_index = index,
                error = %error,
                "Saga step failed, compensating"
            );
            context.record(
                HistoryEntry::new(&failed_step, NodeStatus::Failed)
                    .with_reason(error.to_string())
                    .with_attempts(error.attempts()),
            );

            // Queue position `q` compensates step `index - 1 - q`.
            let queue: Vec<Compensation> = steps[..index]
                .iter()
                .zip(outputs.iter())
                .rev()
                .map(|(done, output)| Compensation {
                    name: done.name.clone(),
                    task: (done.compensation)(output.clone()),
                })
                .collect();
            let failed_positions = self.sweep(&mut context, queue).await;

            let mut failed = Vec::new();
            for (q, done) in steps[..index].iter_mut().rev().enumerate() {
                if failed_positions.contains(&q) {
                    done.status = SagaStepStatus::CompensationFailed;
                    failed.push(done.name.clone());
                } else {
                    done.status = SagaStepStatus::Compensated;
                }
            }

            if failed.is_empty() {
                context.finish(RunStatus::Compensated);
                return Err(SagaError::StepFailed {
                    step: failed_step,
                    error,
                    context: Box::new(context),
                });
            }
            context.finish(RunStatus::Failed);
            return Err(SagaError::CompensationFailed {
                step: failed_step,
                failed,
                context: Box::new(context),
            });
        }

        context.finish(RunStatus::Succeeded);
        Ok(context)
    }

    /// Run compensations in the given order, recording each outcome in
    /// `context`. Returns the names whose compensation failed.
    ///
    /// Each compensation gets a single attempt; a failure never stops the
    /// sweep.
    pub async fn compensate(
        &self,
        context: &mut ExecutionContext,
        queue: Vec<Compensation>,
    ) -> Vec<String> {
        let names: Vec<String> = queue.iter().map(|c| c.name.clone()).collect();
        self.sweep(context, queue)
            .await
            .into_iter()
            .map(|q| names[q].clone())
            .collect()
    }

    /// Queue positions whose compensation failed.
    async fn sweep(&self, context: &mut ExecutionContext, queue: Vec<Compensation>) -> Vec<usize> {
        let run_id: Uuid = context.run_id;
        let mut failed = Vec::new();

        for (position, Compensation { name, task }) in queue.into_iter().enumerate() {
            self.sink.emit(WorkflowEvent::CompensationStarted {
                run_id,
                step: name.clone(),
            });

            match task.await {
                Ok(_) => {
                    tracing::info!(run_id = %run_id, step = %name, "Compensated");
                    context.record(HistoryEntry::new(&name, NodeStatus::Compensated));
                    self.sink.emit(WorkflowEvent::CompensationCompleted { run_id, step: name });
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, step = %name, error = %e, "Compensation failed");
                    context.record(
                        HistoryEntry::new(&name, NodeStatus::CompensationFailed)
                            .with_reason(e.to_string()),
                    );
                    self.sink.emit(WorkflowEvent::CompensationFailed {
                        run_id,
                        step: name,
                        error: e.to_string(),
                    });
                    failed.push(position);
                }
            }
        }

        failed
    }
}

impl Default for SagaCoordinator {
    fn default() -> Self {
        Self::new(RetryExecutor::default(), Arc::new(NoopSink))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
