//! Workflow engine: validates a graph and drives one run to a terminal state.
//!
//! A single run loop owns the [`ExecutionContext`] and is the only writer of
//! node state, edge state and history. Workers in a `JoinSet` run the
//! dispatch pipeline and report back; the loop records each outcome in
//! completion order, resolves outbound edges and dispatches whatever became
//! eligible. Every wait in a run observes the run's cancellation token.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use machina_types::config::EngineConfig;
use machina_types::event::WorkflowEvent;
use machina_types::graph::{NodeDefinition, WorkflowGraph};
use machina_types::run::{HistoryEntry, NodeStatus, RunStatus};

use crate::channel::{CommunicationChannel, sleep_until_deadline};
use crate::event::{NoopSink, SharedSink};
use crate::guardrail::{GuardError, GuardInspector};
use crate::repository::{InMemoryRunStore, RunStore};
use crate::resilience::{
    CircuitBreakerRegistry, Compensation, RetryExecutor, RetryMetrics, SagaCoordinator,
};
use crate::task::{Classifier, TaskContext, TaskError, default_classifier};

use super::condition::ConditionEvaluator;
use super::context::{ExecutionContext, parse_key};
use super::dispatch::{Dispatcher, NodeJob, NodeReport};
use super::error::{InvalidGraphError, NodeError, WorkflowError, WorkflowExecutionError};
use super::graph::{GraphPlan, validate};
use super::registry::Registry;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Pending,
    Fired,
    Pruned,
    /// Source failed or was skipped because of an upstream failure.
    Dead,
    /// Condition could not be evaluated; fails the target.
    Errored,
}

/// A succeeded node, kept for compensation.
struct Completed {
    node_id: String,
    output: Value,
    inputs: Map<String, Value>,
}

struct RunState<'g> {
    nodes: HashMap<&'g str, &'g NodeDefinition>,
    plan: GraphPlan,
    slots: HashMap<String, Slot>,
    edges: Vec<EdgeState>,
    edge_errors: HashMap<usize, String>,
    loop_counts: HashMap<usize, u32>,
    /// Inputs of running nodes, moved to `completed` on success.
    inputs: HashMap<String, Map<String, Value>>,
    completed: Vec<Completed>,
    first_failure: Option<(String, String)>,
    fail_fast: bool,
    /// No further dispatches (fail-fast triggered or run aborted).
    halted: bool,
    node_token: CancellationToken,
    /// Node of each live worker task.
    tasks: HashMap<TaskId, String>,
}

impl<'g> RunState<'g> {
    fn new(
        graph: &'g WorkflowGraph,
        plan: GraphPlan,
        fail_fast: bool,
        node_token: CancellationToken,
    ) -> Self {
        let edges = vec![EdgeState::Pending; plan.edges.len()];
        Self {
            nodes: graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect(),
            slots: graph
                .nodes
                .iter()
                .map(|n| (n.id.clone(), Slot::Pending))
                .collect(),
            plan,
            edges,
            edge_errors: HashMap::new(),
            loop_counts: HashMap::new(),
            inputs: HashMap::new(),
            completed: Vec::new(),
            first_failure: None,
            fail_fast,
            halted: false,
            node_token,
            tasks: HashMap::new(),
        }
    }

    fn node(&self, id: &str) -> Option<&'g NodeDefinition> {
        self.nodes.get(id).copied()
    }

    fn slot(&self, id: &str) -> Slot {
        self.slots.get(id).copied().unwrap_or(Slot::Pending)
    }

    fn set(&mut self, id: &str, slot: Slot) {
        self.slots.insert(id.to_string(), slot);
    }

    /// Set every non-loop outbound edge of `id` to `state`.
    fn mark_outbound(&mut self, id: &str, state: EdgeState) {
        for &i in self.plan.outbound(id) {
            if !self.plan.edges[i].is_loop() {
                self.edges[i] = state;
            }
        }
    }
}

type Joined = Result<(TaskId, NodeReport), JoinError>;

enum Wake {
    Joined(Option<Joined>),
    Cancelled,
    TimedOut,
}

fn resolve_inputs(
    node: &NodeDefinition,
    ctx: &ExecutionContext,
) -> Result<Map<String, Value>, NodeError> {
    node.inputs
        .iter()
        .map(|key| {
            let value = ctx
                .get(key)
                .cloned()
                .ok_or_else(|| NodeError::MissingInput(key.clone()))?;
            Ok((parse_key(key).1.to_string(), value))
        })
        .collect()
}

fn spawn_worker(
    workers: &mut JoinSet<NodeReport>,
    dispatcher: Arc<Dispatcher>,
    semaphore: Arc<Semaphore>,
    job: NodeJob,
) -> TaskId {
    workers.spawn(async move {
        let node_id = job.node.id.clone();
        let cancel = job.cancel.clone();
        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            return NodeReport {
                node_id,
                attempts: 0,
                duration: Duration::ZERO,
                result: Err(NodeError::Cancelled),
            };
        };

        AssertUnwindSafe(dispatcher.dispatch(job))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                tracing::error!(node_id = %node_id, "Task handler panicked");
                NodeReport {
                    node_id,
                    attempts: 1,
                    duration: Duration::ZERO,
                    result: Err(NodeError::Task(TaskError::fatal("task handler panicked"))),
                }
            })
    })
    .id()
}

/// Turn a joined worker into its node's report. A worker that died outside
/// the dispatch pipeline fails its node; an unknown task yields `None`.
fn report_from_join(tasks: &mut HashMap<TaskId, String>, joined: Joined) -> Option<NodeReport> {
    match joined {
        Ok((id, report)) => {
            tasks.remove(&id);
            Some(report)
        }
        Err(e) => {
            let node_id = tasks.remove(&e.id())?;
            let result = if e.is_cancelled() {
                Err(NodeError::Cancelled)
            } else {
                Err(NodeError::Task(TaskError::fatal(format!("node worker died: {e}"))))
            };
            Some(NodeReport {
                node_id,
                attempts: 0,
                duration: Duration::ZERO,
                result,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Runs workflow graphs with guardrails, retries, circuit breakers and
/// optional saga compensation.
///
/// Generic over `S: RunStore` for checkpoint storage. Breaker state lives in
/// the [`CircuitBreakerRegistry`] and is shared by every run of this engine
/// (and any other holder of the same registry).
pub struct WorkflowEngine<S: RunStore = InMemoryRunStore> {
    registry: Arc<Registry>,
    store: Arc<S>,
    config: EngineConfig,
    sink: SharedSink,
    breakers: CircuitBreakerRegistry,
    retry: RetryExecutor,
    inspector: GuardInspector,
    classifier: Classifier,
    conditions: ConditionEvaluator,
    /// Cancellation tokens of live runs.
    active: DashMap<Uuid, CancellationToken>,
}

impl<S: RunStore + 'static> WorkflowEngine<S> {
    /// Build an engine. Guards declared in `config.guards` are added to
    /// `registry`.
    pub fn new(registry: Registry, store: S, config: EngineConfig) -> Result<Self, GuardError> {
        let registry = registry.with_guard_specs(&config.guards)?;
        let sink: SharedSink = Arc::new(NoopSink);
        Ok(Self {
            registry: Arc::new(registry),
            store: Arc::new(store),
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone(), Arc::clone(&sink))
                .with_overrides(config.services.clone()),
            retry: RetryExecutor::new(Arc::clone(&sink)),
            sink,
            config,
            inspector: GuardInspector::new(),
            classifier: default_classifier(),
            conditions: ConditionEvaluator::new(),
            active: DashMap::new(),
        })
    }

    /// Route events to `sink`. Rebuilds the breaker registry so transitions
    /// are reported; call before [`Self::with_breakers`].
    pub fn with_event_sink(mut self, sink: SharedSink) -> Self {
        self.breakers =
            CircuitBreakerRegistry::new(self.config.circuit_breaker.clone(), Arc::clone(&sink))
                .with_overrides(self.config.services.clone());
        self.retry = RetryExecutor::new(Arc::clone(&sink));
        self.sink = sink;
        self
    }

    /// Share an existing breaker registry (process-wide breaker state).
    pub fn with_breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    /// Replace the retryable/fatal classification of task errors.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Bound every single guard check; a check exceeding it blocks.
    pub fn with_guard_timeout(mut self, timeout: Duration) -> Self {
        self.inspector = GuardInspector::new().with_check_timeout(timeout);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_metrics(&self) -> RetryMetrics {
        self.retry.metrics()
    }

    /// Check `graph` without running it.
    pub fn validate(&self, graph: &WorkflowGraph) -> Result<GraphPlan, InvalidGraphError> {
        validate(graph, &self.registry, &self.conditions)
    }

    pub fn is_running(&self, run_id: &Uuid) -> bool {
        self.active.contains_key(run_id)
    }

    /// Cancel a live run. Returns `false` if no such run is active.
    pub fn cancel(&self, run_id: &Uuid) -> bool {
        match self.active.get(run_id) {
            Some(token) => {
                tracing::info!(run_id = %run_id, "Cancelling workflow run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run `graph` from its entry nodes.
    ///
    /// Returns the context only when the run SUCCEEDED; every other outcome
    /// is an error carrying the final context and history.
    pub async fn execute(
        &self,
        graph: &WorkflowGraph,
        initial: ExecutionContext,
    ) -> Result<ExecutionContext, WorkflowError> {
        let plan = self.validate(graph)?;
        let mut ctx = initial;
        ctx.graph = graph.name.clone();
        ctx.status = RunStatus::Running;
        self.drive(graph, plan, ctx, HashSet::new(), false).await
    }

    /// Continue a checkpointed run. Nodes whose latest history entry is
    /// SUCCEEDED are kept; everything else is scheduled again.
    pub async fn resume(
        &self,
        graph: &WorkflowGraph,
        run_id: Uuid,
    ) -> Result<ExecutionContext, WorkflowError> {
        let plan = self.validate(graph)?;
        let mut ctx = self
            .store
            .load(&run_id)
            .await?
            .ok_or(WorkflowError::RunNotFound(run_id))?;

        let done: HashSet<String> = graph
            .nodes
            .iter()
            .filter(|n| ctx.latest(&n.id).map(|e| e.status) == Some(NodeStatus::Succeeded))
            .map(|n| n.id.clone())
            .collect();
        for node in graph.nodes.iter().filter(|n| !done.contains(&n.id)) {
            if let Some(key) = &node.output {
                ctx.reopen(key);
            }
        }
        ctx.status = RunStatus::Running;
        ctx.finished_at = None;

        tracing::info!(
            run_id = %run_id,
            completed = done.len(),
            total = graph.nodes.len(),
            "Resuming workflow run"
        );
        self.drive(graph, plan, ctx, done, true).await
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            registry: Arc::clone(&self.registry),
            breakers: self.breakers.clone(),
            retry: self.retry.clone(),
            inspector: self.inspector.clone(),
            classifier: Arc::clone(&self.classifier),
            sink: Arc::clone(&self.sink),
            default_policy: self.config.retry.clone(),
            node_timeout: self.config.node_timeout(),
        }
    }

    async fn checkpoint(&self, ctx: &ExecutionContext) {
        if let Err(e) = self.store.save(ctx).await {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "Failed to save run checkpoint");
        }
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        graph: &WorkflowGraph,
        plan: GraphPlan,
        mut ctx: ExecutionContext,
        done: HashSet<String>,
        resumed: bool,
    ) -> Result<ExecutionContext, WorkflowError> {
        let run_id = ctx.run_id;
        let settings = &graph.settings;
        let fail_fast = settings.fail_fast.unwrap_or(self.config.fail_fast);
        let saga = settings.saga.unwrap_or(self.config.saga);
        let timeout = settings
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.run_timeout());
        let concurrency = settings
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);

        let started = Instant::now();
        // Timeouts beyond what an Instant can hold leave the run unbounded.
        let deadline = started.checked_add(timeout);
        let run_token = CancellationToken::new();
        let node_token = run_token.child_token();
        self.active.insert(run_id, run_token.clone());

        let channel = CommunicationChannel::for_run(
            graph.nodes.iter().map(|n| n.id.as_str()),
            self.config.channel_capacity,
            deadline,
            node_token.clone(),
        );
        let dispatcher = Arc::new(self.dispatcher());
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let mut run = RunState::new(graph, plan, fail_fast, node_token);
        for node_id in run.plan.order.clone() {
            if done.contains(&node_id) {
                let output = run
                    .node(&node_id)
                    .and_then(|n| n.output.as_deref())
                    .and_then(|key| ctx.get(key))
                    .cloned()
                    .unwrap_or(Value::Null);
                run.set(&node_id, Slot::Succeeded);
                run.completed.push(Completed {
                    node_id: node_id.clone(),
                    output,
                    inputs: Map::new(),
                });
                self.resolve_outbound(&mut run, &ctx, &node_id);
            }
        }

        tracing::info!(
            run_id = %run_id,
            graph = %graph.name,
            nodes = graph.nodes.len(),
            fail_fast,
            saga,
            "Workflow run started"
        );
        self.sink.emit(WorkflowEvent::RunStarted {
            run_id,
            graph: graph.name.clone(),
            resumed,
        });
        self.checkpoint(&ctx).await;

        let mut workers: JoinSet<NodeReport> = JoinSet::new();
        let mut aborted: Option<String> = None;

        loop {
            if !run.halted {
                self.schedule(&mut run, &mut ctx, graph, &channel, |job| {
                    spawn_worker(&mut workers, Arc::clone(&dispatcher), Arc::clone(&semaphore), job)
                });
            }
            if workers.is_empty() {
                break;
            }

            let wake = tokio::select! {
                _ = run_token.cancelled() => Wake::Cancelled,
                _ = sleep_until_deadline(deadline) => Wake::TimedOut,
                joined = workers.join_next_with_id() => Wake::Joined(joined),
            };
            match wake {
                Wake::Joined(Some(joined)) => self.complete(&mut run, &mut ctx, joined).await,
                Wake::Joined(None) => break,
                Wake::Cancelled => {
                    aborted = Some("cancelled by request".to_string());
                    break;
                }
                Wake::TimedOut => {
                    aborted = Some(format!("run timed out after {timeout:?}"));
                    break;
                }
            }
        }

        if let Some(reason) = &aborted {
            tracing::warn!(run_id = %run_id, reason = %reason, "Workflow run aborted");
            self.sink.emit(WorkflowEvent::RunCancelled {
                run_id,
                reason: reason.clone(),
            });
            run.halted = true;
            run_token.cancel();
            while let Some(joined) = workers.join_next_with_id().await {
                self.complete(&mut run, &mut ctx, joined).await;
            }
        }
        self.active.remove(&run_id);

        let mut compensation_failures = Vec::new();
        let status = if aborted.is_none() && run.first_failure.is_none() {
            RunStatus::Succeeded
        } else if saga {
            compensation_failures = self.compensate(&run, &mut ctx).await;
            if compensation_failures.is_empty() {
                RunStatus::Compensated
            } else {
                RunStatus::Failed
            }
        } else {
            RunStatus::Failed
        };
        ctx.finish(status);
        self.checkpoint(&ctx).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            run_id = %run_id,
            graph = %graph.name,
            status = %status,
            duration_ms,
            "Workflow run finished"
        );
        self.sink.emit(WorkflowEvent::RunCompleted {
            run_id,
            graph: graph.name.clone(),
            status,
            duration_ms,
        });

        if !compensation_failures.is_empty() {
            return Err(WorkflowError::SagaCompensationFailed {
                failed: compensation_failures,
                context: Box::new(ctx),
            });
        }
        if let Some(reason) = aborted {
            return Err(WorkflowError::Cancelled {
                reason,
                context: Box::new(ctx),
            });
        }
        match run.first_failure {
            Some((node_id, reason)) => Err(WorkflowError::Execution(Box::new(
                WorkflowExecutionError {
                    run_id,
                    node_id,
                    reason,
                    context: ctx,
                },
            ))),
            None => Ok(ctx),
        }
    }

    /// Dispatch, skip or fail every pending node whose inbound edges are
    /// all resolved. One pass in topological order settles chains of skips.
    fn schedule(
        &self,
        run: &mut RunState<'_>,
        ctx: &mut ExecutionContext,
        graph: &WorkflowGraph,
        channel: &CommunicationChannel<Value>,
        mut spawn: impl FnMut(NodeJob) -> TaskId,
    ) {
        for node_id in run.plan.order.clone() {
            if run.halted {
                break;
            }
            if run.slot(&node_id) != Slot::Pending {
                continue;
            }
            let inbound = run.plan.inbound(&node_id).to_vec();
            if inbound.iter().any(|&i| run.edges[i] == EdgeState::Pending) {
                continue;
            }
            let Some(node) = run.node(&node_id) else {
                continue;
            };

            if let Some(&i) = inbound.iter().find(|&&i| run.edges[i] == EdgeState::Errored) {
                let reason = run.edge_errors.get(&i).cloned().unwrap_or_default();
                self.fail_node(run, ctx, &node_id, &NodeError::Condition(reason), 0);
                continue;
            }
            if inbound.iter().any(|&i| run.edges[i] == EdgeState::Dead) {
                self.skip_node(run, ctx, &node_id, "upstream failed", EdgeState::Dead);
                continue;
            }
            if !inbound.is_empty() && !inbound.iter().any(|&i| run.edges[i] == EdgeState::Fired) {
                self.skip_node(run, ctx, &node_id, "no viable predecessor", EdgeState::Pruned);
                continue;
            }
            if let Some(condition) = &node.condition {
                match self.conditions.evaluate(condition, ctx, &self.registry) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.skip_node(run, ctx, &node_id, "condition not met", EdgeState::Pruned);
                        continue;
                    }
                    Err(e) => {
                        self.fail_node(run, ctx, &node_id, &NodeError::Condition(e.to_string()), 0);
                        continue;
                    }
                }
            }

            let inputs = match resolve_inputs(node, ctx) {
                Ok(inputs) => inputs,
                Err(e) => {
                    self.fail_node(run, ctx, &node_id, &e, 0);
                    continue;
                }
            };
            let action_target = node
                .action
                .as_ref()
                .and_then(|action| ctx.get(&action.target_key).cloned());

            run.set(&node_id, Slot::Running);
            run.inputs.insert(node_id.clone(), inputs.clone());
            let task = spawn(NodeJob {
                run_id: ctx.run_id,
                node: node.clone(),
                inputs,
                action_target,
                permitted_effects: graph.permitted_effects.clone(),
                snapshot: Arc::new(ctx.clone()),
                channel: channel.clone(),
                cancel: run.node_token.clone(),
            });
            run.tasks.insert(task, node_id);
        }
    }

    /// Record a worker's report and resolve what it unblocks.
    async fn complete(
        &self,
        run: &mut RunState<'_>,
        ctx: &mut ExecutionContext,
        joined: Joined,
    ) {
        if let Err(e) = &joined {
            tracing::error!(run_id = %ctx.run_id, error = %e, "Node worker died");
        }
        let Some(report) = report_from_join(&mut run.tasks, joined) else {
            return;
        };
        let node_id = report.node_id;
        let inputs = run.inputs.remove(&node_id).unwrap_or_default();
        let output_key = run.node(&node_id).and_then(|n| n.output.as_deref());

        let outcome = report.result.and_then(|value| {
            if let Some(key) = output_key {
                ctx.set(key, value.clone())?;
            }
            Ok(value)
        });

        match outcome {
            Ok(output) => {
                run.set(&node_id, Slot::Succeeded);
                ctx.record(
                    HistoryEntry::new(&node_id, NodeStatus::Succeeded).with_attempts(report.attempts),
                );
                tracing::info!(
                    run_id = %ctx.run_id,
                    node_id = %node_id,
                    attempts = report.attempts,
                    duration_ms = report.duration.as_millis() as u64,
                    "Node completed"
                );
                self.sink.emit(WorkflowEvent::NodeCompleted {
                    run_id: ctx.run_id,
                    node_id: node_id.clone(),
                    attempts: report.attempts,
                    duration_ms: report.duration.as_millis() as u64,
                });
                run.completed.push(Completed {
                    node_id: node_id.clone(),
                    output,
                    inputs,
                });
                self.advance(run, ctx, &node_id);
            }
            Err(NodeError::Cancelled) => {
                run.set(&node_id, Slot::Cancelled);
                ctx.record(
                    HistoryEntry::new(&node_id, NodeStatus::Cancelled)
                        .with_reason("run cancelled")
                        .with_attempts(report.attempts),
                );
                tracing::debug!(run_id = %ctx.run_id, node_id = %node_id, "Node cancelled");
                run.mark_outbound(&node_id, EdgeState::Dead);
            }
            Err(error) => self.fail_node(run, ctx, &node_id, &error, report.attempts),
        }
        self.checkpoint(ctx).await;
    }

    /// Follow a succeeded node's edges: a firing loop edge re-enters its
    /// body; otherwise the forward edges are resolved.
    fn advance(&self, run: &mut RunState<'_>, ctx: &mut ExecutionContext, node_id: &str) {
        let loops: Vec<usize> = run
            .plan
            .outbound(node_id)
            .iter()
            .copied()
            .filter(|&i| run.plan.edges[i].is_loop())
            .collect();

        for i in loops {
            let edge = run.plan.edges[i].clone();
            let fires = match &edge.condition {
                None => Ok(true),
                Some(condition) => self.conditions.evaluate(condition, ctx, &self.registry),
            };
            match fires {
                Ok(false) => continue,
                Ok(true) => {
                    self.reenter(run, ctx, i, node_id);
                    return;
                }
                Err(e) => {
                    let error = NodeError::Condition(e.to_string());
                    self.fail_loop(run, ctx, node_id, &edge.to, &error);
                    return;
                }
            }
        }
        self.resolve_outbound(run, ctx, node_id);
    }

    fn resolve_outbound(&self, run: &mut RunState<'_>, ctx: &ExecutionContext, node_id: &str) {
        for &i in run.plan.outbound(node_id) {
            let edge = &run.plan.edges[i];
            if edge.is_loop() {
                continue;
            }
            run.edges[i] = match &edge.condition {
                None => EdgeState::Fired,
                Some(condition) => match self.conditions.evaluate(condition, ctx, &self.registry) {
                    Ok(true) => EdgeState::Fired,
                    Ok(false) => EdgeState::Pruned,
                    Err(e) => {
                        run.edge_errors.insert(i, e.to_string());
                        EdgeState::Errored
                    }
                },
            };
        }
    }

    fn reenter(&self, run: &mut RunState<'_>, ctx: &mut ExecutionContext, edge: usize, from: &str) {
        let target = run.plan.edges[edge].to.clone();
        let limit = run.plan.edges[edge].max_iterations.unwrap_or(0);
        let iteration = {
            let count = run.loop_counts.entry(edge).or_insert(0);
            *count += 1;
            *count
        };
        if iteration > limit {
            let error = NodeError::LoopLimitExceeded {
                node: target.clone(),
                limit,
            };
            self.fail_loop(run, ctx, from, &target, &error);
            return;
        }

        tracing::info!(
            run_id = %ctx.run_id,
            from = %from,
            to = %target,
            iteration,
            limit,
            "Re-entering loop"
        );
        let body = run.plan.loop_bodies.get(&edge).cloned().unwrap_or_default();
        for id in &body {
            run.set(id, Slot::Pending);
            if let Some(key) = run.node(id).and_then(|n| n.output.as_deref()) {
                ctx.reopen(key);
            }
        }
        for (i, def) in run.plan.edges.iter().enumerate() {
            if !def.is_loop() && body.contains(&def.from) {
                run.edges[i] = EdgeState::Pending;
            }
        }
    }

    /// A loop could not re-enter: the target fails and the loop source's
    /// forward edges die with it.
    fn fail_loop(
        &self,
        run: &mut RunState<'_>,
        ctx: &mut ExecutionContext,
        from: &str,
        target: &str,
        error: &NodeError,
    ) {
        self.fail_node(run, ctx, target, error, 0);
        run.mark_outbound(from, EdgeState::Dead);
    }

    fn fail_node(
        &self,
        run: &mut RunState<'_>,
        ctx: &mut ExecutionContext,
        node_id: &str,
        error: &NodeError,
        attempts: u32,
    ) {
        let reason = error.to_string();
        tracing::warn!(run_id = %ctx.run_id, node_id = %node_id, error = %reason, "Node failed");
        run.set(node_id, Slot::Failed);
        ctx.record(
            HistoryEntry::new(node_id, NodeStatus::Failed)
                .with_reason(reason.clone())
                .with_attempts(attempts),
        );
        self.sink.emit(WorkflowEvent::NodeFailed {
            run_id: ctx.run_id,
            node_id: node_id.to_string(),
            error: reason.clone(),
        });
        run.first_failure
            .get_or_insert_with(|| (node_id.to_string(), reason));
        run.mark_outbound(node_id, EdgeState::Dead);

        if run.fail_fast && !run.halted {
            tracing::info!(run_id = %ctx.run_id, node_id = %node_id, "Fail-fast: cancelling in-flight nodes");
            run.halted = true;
            run.node_token.cancel();
        }
    }

    fn skip_node(
        &self,
        run: &mut RunState<'_>,
        ctx: &mut ExecutionContext,
        node_id: &str,
        reason: &str,
        propagate: EdgeState,
    ) {
        tracing::debug!(run_id = %ctx.run_id, node_id = %node_id, reason, "Node skipped");
        run.set(node_id, Slot::Skipped);
        ctx.record(HistoryEntry::new(node_id, NodeStatus::Skipped).with_reason(reason));
        self.sink.emit(WorkflowEvent::NodeSkipped {
            run_id: ctx.run_id,
            node_id: node_id.to_string(),
            reason: reason.to_string(),
        });
        run.mark_outbound(node_id, propagate);
    }

    /// Compensate succeeded nodes in reverse completion order. Returns the
    /// nodes whose compensation failed.
    async fn compensate(&self, run: &RunState<'_>, ctx: &mut ExecutionContext) -> Vec<String> {
        let snapshot = Arc::new(ctx.clone());
        let channel: CommunicationChannel<Value> = CommunicationChannel::new(1);
        let run_id = ctx.run_id;

        let queue: Vec<Compensation> = run
            .completed
            .iter()
            .rev()
            .filter_map(|done| {
                let node = run.node(&done.node_id)?;
                let handler = Arc::clone(self.registry.handler(node.compensation.as_deref()?)?);
                let timeout = node
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.config.node_timeout());

                let mut inputs = Map::new();
                inputs.insert("output".to_string(), done.output.clone());
                inputs.insert("inputs".to_string(), Value::Object(done.inputs.clone()));
                let task_ctx = TaskContext {
                    run_id,
                    node_id: done.node_id.clone(),
                    attempt: 1,
                    snapshot: Arc::clone(&snapshot),
                    channel: channel.clone(),
                    cancel: CancellationToken::new(),
                };
                Some(Compensation {
                    name: done.node_id.clone(),
                    task: Box::pin(async move {
                        tokio::time::timeout(timeout, handler.invoke_boxed(inputs, task_ctx))
                            .await
                            .unwrap_or(Err(TaskError::Timeout(timeout)))
                    }),
                })
            })
            .collect();

        if queue.is_empty() {
            return Vec::new();
        }
        tracing::info!(run_id = %run_id, nodes = queue.len(), "Compensating completed nodes");
        SagaCoordinator::new(self.retry.clone(), Arc::clone(&self.sink))
            .compensate(ctx, queue)
            .await
    }
}

impl<S: RunStore> std::fmt::Debug for WorkflowEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("registry", &self.registry)
            .field("active_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
