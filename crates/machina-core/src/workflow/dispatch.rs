//! Single-node dispatch pipeline.
//!
//! Order per node: action guards (after the graph's effect allow-list),
//! input guards, then the handler under retry with every attempt passing
//! through the service's circuit breaker, then output guards. A BLOCK at
//! any stage fails the node without retry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use machina_types::event::WorkflowEvent;
use machina_types::graph::NodeDefinition;
use machina_types::guardrail::GuardClass;
use machina_types::resilience::RetryPolicy;

use crate::channel::CommunicationChannel;
use crate::event::SharedSink;
use crate::guardrail::{GuardInspector, GuardrailViolation};
use crate::resilience::{BreakerError, CircuitBreakerRegistry, RetryError, RetryExecutor};
use crate::task::{Classifier, TaskContext, TaskError};

use super::context::ExecutionContext;
use super::error::NodeError;
use super::registry::Registry;

/// Guard name reported when an action's effect is not in the graph's
/// allow-list.
pub const PERMITTED_EFFECTS_GUARD: &str = "permitted_effects";

/// Everything a worker needs to run one node.
pub(crate) struct NodeJob {
    pub run_id: Uuid,
    pub node: NodeDefinition,
    pub inputs: Map<String, Value>,
    /// Value at the action's target key, when one is declared.
    pub action_target: Option<Value>,
    pub permitted_effects: Option<Vec<String>>,
    pub snapshot: Arc<ExecutionContext>,
    pub channel: CommunicationChannel<Value>,
    pub cancel: CancellationToken,
}

/// Outcome handed back to the run loop.
#[derive(Debug)]
pub(crate) struct NodeReport {
    pub node_id: String,
    pub attempts: u32,
    pub duration: Duration,
    pub result: Result<Value, NodeError>,
}

/// Content handed to guards: strings as-is, everything else as JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    pub registry: Arc<Registry>,
    pub breakers: CircuitBreakerRegistry,
    pub retry: RetryExecutor,
    pub inspector: GuardInspector,
    pub classifier: Classifier,
    pub sink: SharedSink,
    pub default_policy: RetryPolicy,
    pub node_timeout: Duration,
}

impl Dispatcher {
    pub async fn dispatch(&self, job: NodeJob) -> NodeReport {
        let started = Instant::now();
        tracing::debug!(run_id = %job.run_id, node_id = %job.node.id, "Dispatching node");
        self.sink.emit(WorkflowEvent::NodeStarted {
            run_id: job.run_id,
            node_id: job.node.id.clone(),
        });

        let mut attempts = 0;
        let result = self.pipeline(&job, &mut attempts).await;
        NodeReport {
            node_id: job.node.id,
            attempts,
            duration: started.elapsed(),
            result,
        }
    }

    async fn pipeline(&self, job: &NodeJob, attempts: &mut u32) -> Result<Value, NodeError> {
        self.check_action(job).await?;
        let inputs = self.check_inputs(job).await?;
        let value = self.invoke(job, inputs, attempts).await?;
        self.check_output(job, value).await
    }

    fn blocked(&self, job: &NodeJob, violation: GuardrailViolation) -> NodeError {
        tracing::warn!(
            run_id = %job.run_id,
            node_id = %job.node.id,
            class = %violation.class,
            guard = %violation.guard,
            reason = %violation.reason,
            "Guard blocked node"
        );
        self.sink.emit(WorkflowEvent::GuardBlocked {
            run_id: job.run_id,
            node_id: job.node.id.clone(),
            class: violation.class,
            guard: violation.guard.clone(),
            reason: violation.reason.clone(),
        });
        NodeError::Guardrail(violation)
    }

    /// Run the guards named in `names` over `content`. Returns the redacted
    /// content when a guard rewrote it.
    async fn inspect(
        &self,
        job: &NodeJob,
        class: GuardClass,
        names: &[String],
        content: &str,
    ) -> Result<Option<String>, NodeError> {
        if names.is_empty() {
            return Ok(None);
        }
        let set = self.registry.guard_set(names);
        let result = self.inspector.check(content, &set).await;
        if result.is_blocked() {
            return Err(self.blocked(job, GuardrailViolation::from_result(class, &result)));
        }
        Ok(result.redacted)
    }

    async fn check_action(&self, job: &NodeJob) -> Result<(), NodeError> {
        if let (Some(action), Some(permitted)) = (&job.node.action, &job.permitted_effects) {
            if !permitted.contains(&action.effect) {
                return Err(self.blocked(
                    job,
                    GuardrailViolation {
                        class: GuardClass::Action,
                        guard: PERMITTED_EFFECTS_GUARD.to_string(),
                        reason: format!("effect '{}' is not permitted", action.effect),
                    },
                ));
            }
        }

        let names = &job.node.guards.action;
        if names.is_empty() {
            return Ok(());
        }
        // Without a declared action, action guards see the node's inputs.
        let content = match (&job.node.action, &job.action_target) {
            (Some(_), Some(target)) => render(target),
            (Some(action), None) => return Err(NodeError::MissingInput(action.target_key.clone())),
            (None, _) => Value::Object(job.inputs.clone()).to_string(),
        };
        self.inspect(job, GuardClass::Action, names, &content).await?;
        Ok(())
    }

    async fn check_inputs(&self, job: &NodeJob) -> Result<Map<String, Value>, NodeError> {
        let names = &job.node.guards.input;
        if names.is_empty() {
            return Ok(job.inputs.clone());
        }
        let content = Value::Object(job.inputs.clone()).to_string();
        match self.inspect(job, GuardClass::Input, names, &content).await? {
            None => Ok(job.inputs.clone()),
            Some(redacted) => serde_json::from_str(&redacted).map_err(|_| {
                self.blocked(
                    job,
                    GuardrailViolation {
                        class: GuardClass::Input,
                        guard: names.join(","),
                        reason: "redacted inputs are no longer valid JSON".to_string(),
                    },
                )
            }),
        }
    }

    async fn check_output(&self, job: &NodeJob, value: Value) -> Result<Value, NodeError> {
        let names = &job.node.guards.output;
        if names.is_empty() {
            return Ok(value);
        }
        let content = render(&value);
        Ok(match self.inspect(job, GuardClass::Output, names, &content).await? {
            None => value,
            Some(redacted) if value.is_string() => Value::String(redacted),
            Some(redacted) => {
                serde_json::from_str(&redacted).unwrap_or_else(|_| Value::String(redacted))
            }
        })
    }

    async fn invoke(
        &self,
        job: &NodeJob,
        inputs: Map<String, Value>,
        attempts: &mut u32,
    ) -> Result<Value, NodeError> {
        let handler = self.registry.handler(&job.node.task).cloned().ok_or_else(|| {
            NodeError::Task(TaskError::fatal(format!(
                "no handler registered for '{}'",
                job.node.task
            )))
        })?;
        let breaker = self.breakers.get(job.node.service_key());
        let policy = job.node.retry.clone().unwrap_or_else(|| self.default_policy.clone());
        let timeout = job
            .node
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.node_timeout);
        let classifier = Arc::clone(&self.classifier);

        let result = self
            .retry
            .run_classified(
                &job.node.id,
                &policy,
                |e: &BreakerError<TaskError>| match e {
                    BreakerError::Open(_) => false,
                    BreakerError::Inner(task) => classifier(task),
                },
                &job.cancel,
                |attempt| {
                    *attempts = attempt;
                    let handler = Arc::clone(&handler);
                    let breaker = Arc::clone(&breaker);
                    let cancel = job.cancel.clone();
                    let inputs = inputs.clone();
                    let ctx = TaskContext {
                        run_id: job.run_id,
                        node_id: job.node.id.clone(),
                        attempt,
                        snapshot: Arc::clone(&job.snapshot),
                        channel: job.channel.clone(),
                        cancel: job.cancel.clone(),
                    };
                    async move {
                        breaker
                            .call(
                                || async move {
                                    tokio::select! {
                                        _ = cancel.cancelled() => Err(TaskError::Cancelled),
                                        outcome = tokio::time::timeout(timeout, handler.invoke_boxed(inputs, ctx)) => {
                                            outcome.unwrap_or(Err(TaskError::Timeout(timeout)))
                                        }
                                    }
                                },
                                |e: &TaskError| !matches!(e, TaskError::Cancelled),
                            )
                            .await
                    }
                },
            )
            .await;

        result.map_err(|e| match e {
            RetryError::Exhausted {
                last: BreakerError::Open(open),
                ..
            }
            | RetryError::Fatal {
                error: BreakerError::Open(open),
                ..
            } => NodeError::CircuitOpen(open),
            RetryError::Exhausted {
                attempts,
                last: BreakerError::Inner(last),
            } if attempts > 1 => NodeError::RetryExhausted { attempts, last },
            RetryError::Exhausted {
                last: BreakerError::Inner(task),
                ..
            } => NodeError::Task(task),
            RetryError::Fatal {
                error: BreakerError::Inner(TaskError::Cancelled),
                ..
            }
            | RetryError::Cancelled { .. } => NodeError::Cancelled,
            RetryError::Fatal {
                error: BreakerError::Inner(task),
                ..
            } => NodeError::Task(task),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use machina_types::graph::ActionDeclaration;
    use machina_types::guardrail::{GuardMode, GuardSpec, GuardrailResult};
    use machina_types::resilience::{BackoffKind, CircuitBreakerConfig};
    use serde_json::json;

    use crate::event::{EventBus, NoopSink};
    use crate::guardrail::guard_fn;
    use crate::task::{default_classifier, handler_fn};

    fn dispatcher(registry: Registry, breaker: CircuitBreakerConfig) -> Dispatcher {
        Dispatcher {
            registry: Arc::new(registry),
            breakers: CircuitBreakerRegistry::new(breaker, Arc::new(NoopSink)),
            retry: RetryExecutor::default(),
            inspector: GuardInspector::new(),
            classifier: default_classifier(),
            sink: Arc::new(NoopSink),
            default_policy: RetryPolicy::new(
                3,
                Duration::from_millis(10),
                Duration::from_millis(100),
                BackoffKind::Fixed,
            ),
            node_timeout: Duration::from_secs(5),
        }
    }

    fn job(node: NodeDefinition, inputs: Value) -> NodeJob {
        let Value::Object(inputs) = inputs else {
            panic!("inputs must be an object");
        };
        NodeJob {
            run_id: Uuid::now_v7(),
            node,
            inputs,
            action_target: None,
            permitted_effects: None,
            snapshot: Arc::new(ExecutionContext::new("test")),
            channel: CommunicationChannel::new(4),
            cancel: CancellationToken::new(),
        }
    }

    fn flaky(failures: u32, calls: &Arc<AtomicU32>) -> Registry {
        let calls = Arc::clone(calls);
        Registry::new().register_handler(
            "flaky",
            handler_fn(move |_, ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if ctx.attempt <= failures {
                        Err(TaskError::transient("503"))
                    } else {
                        Ok(json!({ "attempt": ctx.attempt }))
                    }
                }
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let d = dispatcher(flaky(2, &calls), CircuitBreakerConfig::default());

        let report = d.dispatch(job(NodeDefinition::new("n", "flaky"), json!({}))).await;
        assert_eq!(report.result.unwrap(), json!({ "attempt": 3 }));
        assert_eq!(report.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_name_the_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let d = dispatcher(flaky(10, &calls), CircuitBreakerConfig::default());

        let report = d.dispatch(job(NodeDefinition::new("n", "flaky"), json!({}))).await;
        assert_eq!(
            report.result.unwrap_err(),
            NodeError::RetryExhausted {
                attempts: 3,
                last: TaskError::transient("503")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        };
        let d = dispatcher(flaky(10, &calls), breaker);

        let report = d.dispatch(job(NodeDefinition::new("n", "flaky"), json!({}))).await;
        assert!(matches!(report.result, Err(NodeError::CircuitOpen(_))));
        // Two failures trip the breaker; the third attempt is rejected.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let registry = Registry::new().register_handler(
            "slow",
            handler_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
        );
        let mut d = dispatcher(registry, CircuitBreakerConfig::default());
        d.default_policy = RetryPolicy::none();
        d.node_timeout = Duration::from_secs(1);

        let report = d.dispatch(job(NodeDefinition::new("n", "slow"), json!({}))).await;
        assert_eq!(
            report.result.unwrap_err(),
            NodeError::Task(TaskError::Timeout(Duration::from_secs(1)))
        );
    }

    #[tokio::test]
    async fn action_guard_blocks_before_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut specs = std::collections::HashMap::new();
        specs.insert(
            "domains".to_string(),
            GuardSpec::DomainPolicy {
                allowed: vec![],
                denied: vec!["evil.com".into()],
            },
        );
        let registry = flaky(0, &calls).with_guard_specs(&specs).unwrap();
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let mut d = dispatcher(registry, CircuitBreakerConfig::default());
        d.sink = Arc::new(bus);

        let mut node = NodeDefinition::new("publish", "flaky");
        node.action = Some(ActionDeclaration {
            effect: "http_post".into(),
            target_key: "page.domain".into(),
        });
        node.guards.action = vec!["domains".into()];
        let mut j = job(node, json!({}));
        j.action_target = Some(json!("evil.com"));

        let report = d.dispatch(j).await;
        match report.result.unwrap_err() {
            NodeError::Guardrail(v) => {
                assert_eq!(v.class, GuardClass::Action);
                assert_eq!(v.guard, "domains");
            }
            other => panic!("expected guard violation, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let _started = events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            WorkflowEvent::GuardBlocked { class: GuardClass::Action, .. }
        ));
    }

    #[tokio::test]
    async fn effect_outside_allow_list_is_blocked() {
        let calls = Arc::new(AtomicU32::new(0));
        let d = dispatcher(flaky(0, &calls), CircuitBreakerConfig::default());
        let mut node = NodeDefinition::new("n", "flaky");
        node.action = Some(ActionDeclaration {
            effect: "send_email".into(),
            target_key: "to".into(),
        });
        let mut j = job(node, json!({}));
        j.permitted_effects = Some(vec!["http_post".into()]);

        match d.dispatch(j).await.result.unwrap_err() {
            NodeError::Guardrail(v) => assert_eq!(v.guard, PERMITTED_EFFECTS_GUARD),
            other => panic!("expected guard violation, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn input_and_output_redaction() {
        let mut specs = std::collections::HashMap::new();
        specs.insert(
            "pii".to_string(),
            GuardSpec::Pii {
                kinds: vec![machina_types::guardrail::PiiKind::Email],
                mode: GuardMode::Redact,
            },
        );
        let registry = Registry::new()
            .register_handler(
                "echo",
                handler_fn(|inputs, _| async move {
                    Ok(json!(format!("reply to {}", inputs["from"].as_str().unwrap_or(""))))
                }),
            )
            .register_guard(
                "shout",
                guard_fn(|c| Ok(GuardrailResult::redact(c.to_uppercase(), "upper"))),
            )
            .with_guard_specs(&specs)
            .unwrap();
        let d = dispatcher(registry, CircuitBreakerConfig::default());

        let mut node = NodeDefinition::new("n", "echo");
        node.guards.input = vec!["pii".into()];
        node.guards.output = vec!["shout".into()];
        let report = d
            .dispatch(job(node, json!({ "from": "bob@example.com" })))
            .await;
        assert_eq!(report.result.unwrap(), json!("REPLY TO [REDACTED_EMAIL]"));
    }

    #[tokio::test]
    async fn cancelled_job_reports_cancelled() {
        let registry = Registry::new().register_handler(
            "wait",
            handler_fn(|_, _| std::future::pending::<Result<Value, TaskError>>()),
        );
        let d = dispatcher(registry, CircuitBreakerConfig::default());
        let j = job(NodeDefinition::new("n", "wait"), json!({}));
        let cancel = j.cancel.clone();
        let handle = tokio::spawn(async move { d.dispatch(j).await });
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap().result.unwrap_err(), NodeError::Cancelled);
    }
}
