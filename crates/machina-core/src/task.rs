//! Task handler capability.
//!
//! Follows the same object-safety pattern used across the crate:
//! 1. `TaskHandler` uses native async fn in traits (RPITIT).
//! 2. `TaskHandlerDyn` is the object-safe twin with boxed futures.
//! 3. A blanket impl bridges every `TaskHandler` to `TaskHandlerDyn`, so the
//!    registry can store `Arc<dyn TaskHandlerDyn>`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{ChannelError, CommunicationChannel, Envelope};
use crate::workflow::context::ExecutionContext;

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// Failure reported by a task handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl TaskError {
    pub fn transient(message: impl std::fmt::Display) -> Self {
        Self::Transient(message.to_string())
    }

    pub fn fatal(message: impl std::fmt::Display) -> Self {
        Self::Fatal(message.to_string())
    }

    /// Default classification: transient faults and timeouts retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient(_) | TaskError::Timeout(_))
    }
}

/// Decides whether a task error is worth another attempt.
pub type Classifier = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

pub fn default_classifier() -> Classifier {
    Arc::new(TaskError::is_retryable)
}

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// Per-invocation view handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: Uuid,
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Read-only context snapshot taken at dispatch.
    pub snapshot: Arc<ExecutionContext>,
    pub channel: CommunicationChannel<Value>,
    /// Fires when the run is cancelled or the node times out.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Send a message to another node of the same run.
    pub async fn send(&self, to: &str, payload: Value) -> Result<(), TaskError> {
        Ok(self.channel.send(&self.node_id, to, payload).await?)
    }

    pub async fn broadcast(&self, payload: Value) -> Result<usize, TaskError> {
        Ok(self.channel.broadcast(&self.node_id, payload).await?)
    }

    /// Wait for the next message addressed to this node.
    pub async fn receive(&self) -> Result<Envelope<Value>, TaskError> {
        Ok(self.channel.receive(&self.node_id).await?)
    }
}

// ---------------------------------------------------------------------------
// TaskHandler
// ---------------------------------------------------------------------------

/// External unit of work invoked by the engine.
///
/// Errors are classified as retryable or fatal by the engine's classifier.
pub trait TaskHandler: Send + Sync + 'static {
    fn invoke(
        &self,
        inputs: Map<String, Value>,
        ctx: TaskContext,
    ) -> impl Future<Output = Result<Value, TaskError>> + Send;
}

/// Object-safe version of [`TaskHandler`] with boxed futures.
pub trait TaskHandlerDyn: Send + Sync {
    fn invoke_boxed(
        &self,
        inputs: Map<String, Value>,
        ctx: TaskContext,
    ) -> BoxFuture<'_, Result<Value, TaskError>>;
}

impl<T: TaskHandler> TaskHandlerDyn for T {
    fn invoke_boxed(
        &self,
        inputs: Map<String, Value>,
        ctx: TaskContext,
    ) -> BoxFuture<'_, Result<Value, TaskError>> {
        Box::pin(self.invoke(inputs, ctx))
    }
}

/// Type-erased handler stored in the registry.
pub type BoxTaskHandler = Arc<dyn TaskHandlerDyn>;

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as a task handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Map<String, Value>, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    FnHandler(f)
}

impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    fn invoke(
        &self,
        inputs: Map<String, Value>,
        ctx: TaskContext,
    ) -> impl Future<Output = Result<Value, TaskError>> + Send {
        (self.0)(inputs, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_context() -> TaskContext {
        TaskContext {
            run_id: Uuid::now_v7(),
            node_id: "a".to_string(),
            attempt: 1,
            snapshot: Arc::new(ExecutionContext::new("test")),
            channel: CommunicationChannel::new(4),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn default_classification() {
        let classify = default_classifier();
        assert!(classify(&TaskError::transient("503")));
        assert!(classify(&TaskError::Timeout(Duration::from_secs(1))));
        assert!(!classify(&TaskError::fatal("bad request")));
        assert!(!classify(&TaskError::Cancelled));
        assert!(!classify(&TaskError::Channel(ChannelError::Cancelled)));
    }

    #[tokio::test]
    async fn closure_handler_through_dyn() {
        let handler: BoxTaskHandler = Arc::new(handler_fn(|inputs, ctx| async move {
            Ok(json!({ "node": ctx.node_id, "echo": inputs.get("x").cloned() }))
        }));

        let mut inputs = Map::new();
        inputs.insert("x".to_string(), json!(1));
        let out = handler.invoke_boxed(inputs, task_context()).await.unwrap();
        assert_eq!(out, json!({ "node": "a", "echo": 1 }));
    }

    #[tokio::test]
    async fn context_messaging_round_trip() {
        let ctx = task_context();
        let mut peer = ctx.clone();
        peer.node_id = "b".to_string();

        ctx.send("b", json!("ping")).await.unwrap();
        let envelope = peer.receive().await.unwrap();
        assert_eq!(envelope.from, "a");
        assert_eq!(envelope.payload, json!("ping"));
    }
}
