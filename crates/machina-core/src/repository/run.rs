//! Run snapshot storage.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use machina_types::error::RepositoryError;

use crate::workflow::context::ExecutionContext;

/// Persists run snapshots so interrupted runs can be resumed.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunStore: Send + Sync {
    /// Latest snapshot for `run_id`, if one was saved.
    fn load(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<ExecutionContext>, RepositoryError>> + Send;

    /// Upsert the snapshot for `context.run_id`.
    fn save(&self, context: &ExecutionContext)
    -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a snapshot. Returns `true` if it existed.
    fn delete(&self, run_id: &Uuid) -> impl Future<Output = Result<bool, RepositoryError>> + Send;
}

/// Process-local store. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<DashMap<Uuid, ExecutionContext>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl RunStore for InMemoryRunStore {
    async fn load(&self, run_id: &Uuid) -> Result<Option<ExecutionContext>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, context: &ExecutionContext) -> Result<(), RepositoryError> {
        self.runs.insert(context.run_id, context.clone());
        Ok(())
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.runs.remove(run_id).is_some())
    }
}
