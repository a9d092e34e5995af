//! Per-run execution context.
//!
//! `ExecutionContext` holds the values written by nodes, partitioned into a
//! run-local and a shared scope, plus the run's history in completion order.
//! Keys are write-once: a second write to the same key is an error, never a
//! partial overwrite. The engine's run loop is the only writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use machina_types::graph::SHARED_PREFIX;
use machina_types::run::{HistoryEntry, NodeStatus, RunStatus, Scope};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("context key '{0}' was already written in this run")]
    AlreadyWritten(String),

    #[error("invalid context key '{0}'")]
    InvalidKey(String),

    #[error("context serialization failed: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// State accumulated by one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub graph: String,
    pub status: RunStatus,
    #[serde(default)]
    values: Map<String, Value>,
    #[serde(default)]
    shared: Map<String, Value>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Split a key into its scope and the bare name.
pub fn parse_key(key: &str) -> (Scope, &str) {
    match key.strip_prefix(SHARED_PREFIX) {
        Some(rest) => (Scope::Shared, rest),
        None => (Scope::Run, key),
    }
}

impl ExecutionContext {
    /// Fresh context for a run of `graph`.
    pub fn new(graph: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            graph: graph.into(),
            status: RunStatus::Running,
            values: Map::new(),
            shared: Map::new(),
            history: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Seed a value before the run starts. Seeded keys count as written.
    pub fn with_value(mut self, key: impl AsRef<str>, value: Value) -> Self {
        let (scope, name) = parse_key(key.as_ref());
        self.scope_mut(scope).insert(name.to_string(), value);
        self
    }

    /// Seed a shared-scope value.
    pub fn with_shared(mut self, key: impl Into<String>, value: Value) -> Self {
        self.shared.insert(key.into(), value);
        self
    }

    fn scope(&self, scope: Scope) -> &Map<String, Value> {
        match scope {
            Scope::Run => &self.values,
            Scope::Shared => &self.shared,
        }
    }

    fn scope_mut(&mut self, scope: Scope) -> &mut Map<String, Value> {
        match scope {
            Scope::Run => &mut self.values,
            Scope::Shared => &mut self.shared,
        }
    }

    /// Write `value` under `key` exactly once.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ContextError> {
        let (scope, name) = parse_key(key);
        if name.is_empty() || name.contains('.') {
            return Err(ContextError::InvalidKey(key.to_string()));
        }
        if self.scope(scope).contains_key(name) {
            return Err(ContextError::AlreadyWritten(key.to_string()));
        }

        self.scope_mut(scope).insert(name.to_string(), value);
        Ok(())
    }

    /// Remove a written key so a loop iteration can write it again.
    pub fn reopen(&mut self, key: &str) -> Option<Value> {
        let (scope, name) = parse_key(key);
        self.scope_mut(scope).remove(name)
    }

    /// Resolve `key`, following dotted paths into objects and arrays.
    ///
    /// Unprefixed keys look in the run scope first, then the shared scope.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let (scope, path) = parse_key(key);
        let mut segments = path.split('.');
        let head = segments.next()?;

        let root = match scope {
            Scope::Shared => self.shared.get(head),
            Scope::Run => self.values.get(head).or_else(|| self.shared.get(head)),
        }?;

        segments.try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn shared_values(&self) -> &Map<String, Value> {
        &self.shared
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Latest history entry for `node_id`.
    pub fn latest(&self, node_id: &str) -> Option<&HistoryEntry> {
        self.history.iter().rev().find(|e| e.node_id == node_id)
    }

    /// Position of the last entry with `status` for `node_id`.
    pub fn position(&self, node_id: &str, status: NodeStatus) -> Option<usize> {
        self.history
            .iter()
            .rposition(|e| e.node_id == node_id && e.status == status)
    }

    /// Mark the run terminal.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    // -----------------------------------------------------------------------
    // Views and serialization
    // -----------------------------------------------------------------------

    /// JSON object conditions are evaluated against.
    ///
    /// Shape: shared values at the top level, run values layered over them,
    /// and the shared scope again under `shared`.
    /// ```json
    /// { "<key>": <value>, ..., "shared": { ... }, "run": { "id": "...", "graph": "..." } }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        let mut root = self.shared.clone();
        for (key, value) in &self.values {
            root.insert(key.clone(), value.clone());
        }
        root.insert("shared".to_string(), Value::Object(self.shared.clone()));
        root.insert(
            "run".to_string(),
            serde_json::json!({ "id": self.run_id.to_string(), "graph": self.graph }),
        );
        Value::Object(root)
    }

    pub fn to_json(&self) -> Result<String, ContextError> {
        serde_json::to_string(self).map_err(|e| ContextError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, ContextError> {
        serde_json::from_str(json).map_err(|e| ContextError::Serialization(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
