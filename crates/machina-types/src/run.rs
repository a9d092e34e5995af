//! Run status and history types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal or in-progress status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Compensated,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Compensated => write!(f, "compensated"),
        }
    }
}

/// Outcome recorded for a node (or saga step) in the run history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
    Compensated,
    CompensationFailed,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Compensated => write!(f, "compensated"),
            Self::CompensationFailed => write!(f, "compensation_failed"),
        }
    }
}

/// One entry in a run's history, appended in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Handler attempts consumed (0 when the handler never ran).
    #[serde(default)]
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(node_id: impl Into<String>, status: NodeStatus) -> Self {
        Self {
            node_id: node_id.into(),
            status,
            reason: None,
            attempts: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Context value partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Values private to one run.
    Run,
    /// Values seeded from outside the run and visible to every node.
    Shared,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::CompensationFailed).unwrap(),
            "\"compensation_failed\""
        );
        let status: RunStatus = serde_json::from_str("\"compensated\"").unwrap();
        assert_eq!(status, RunStatus::Compensated);
        assert!(status.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn history_entry_builder() {
        let entry = HistoryEntry::new("fetch", NodeStatus::Failed)
            .with_reason("boom")
            .with_attempts(3);
        assert_eq!(entry.node_id, "fetch");
        assert_eq!(entry.reason.as_deref(), Some("boom"));
        assert_eq!(entry.attempts, 3);
    }
}
