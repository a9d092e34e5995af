//! Engine configuration types.
//!
//! Deserialized from `machina.toml`. Every field has a default so an empty
//! or partial file is valid.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::guardrail::GuardSpec;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Process-wide defaults for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Overall run timeout when the graph does not set one.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Per-attempt task timeout when the node does not set one.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Nodes executing concurrently within one run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Buffered messages per (sender, receiver) pair.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Event bus buffer size.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub fail_fast: bool,

    #[serde(default)]
    pub saga: bool,

    /// Retry policy for nodes without their own.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Breaker thresholds for services without an override.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-service breaker overrides.
    #[serde(default)]
    pub services: HashMap<String, CircuitBreakerConfig>,

    /// Built-in guards registered by name.
    #[serde(default)]
    pub guards: HashMap<String, GuardSpec>,
}

fn default_run_timeout_secs() -> u64 {
    1800
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_max_concurrency() -> usize {
    8
}

fn default_channel_capacity() -> usize {
    64
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout_secs(),
            node_timeout_secs: default_node_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            channel_capacity: default_channel_capacity(),
            event_capacity: default_event_capacity(),
            fail_fast: false,
            saga: false,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            services: HashMap::new(),
            guards: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}
