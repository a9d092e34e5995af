//! Shared domain types for the machina workflow core.
//!
//! Graph definitions, run history, resilience policies, guardrail results,
//! events and engine configuration. Everything here is plain serializable
//! data so graphs and snapshots can be stored and reloaded.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod guardrail;
pub mod resilience;
pub mod run;
