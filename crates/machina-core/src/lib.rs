//! Workflow execution core for Machina.
//!
//! Defines the run engine and the resilience and guardrail primitives it is
//! built from, plus the `RunStore` port that the infrastructure layer
//! implements. Depends only on `machina-types`, never on `machina-infra` or
//! any database crate.

pub mod channel;
pub mod event;
pub mod guardrail;
pub mod repository;
pub mod resilience;
pub mod task;
pub mod workflow;
