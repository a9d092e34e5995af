//! Content inspection around task invocations.

pub mod guards;
pub mod pipeline;

pub use guards::build_guard;
pub use pipeline::{
    BoxGuard, GuardCheck, GuardCheckDyn, GuardError, GuardInspector, GuardSet, GuardrailViolation,
    guard_fn,
};
