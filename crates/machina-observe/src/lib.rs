//! Observability for Machina: subscriber setup and an event-bus logger.

pub mod event_log;
pub mod tracing_setup;

pub use event_log::{log_event, spawn_event_logger};
pub use tracing_setup::{init_tracing, shutdown_tracing};
