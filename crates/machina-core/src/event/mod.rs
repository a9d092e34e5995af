//! Event distribution for workflow, resilience and guard events.
//!
//! Components emit through the [`EventSink`] trait; [`EventBus`] is the
//! default sink and fans events out to broadcast subscribers.

pub mod bus;
pub mod sink;

pub use bus::{EventBus, RunEvents};
pub use sink::{EventSink, NoopSink, SharedSink};
