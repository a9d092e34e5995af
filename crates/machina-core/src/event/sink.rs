//! Injected sink for structured events.

use std::sync::Arc;

use machina_types::event::WorkflowEvent;

/// Receiver of structured events. Format and transport are the
/// implementor's concern; `emit` must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkflowEvent);
}

/// Shared handle passed to every component that emits events.
pub type SharedSink = Arc<dyn EventSink>;

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: WorkflowEvent) {}
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: WorkflowEvent) {
        (**self).emit(event)
    }
}
