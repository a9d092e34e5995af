//! Broadcast fan-out of [`WorkflowEvent`]s.
//!
//! Every subscriber sees every event published after it subscribed. A slow
//! subscriber that falls more than `capacity` events behind loses the oldest
//! ones and is told how many it missed; producers never wait.

use machina_types::config::EngineConfig;
use machina_types::event::WorkflowEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::sink::EventSink;

/// Cloneable handle over one broadcast channel. Clones publish into and
/// subscribe to the same stream.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Bus sized by `config.event_capacity`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.event_capacity)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single run. Process-scoped events
    /// (retries, circuit transitions) are included since they cannot be
    /// attributed to one run.
    pub fn subscribe_run(&self, run_id: Uuid) -> RunEvents {
        RunEvents {
            run_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Returns how many subscribers received the event; zero when nobody
    /// is listening.
    pub fn publish(&self, event: WorkflowEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: WorkflowEvent) {
        self.publish(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiver filtered to one run. See [`EventBus::subscribe_run`].
#[derive(Debug)]
pub struct RunEvents {
    run_id: Uuid,
    receiver: broadcast::Receiver<WorkflowEvent>,
}

impl RunEvents {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next event for this run. Lagging skips ahead with a warning;
    /// `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.run_id().is_none_or(|id| id == self.run_id) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(run_id = %self.run_id, skipped, "Run event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Drain events until this run's `RunCompleted`, inclusive.
    pub async fn until_completed(mut self) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            let done = matches!(event, WorkflowEvent::RunCompleted { .. });
            events.push(event);
            if done {
                break;
            }
        }
        events
    }
}
