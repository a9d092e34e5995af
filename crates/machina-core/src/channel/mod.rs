//! Message relay between nodes executing within the same run.
//!
//! Every (sender, receiver) pair has its own bounded buffer. Sending returns
//! as soon as the pair's buffer has room and waits once it is full, so a
//! stalled receiver applies backpressure instead of growing memory.
//! Messages from one sender to one receiver arrive in FIFO order; nothing is
//! promised across distinct senders.
//!
//! Receivers block until a message arrives, the run deadline passes or the
//! run is cancelled.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default buffered messages per (sender, receiver) pair.
pub const DEFAULT_PAIR_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("node '{0}' is not part of this run")]
    UnknownNode(String),

    #[error("channel timed out for node '{0}'")]
    Timeout(String),

    #[error("buffer from '{from}' to '{to}' is full")]
    Full { from: String, to: String },

    #[error("channel closed by run cancellation")]
    Cancelled,
}

/// A delivered message with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    pub from: String,
    pub to: String,
    pub payload: M,
}

struct Mailbox<M> {
    queue: Mutex<VecDeque<Envelope<M>>>,
    arrived: Notify,
    /// Free slots per sender.
    credits: DashMap<String, Arc<Semaphore>>,
}

impl<M> Mailbox<M> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            credits: DashMap::new(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Envelope<M>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn credits_for(&self, from: &str, capacity: usize) -> Arc<Semaphore> {
        Arc::clone(
            self.credits
                .entry(from.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(capacity)))
                .value(),
        )
    }

    fn pop(&self) -> Option<Envelope<M>> {
        let envelope = self.queue().pop_front()?;
        if let Some(credits) = self.credits.get(&envelope.from) {
            credits.add_permits(1);
        }
        Some(envelope)
    }
}

struct ChannelInner<M> {
    mailboxes: DashMap<String, Arc<Mailbox<M>>>,
    capacity: usize,
    /// When set, only registered nodes may send or receive.
    closed_membership: bool,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

/// Typed per-run message relay. Cloning shares the same mailboxes.
pub struct CommunicationChannel<M> {
    inner: Arc<ChannelInner<M>>,
}

impl<M> Clone for CommunicationChannel<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> std::fmt::Debug for CommunicationChannel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationChannel")
            .field("nodes", &self.inner.mailboxes.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl<M: Send + 'static> CommunicationChannel<M> {
    /// Open channel: mailboxes are created on first use.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, false, None, CancellationToken::new())
    }

    /// Channel restricted to `nodes`, bounded by the run's deadline and
    /// cancellation.
    pub fn for_run<'a>(
        nodes: impl IntoIterator<Item = &'a str>,
        capacity: usize,
        deadline: Option<Instant>,
        cancel: CancellationToken,
    ) -> Self {
        let channel = Self::build(capacity, true, deadline, cancel);
        for node in nodes {
            channel
                .inner
                .mailboxes
                .insert(node.to_string(), Arc::new(Mailbox::new()));
        }
        channel
    }

    fn build(
        capacity: usize,
        closed_membership: bool,
        deadline: Option<Instant>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                mailboxes: DashMap::new(),
                capacity: capacity.max(1),
                closed_membership,
                deadline,
                cancel,
            }),
        }
    }

    fn mailbox(&self, node: &str) -> Result<Arc<Mailbox<M>>, ChannelError> {
        if let Some(existing) = self.inner.mailboxes.get(node) {
            return Ok(Arc::clone(existing.value()));
        }
        if self.inner.closed_membership {
            return Err(ChannelError::UnknownNode(node.to_string()));
        }
        Ok(Arc::clone(
            self.inner
                .mailboxes
                .entry(node.to_string())
                .or_insert_with(|| Arc::new(Mailbox::new()))
                .value(),
        ))
    }

    fn check_sender(&self, from: &str) -> Result<(), ChannelError> {
        if self.inner.closed_membership && !self.inner.mailboxes.contains_key(from) {
            return Err(ChannelError::UnknownNode(from.to_string()));
        }
        Ok(())
    }

    /// Queue `payload` for `to`. Returns immediately while the pair's buffer
    /// has room; waits for the receiver to drain it otherwise.
    pub async fn send(&self, from: &str, to: &str, payload: M) -> Result<(), ChannelError> {
        self.check_sender(from)?;
        let mailbox = self.mailbox(to)?;
        let credits = mailbox.credits_for(from, self.inner.capacity);

        let permit = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(ChannelError::Cancelled),
            _ = sleep_until_deadline(self.inner.deadline) => {
                return Err(ChannelError::Timeout(to.to_string()));
            }
            permit = credits.acquire_owned() => permit.map_err(|_| ChannelError::Cancelled)?,
        };
        permit.forget();

        self.deliver(&mailbox, from, to, payload);
        Ok(())
    }

    /// Queue `payload` for `to` without waiting; fails when the buffer is full.
    pub fn try_send(&self, from: &str, to: &str, payload: M) -> Result<(), ChannelError> {
        self.check_sender(from)?;
        let mailbox = self.mailbox(to)?;
        let credits = mailbox.credits_for(from, self.inner.capacity);
        match credits.try_acquire_owned() {
            Ok(permit) => permit.forget(),
            Err(_) => {
                return Err(ChannelError::Full {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }
        self.deliver(&mailbox, from, to, payload);
        Ok(())
    }

    fn deliver(&self, mailbox: &Mailbox<M>, from: &str, to: &str, payload: M) {
        mailbox.queue().push_back(Envelope {
            from: from.to_string(),
            to: to.to_string(),
            payload,
        });
        mailbox.arrived.notify_one();
        tracing::trace!(from, to, "Message queued");
    }

    /// Wait for the next message addressed to `node`.
    pub async fn receive(&self, node: &str) -> Result<Envelope<M>, ChannelError> {
        self.receive_until(node, self.inner.deadline).await
    }

    /// Like [`receive`](Self::receive) with a tighter bound than the run
    /// deadline.
    pub async fn receive_timeout(
        &self,
        node: &str,
        timeout: Duration,
    ) -> Result<Envelope<M>, ChannelError> {
        // A timeout too large to represent means no local bound.
        let local = Instant::now().checked_add(timeout);
        let deadline = match (self.inner.deadline, local) {
            (Some(run), Some(local)) => Some(run.min(local)),
            (run, local) => run.or(local),
        };
        self.receive_until(node, deadline).await
    }

    async fn receive_until(
        &self,
        node: &str,
        deadline: Option<Instant>,
    ) -> Result<Envelope<M>, ChannelError> {
        let mailbox = self.mailbox(node)?;
        loop {
            if let Some(envelope) = mailbox.pop() {
                return Ok(envelope);
            }
            tokio::select! {
                _ = mailbox.arrived.notified() => {}
                _ = self.inner.cancel.cancelled() => return Err(ChannelError::Cancelled),
                _ = sleep_until_deadline(deadline) => {
                    return Err(ChannelError::Timeout(node.to_string()));
                }
            }
        }
    }

    /// Messages currently buffered for `node`.
    pub fn pending(&self, node: &str) -> usize {
        self.inner
            .mailboxes
            .get(node)
            .map(|m| m.queue().len())
            .unwrap_or(0)
    }
}

impl<M: Clone + Send + 'static> CommunicationChannel<M> {
    /// Send `payload` to every known node except `from`. Returns the number
    /// of recipients.
    pub async fn broadcast(&self, from: &str, payload: M) -> Result<usize, ChannelError> {
        self.check_sender(from)?;
        let mut targets: Vec<String> = self
            .inner
            .mailboxes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|node| node != from)
            .collect();
        targets.sort();

        for target in &targets {
            self.send(from, target, payload.clone()).await?;
        }
        Ok(targets.len())
    }
}

/// Sleep until `deadline`; forever when there is none.
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
