//! Retry executor with exponential backoff and jitter.
//!
//! The delay schedule is a pure function of the policy and attempt number
//! ([`Backoff`]), so it can be checked without sleeping. [`RetryExecutor`]
//! drives an operation through that schedule, retrying only errors the
//! caller classifies as transient.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use machina_types::event::WorkflowEvent;
use machina_types::resilience::{BackoffKind, RetryPolicy};

use crate::event::{NoopSink, SharedSink};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error; carries the last one.
    #[error("retry exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// A non-retryable error; propagated without further attempts.
    #[error("{error}")]
    Fatal { attempts: u32, error: E },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Attempts consumed before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Fatal { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    /// The underlying error, if the operation produced one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Fatal { error, .. } => Some(error),
            RetryError::Cancelled { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff schedule
// ---------------------------------------------------------------------------

/// `min(max, base * 2^(attempt-1))` for a 1-based attempt number.
pub fn exponential_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let millis = policy.base_delay_ms.saturating_mul(factor);
    Duration::from_millis(millis.min(policy.max_delay_ms))
}

/// Stateful delay generator; decorrelated jitter depends on the previous
/// delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    previous: Duration,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            policy: policy.clone(),
            previous: policy.base_delay(),
        }
    }

    /// Delay to wait after the failed `attempt` (1-based).
    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let delay = match self.policy.backoff {
            BackoffKind::Fixed => self.policy.base_delay(),
            BackoffKind::Exponential => exponential_delay(&self.policy, attempt),
            BackoffKind::FullJitter => {
                let cap = exponential_delay(&self.policy, attempt).as_millis() as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
            }
            BackoffKind::DecorrelatedJitter => {
                let low = self.policy.base_delay_ms;
                let high = (self.previous.as_millis() as u64).saturating_mul(3).max(low);
                let millis = rand::thread_rng().gen_range(low..=high);
                Duration::from_millis(millis.min(self.policy.max_delay_ms))
            }
        };
        self.previous = delay;
        delay
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Counters accumulated by one executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryMetrics {
    pub calls: u64,
    pub attempts: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub fatal: u64,
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    fatal: AtomicU64,
}

// ---------------------------------------------------------------------------
// RetryExecutor
// ---------------------------------------------------------------------------

/// Runs operations under a [`RetryPolicy`]. Cheap to clone; clones share
/// metrics and sink.
#[derive(Clone)]
pub struct RetryExecutor {
    sink: SharedSink,
    counters: Arc<Counters>,
}

impl RetryExecutor {
    pub fn new(sink: SharedSink) -> Self {
        Self {
            sink,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Run `op`, treating every error as retryable.
    pub async fn run<T, E, F, Fut>(&self, policy: &RetryPolicy, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_classified("operation", policy, |_| true, &CancellationToken::new(), op)
            .await
    }

    /// Run `op` up to `policy.max_attempts` times.
    ///
    /// `op` receives the 1-based attempt number. Errors for which
    /// `is_retryable` returns false propagate immediately as
    /// [`RetryError::Fatal`]. Backoff waits end early with
    /// [`RetryError::Cancelled`] when `cancel` fires.
    pub async fn run_classified<T, E, F, Fut, C>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        is_retryable: C,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: Display,
    {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        let max_attempts = policy.max_attempts.max(1);
        let mut backoff = Backoff::new(policy);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !is_retryable(&error) {
                self.counters.fatal.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(operation, attempt, error = %error, "Non-retryable error");
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    error,
                });
            }

            if attempt >= max_attempts {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(operation, attempts = attempt, error = %error, "Retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = backoff.next_delay(attempt);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                operation,
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient error"
            );
            self.sink.emit(WorkflowEvent::RetryAttempt {
                operation: operation.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            calls: self.counters.calls.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            fatal: self.counters.fatal.load(Ordering::Relaxed),
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(Arc::new(NoopSink))
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("metrics", &self.metrics())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use crate::event::EventBus;

    fn policy(kind: BackoffKind, max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_secs(5),
            kind,
        )
    }

    // -----------------------------------------------------------------------
    // Backoff schedule
    // -----------------------------------------------------------------------

    #[test]
    fn exponential_doubles_and_caps() {
        let p = policy(BackoffKind::Exponential, 10);
        let mut backoff = Backoff::new(&p);
        let delays: Vec<u64> = (1..=8)
            .map(|a| backoff.next_delay(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
    }

    #[test]
    fn exponential_survives_huge_attempts() {
        let p = policy(BackoffKind::Exponential, 10);
        assert_eq!(exponential_delay(&p, 200), Duration::from_secs(5));
    }

    #[test]
    fn fixed_is_constant() {
        let p = policy(BackoffKind::Fixed, 10);
        let mut backoff = Backoff::new(&p);
        for attempt in 1..6 {
            assert_eq!(backoff.next_delay(attempt), Duration::from_millis(100));
        }
    }

    #[test]
    fn full_jitter_within_exponential_bound() {
        let p = policy(BackoffKind::FullJitter, 10);
        let mut backoff = Backoff::new(&p);
        for _ in 0..50 {
            for attempt in 1..=8 {
                let delay = backoff.next_delay(attempt);
                assert!(delay <= exponential_delay(&p, attempt), "attempt {attempt}: {delay:?}");
            }
        }
    }

    #[test]
    fn decorrelated_jitter_bounds() {
        let p = policy(BackoffKind::DecorrelatedJitter, 10);
        let mut backoff = Backoff::new(&p);
        let mut previous = p.base_delay();
        for attempt in 1..=30 {
            let delay = backoff.next_delay(attempt);
            assert!(delay >= p.base_delay().min(p.max_delay()));
            assert!(delay <= p.max_delay());
            assert!(delay <= (previous * 3).max(p.base_delay()));
            previous = delay;
        }
    }

    // -----------------------------------------------------------------------
    // Executor
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let executor = RetryExecutor::default();
        let calls = AtomicU32::new(0);

        let result = executor
            .run(&policy(BackoffKind::Exponential, 3), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("flaky {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let metrics = executor.metrics();
        assert_eq!(metrics.attempts, 3);
        assert_eq!(metrics.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_carries_last_error() {
        let executor = RetryExecutor::default();
        let result: Result<(), _> = executor
            .run(&policy(BackoffKind::Fixed, 4), |attempt| async move {
                Err(format!("fail {attempt}"))
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last, "fail 4");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(executor.metrics().exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_do_not_consume_attempts() {
        let executor = RetryExecutor::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .run_classified(
                "guarded",
                &policy(BackoffKind::Exponential, 5),
                |e: &String| !e.starts_with("fatal"),
                &CancellationToken::new(),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal: blocked".to_string()) }
                },
            )
            .await;

        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.metrics().fatal, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let long = RetryPolicy::new(
            5,
            Duration::from_secs(60),
            Duration::from_secs(60),
            BackoffKind::Fixed,
        );
        let handle = tokio::spawn(async move {
            executor
                .run_classified("slow", &long, |_| true, &cancel, |_| async {
                    Err::<(), _>("transient")
                })
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_emitted_as_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let executor = RetryExecutor::new(Arc::new(bus));

        let _: Result<(), _> = executor
            .run(&policy(BackoffKind::Exponential, 2), |_| async { Err("boom") })
            .await;

        match rx.recv().await.unwrap() {
            WorkflowEvent::RetryAttempt {
                attempt, delay_ms, error, ..
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, 100);
                assert_eq!(error, "boom");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
