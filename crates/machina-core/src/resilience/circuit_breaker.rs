//! Per-service circuit breaker.
//!
//! Implements a 3-state circuit breaker pattern:
//! - **Closed**: Normal operation, calls pass through.
//! - **Open**: Service is failing, calls are rejected without invoking it.
//! - **HalfOpen**: Cooldown elapsed, a limited number of trial calls probe
//!   whether the service recovered.
//!
//! Every breaker guards its state with its own lock so transitions are
//! linearizable with respect to concurrent callers. Breakers live in a
//! [`CircuitBreakerRegistry`] created once per process and handed to the
//! engine at construction.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;

use machina_types::event::WorkflowEvent;
use machina_types::resilience::{
    CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitMetrics, CircuitState,
};

use crate::event::{NoopSink, SharedSink};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A call was rejected because the circuit is open (or half-open with all
/// trial slots taken). The downstream service was not invoked.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("circuit open for service '{service}'")]
pub struct CircuitOpenError {
    pub service: String,
    /// Time left until trial calls are admitted, when known.
    pub retry_after: Option<Duration>,
}

/// Error from [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),

    #[error("{0}")]
    Inner(E),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { in_flight: u32 },
}

impl BreakerState {
    fn label(&self) -> CircuitState {
        match self {
            BreakerState::Closed => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Bumped on every transition; permits from an older epoch only count
    /// toward metrics.
    epoch: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_transition: DateTime<Utc>,
    metrics: CircuitMetrics,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            epoch: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_transition: Utc::now(),
            metrics: CircuitMetrics::default(),
        }
    }

    fn transition(&mut self, to: BreakerState) -> (CircuitState, CircuitState) {
        let from = self.state.label();
        self.state = to;
        self.epoch += 1;
        self.consecutive_successes = 0;
        if matches!(to, BreakerState::Closed) {
            self.consecutive_failures = 0;
        }
        self.last_transition = Utc::now();
        (from, to.label())
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Circuit breaker for one downstream service key.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    sink: SharedSink,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig, sink: SharedSink) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            sink,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state label. Does not perform the lazy OPEN -> HALF_OPEN
    /// transition; that happens on the next call.
    pub fn state(&self) -> CircuitState {
        self.lock().state.label()
    }

    /// Admit a call or reject it with [`CircuitOpenError`].
    ///
    /// The returned permit must be settled with [`CallPermit::success`] or
    /// [`CallPermit::failure`]. Dropping it unsettled (cancellation) frees
    /// any trial slot without counting as a failure.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let mut inner = self.lock();
        inner.metrics.total_calls += 1;

        let mut transitioned = None;
        let state = inner.state;
        if let BreakerState::Open { opened_at } = state {
            let elapsed = opened_at.elapsed();
            if elapsed >= self.config.open_duration() {
                transitioned = Some(inner.transition(BreakerState::HalfOpen { in_flight: 0 }));
            } else {
                inner.metrics.rejected += 1;
                return Err(CircuitOpenError {
                    service: self.service.clone(),
                    retry_after: Some(self.config.open_duration() - elapsed),
                });
            }
        }

        let mut trial = false;
        let state = inner.state;
        if let BreakerState::HalfOpen { in_flight } = state {
            if in_flight >= self.config.half_open_max_calls.max(1) {
                inner.metrics.rejected += 1;
                drop(inner);
                if let Some((from, to)) = transitioned {
                    self.announce(from, to);
                }
                return Err(CircuitOpenError {
                    service: self.service.clone(),
                    retry_after: None,
                });
            }
            inner.state = BreakerState::HalfOpen {
                in_flight: in_flight + 1,
            };
            trial = true;
        }

        let epoch = inner.epoch;
        drop(inner);
        if let Some((from, to)) = transitioned {
            self.announce(from, to);
        }

        Ok(CallPermit {
            breaker: self,
            epoch,
            trial,
            settled: false,
        })
    }

    /// Run `f` through the breaker.
    ///
    /// `is_failure` decides which errors count against the circuit; errors
    /// it rejects (cancellation, caller mistakes) settle the permit without
    /// touching the counters.
    pub async fn call<T, E, F, Fut>(
        &self,
        f: F,
        is_failure: impl Fn(&E) -> bool,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(BreakerError::Open)?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    permit.failure();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Point-in-time view for status reporting.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            service: self.service.clone(),
            state: inner.state.label(),
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_transition: inner.last_transition,
            config: self.config.clone(),
            metrics: inner.metrics.clone(),
        }
    }

    /// Force the breaker back to CLOSED with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let (from, to) = inner.transition(BreakerState::Closed);
        drop(inner);
        if from != to {
            self.announce(from, to);
        }
    }

    fn settle(&self, epoch: u64, trial: bool, outcome: Outcome) {
        let mut inner = self.lock();
        match outcome {
            Outcome::Success => inner.metrics.successes += 1,
            Outcome::Failure => inner.metrics.failures += 1,
            Outcome::Released => {}
        }

        if inner.epoch != epoch {
            return;
        }

        let state = inner.state;
        let transitioned = match (state, outcome) {
            (BreakerState::Closed, Outcome::Success) => {
                inner.consecutive_failures = 0;
                None
            }
            (BreakerState::Closed, Outcome::Failure) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Some(inner.transition(BreakerState::Open {
                        opened_at: Instant::now(),
                    }))
                } else {
                    None
                }
            }
            (BreakerState::HalfOpen { in_flight }, outcome) if trial => {
                inner.state = BreakerState::HalfOpen {
                    in_flight: in_flight.saturating_sub(1),
                };
                match outcome {
                    Outcome::Success => {
                        inner.consecutive_successes += 1;
                        if inner.consecutive_successes >= self.config.success_threshold {
                            Some(inner.transition(BreakerState::Closed))
                        } else {
                            None
                        }
                    }
                    Outcome::Failure => {
                        inner.consecutive_failures += 1;
                        Some(inner.transition(BreakerState::Open {
                            opened_at: Instant::now(),
                        }))
                    }
                    Outcome::Released => None,
                }
            }
            _ => None,
        };

        drop(inner);
        if let Some((from, to)) = transitioned {
            self.announce(from, to);
        }
    }

    fn announce(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => tracing::warn!(
                service = %self.service,
                %from,
                "Circuit breaker opened"
            ),
            _ => tracing::info!(
                service = %self.service,
                %from,
                %to,
                "Circuit breaker transition"
            ),
        }
        self.sink.emit(WorkflowEvent::CircuitTransition {
            service: self.service.clone(),
            from,
            to,
        });
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Released,
}

/// Admission ticket for one call through a breaker.
#[must_use = "settle the permit with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is a HALF_OPEN trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.epoch, self.trial, Outcome::Success);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.epoch, self.trial, Outcome::Failure);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.epoch, self.trial, Outcome::Released);
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-scoped set of breakers addressed by service key.
///
/// Cloning shares the same breakers. Breakers are created lazily on first
/// use with the per-service override or the default config.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    defaults: CircuitBreakerConfig,
    overrides: Arc<HashMap<String, CircuitBreakerConfig>>,
    sink: SharedSink,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig, sink: SharedSink) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            defaults,
            overrides: Arc::new(HashMap::new()),
            sink,
        }
    }

    pub fn with_overrides(mut self, overrides: HashMap<String, CircuitBreakerConfig>) -> Self {
        self.overrides = Arc::new(overrides);
        self
    }

    /// Breaker for `service`, created on first access.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return Arc::clone(existing.value());
        }
        let config = self
            .overrides
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone());
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service, config, Arc::clone(&self.sink)))
            })
            .clone()
    }

    /// Run `f` through the breaker for `service`; every error counts as a
    /// failure.
    pub async fn guarded_call<T, E, F, Fut>(&self, service: &str, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get(service).call(f, |_| true).await
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), Arc::new(NoopSink))
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("services", &self.breakers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::event::EventBus;

    fn config(failures: u32, successes: u32, open_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            open_duration_ms: open_ms,
            half_open_max_calls: 1,
        }
    }

    fn breaker(failures: u32, successes: u32, open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("search", config(failures, successes, open_ms), Arc::new(NoopSink))
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.call(|| async { Err::<(), _>("down") }, |_| true).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.call(|| async { Ok::<(), &'static str>(()) }, |_| true).await
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn opens_after_failure_threshold() {
        let b = breaker(3, 1, 1000);
        for _ in 0..2 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Inner("down"))));
        }
        assert_eq!(b.state(), CircuitState::Closed);

        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn open_rejects_without_invoking() {
        let b = breaker(1, 1, 1000);
        let _ = fail(&b).await;

        let invoked = AtomicU32::new(0);
        let result = b
            .call(
                || async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), &str>(())
                },
                |_| true,
            )
            .await;

        match result {
            Err(BreakerError::Open(e)) => {
                assert_eq!(e.service, "search");
                assert!(e.retry_after.is_some());
            }
            other => panic!("expected open error, got {other:?}"),
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(b.snapshot().metrics.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_duration_then_closes() {
        let b = breaker(1, 2, 1000);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1000)).await;
        // Lazy transition happens on the next call.
        assert_eq!(b.state(), CircuitState::Open);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_fresh_timer() {
        let b = breaker(1, 1, 1000);
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_millis(1000)).await;

        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open(_))));

        tokio::time::advance(Duration::from_millis(500)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count_while_closed() {
        let b = breaker(3, 1, 1000);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.snapshot().consecutive_failures, 0);

        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_trial_calls() {
        let b = breaker(1, 1, 1000);
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_millis(1000)).await;

        let trial = b.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(b.try_acquire().is_err());

        trial.success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_slot_without_counting() {
        let b = breaker(1, 1, 1000);
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_millis(1000)).await;

        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let again = b.try_acquire().unwrap();
        again.success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn uncounted_errors_do_not_trip() {
        let b = breaker(1, 1, 1000);
        let result = b.call(|| async { Err::<(), _>("cancelled") }, |_| false).await;
        assert!(matches!(result, Err(BreakerError::Inner("cancelled"))));
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_and_zeroes() {
        let b = breaker(1, 1, 60_000);
        let _ = fail(&b).await;
        b.reset();
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.metrics.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_are_emitted() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let b = CircuitBreaker::new("search", config(1, 1, 10), Arc::new(bus));

        let _ = fail(&b).await;
        match rx.recv().await.unwrap() {
            WorkflowEvent::CircuitTransition { service, from, to } => {
                assert_eq!(service, "search");
                assert_eq!(from, CircuitState::Closed);
                assert_eq!(to, CircuitState::Open);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn registry_shares_breakers_per_key() {
        let registry = CircuitBreakerRegistry::new(config(1, 1, 1000), Arc::new(NoopSink))
            .with_overrides(HashMap::from([("slow".to_string(), config(5, 1, 1000))]));

        let _ = registry
            .guarded_call("search", || async { Err::<(), _>("down") })
            .await;
        let clone = registry.clone();
        assert_eq!(clone.get("search").state(), CircuitState::Open);
        assert_eq!(clone.get("other").state(), CircuitState::Closed);
        assert_eq!(registry.get("slow").config().failure_threshold, 5);

        let services: Vec<String> = registry.snapshots().into_iter().map(|s| s.service).collect();
        assert_eq!(services, vec!["other", "search", "slow"]);

        registry.reset_all();
        assert_eq!(registry.get("search").state(), CircuitState::Closed);
    }

    // -----------------------------------------------------------------------
    // Concurrent callers
    // -----------------------------------------------------------------------

    const CALLERS: usize = 32;

    fn transitions_to(events: &mut tokio::sync::broadcast::Receiver<WorkflowEvent>, state: CircuitState) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, WorkflowEvent::CircuitTransition { to, .. } if to == state) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_failures_open_exactly_once() {
        let bus = EventBus::new(256);
        let mut events = bus.subscribe();
        let breaker = Arc::new(CircuitBreaker::new("cms", config(5, 1, 60_000), Arc::new(bus)));
        let start = Arc::new(tokio::sync::Barrier::new(CALLERS));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..CALLERS {
            let breaker = Arc::clone(&breaker);
            let start = Arc::clone(&start);
            tasks.spawn(async move {
                start.wait().await;
                match breaker.try_acquire() {
                    Ok(permit) => {
                        permit.failure();
                        true
                    }
                    Err(_) => false,
                }
            });
        }
        let mut admitted = 0u64;
        while let Some(result) = tasks.join_next().await {
            admitted += u64::from(result.unwrap());
        }

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_failures, 5);
        assert_eq!(snapshot.metrics.total_calls, CALLERS as u64);
        assert_eq!(snapshot.metrics.failures, admitted);
        assert_eq!(snapshot.metrics.failures + snapshot.metrics.rejected, CALLERS as u64);
        assert!(admitted >= 5);
        assert_eq!(transitions_to(&mut events, CircuitState::Open), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_half_open_admits_exact_trials() {
        let bus = EventBus::new(256);
        let mut events = bus.subscribe();
        let mut cfg = config(1, 10, 20);
        cfg.half_open_max_calls = 3;
        let breaker = Arc::new(CircuitBreaker::new("cms", cfg, Arc::new(bus)));

        for round in 0..5 {
            breaker.reset();
            breaker.try_acquire().unwrap().failure();
            assert_eq!(breaker.state(), CircuitState::Open);
            tokio::time::sleep(Duration::from_millis(40)).await;

            let start = Arc::new(tokio::sync::Barrier::new(CALLERS));
            let done = Arc::new(tokio::sync::Barrier::new(CALLERS));
            let mut tasks = tokio::task::JoinSet::new();
            for _ in 0..CALLERS {
                let breaker = Arc::clone(&breaker);
                let start = Arc::clone(&start);
                let done = Arc::clone(&done);
                tasks.spawn(async move {
                    start.wait().await;
                    let permit = breaker.try_acquire();
                    let trial = permit.as_ref().map(|p| p.is_trial()).unwrap_or(false);
                    // Hold every trial slot until all callers have tried.
                    done.wait().await;
                    drop(permit);
                    trial
                });
            }
            let mut trials = 0;
            while let Some(result) = tasks.join_next().await {
                trials += usize::from(result.unwrap());
            }

            assert_eq!(trials, 3, "round {round}");
            assert_eq!(breaker.state(), CircuitState::HalfOpen, "round {round}");
            assert_eq!(transitions_to(&mut events, CircuitState::HalfOpen), 1, "round {round}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn registry_hands_every_caller_the_same_breaker() {
        let registry = CircuitBreakerRegistry::new(config(3, 1, 60_000), Arc::new(NoopSink));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..CALLERS {
            let registry = registry.clone();
            tasks.spawn(async move { registry.get("cms") });
        }
        let mut breakers = Vec::new();
        while let Some(result) = tasks.join_next().await {
            breakers.push(result.unwrap());
        }
        assert!(breakers.iter().all(|b| Arc::ptr_eq(b, &breakers[0])));
    }
}
