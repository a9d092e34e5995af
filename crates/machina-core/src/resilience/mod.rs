//! Fault tolerance: circuit breakers, retry with backoff, saga compensation.

pub mod circuit_breaker;
pub mod retry;
pub mod saga;

pub use circuit_breaker::{
    BreakerError, CallPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitOpenError,
};
pub use retry::{Backoff, RetryError, RetryExecutor, RetryMetrics};
pub use saga::{Compensation, SagaCoordinator, SagaError, SagaStep};
