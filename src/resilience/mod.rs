//! Failure handling around each call: the per-method circuit breaker and the
//! retry policy applied inside its admission.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerStats, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
    CircuitTransition,
};
pub use retry::{BackoffKind, ErrorClass, RetryConfig, RetryPolicy, RetryPredicate};
