//! Resilience patterns for the sink call
//!
//! - Retry with exponential backoff
//! - Time-window circuit breaker
//!
//! Both sit behind traits so the flusher can be driven by other policies.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, TimeWindowCircuitBreaker};
pub use retry::{RetryAttempt, RetryConfig, RetryError, RetryExecutor, RetryPolicy, Retryable};

/// Status of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerStatus {
    /// Circuit is closed, sink calls are attempted
    Closed,

    /// Circuit is open, batches go straight to the journal
    Open,
}

impl std::fmt::Display for CircuitBreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
        }
    }
}
