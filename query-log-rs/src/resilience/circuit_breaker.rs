//! Time-window circuit breaker
//!
//! Counts sink failures since the last success. Once the count reaches the
//! threshold the circuit opens and flushes skip the sink. There is no
//! separate half-open state: the first `should_attempt` after the cool-down
//! closes the circuit again, and that flush is the probe. A failed probe
//! re-opens it with a fresh window.

use std::time::{Duration, Instant};

use metrics::counter;

use super::CircuitBreakerStatus;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures since the last success before the circuit opens
    pub failure_threshold: u32,

    /// How long the circuit stays open after the latest failure
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(60),
        }
    }
}

/// Gate in front of the sink.
///
/// Owned by a single flusher, so every method takes `&mut self`.
pub trait CircuitBreaker: Send {
    /// Whether the next flush should call the sink. May close an open
    /// circuit whose cool-down has elapsed.
    fn should_attempt(&mut self) -> bool;

    fn record_success(&mut self);

    fn record_failure(&mut self);

    fn status(&self) -> CircuitBreakerStatus;
}

#[derive(Debug, Clone)]
pub struct TimeWindowCircuitBreaker {
    config: CircuitBreakerConfig,
    failure_count: u32,
    last_failure: Option<Instant>,
    open: bool,
}

impl Default for TimeWindowCircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl TimeWindowCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failure_count: 0,
            last_failure: None,
            open: false,
        }
    }

    /// [`CircuitBreaker::should_attempt`] against an explicit clock reading.
    pub fn should_attempt_at(&mut self, now: Instant) -> bool {
        if self.open {
            let cooled = self
                .last_failure
                .map_or(true, |at| now.saturating_duration_since(at) > self.config.open_duration);
            if cooled {
                tracing::info!(
                    failures = self.failure_count,
                    "Circuit breaker cool-down elapsed, probing sink"
                );
                self.open = false;
            }
        }
        !self.open
    }

    /// [`CircuitBreaker::record_failure`] against an explicit clock reading.
    pub fn record_failure_at(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);

        if self.failure_count >= self.config.failure_threshold {
            if !self.open {
                counter!("query_log.circuit.opened", 1);
            }
            self.open = true;
            tracing::warn!(
                failures = self.failure_count,
                open_secs = self.config.open_duration.as_secs(),
                "Circuit opened after {} failures, cooling for {}s",
                self.failure_count,
                self.config.open_duration.as_secs()
            );
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl CircuitBreaker for TimeWindowCircuitBreaker {
    fn should_attempt(&mut self) -> bool {
        self.should_attempt_at(Instant::now())
    }

    fn record_success(&mut self) {
        if self.open {
            tracing::info!("Circuit closed after recovery");
            self.open = false;
        }
        self.failure_count = 0;
    }

    fn record_failure(&mut self) {
        self.record_failure_at(Instant::now())
    }

    fn status(&self) -> CircuitBreakerStatus {
        if self.open {
            CircuitBreakerStatus::Open
        } else {
            CircuitBreakerStatus::Closed
        }
    }
}
