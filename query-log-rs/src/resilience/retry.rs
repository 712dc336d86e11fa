//! Retry with exponential backoff
//!
//! Every attempt but the last is guarded: a retryable failure is reported,
//! the executor waits, and the delay grows by the configured multiplier. The
//! last attempt runs unguarded and its outcome is the result.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::shutdown::Shutdown;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation failed: retries were exhausted or the error was not
    /// retryable.
    #[error("{0}")]
    Operation(E),

    /// Shutdown fired while waiting between attempts.
    #[error("retry cancelled by shutdown")]
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first (0 and 1 both mean a single call)
    pub max_attempts: u32,

    /// Wait after the first failure
    pub initial_delay: Duration,

    /// Growth factor applied to the wait after each failure
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl fmt::Display for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryConfig {{ max_attempts: {}, initial_delay: {:?}, multiplier: {} }}",
            self.max_attempts, self.initial_delay, self.multiplier
        )
    }
}

/// A failed attempt that will be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
}

type RetryObserver = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// Runs an async operation under a retry policy.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    async fn execute<F, Fut, T, E>(
        &self,
        operation: F,
        shutdown: &Shutdown,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Retryable + fmt::Display + Send;
}

/// Exponential backoff executor
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    on_retry: Option<RetryObserver>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            on_retry: None,
        }
    }

    /// Call `observer` for every failed attempt that is about to be retried.
    pub fn with_observer<O>(mut self, observer: O) -> Self
    where
        O: Fn(&RetryAttempt) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.config.multiplier)
            .unwrap_or(Duration::MAX)
    }
}

#[async_trait]
impl RetryPolicy for RetryExecutor {
    async fn execute<F, Fut, T, E>(
        &self,
        mut operation: F,
        shutdown: &Shutdown,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Retryable + fmt::Display + Send,
    {
        let max_attempts = self.config.max_attempts;
        let mut delay = self.config.initial_delay;

        for attempt in 1..max_attempts {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(RetryError::Operation(err)),
                Err(err) => err,
            };

            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retry {}/{} failed, retrying in {} ms",
                attempt,
                max_attempts,
                delay.as_millis()
            );
            if let Some(observer) = &self.on_retry {
                observer(&RetryAttempt {
                    attempt,
                    max_attempts,
                    delay,
                });
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.next_delay(delay);
        }

        operation().await.map_err(RetryError::Operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test failure (retryable: {})", self.retryable)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn transient() -> TestError {
        TestError { retryable: true }
    }

    fn recording_executor(config: RetryConfig) -> (RetryExecutor, Arc<Mutex<Vec<RetryAttempt>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let executor = RetryExecutor::new(config)
            .with_observer(move |attempt| sink.lock().unwrap().push(*attempt));
        (executor, seen)
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let retry = RetryExecutor::default();
        let result = retry
            .execute(|| async { Ok::<_, TestError>(42) }, &Shutdown::never())
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_succeeds_on_fourth_attempt() {
        let (retry, seen) = recording_executor(RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            multiplier: 2.0,
        });
        let calls = AtomicU32::new(0);

        let result = retry
            .execute(
                || {
                    let current = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if current < 4 {
                            Err(transient())
                        } else {
                            Ok(current)
                        }
                    }
                },
                &Shutdown::never(),
            )
            .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let delays: Vec<u128> = seen.lock().unwrap().iter().map(|a| a.delay.as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40]);
        let attempts: Vec<u32> = seen.lock().unwrap().iter().map(|a| a.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_exhaustion_propagates_last_failure() {
        let (retry, seen) = recording_executor(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            multiplier: 2.0,
        });
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(transient()) }
                },
                &Shutdown::never(),
            )
            .await;

        assert!(matches!(result, Err(RetryError::Operation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let attempts: Vec<u32> = seen.lock().unwrap().iter().map(|a| a.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_zero_and_one_attempts_call_once() {
        for max_attempts in [0, 1] {
            let (retry, seen) = recording_executor(RetryConfig {
                max_attempts,
                initial_delay: Duration::from_millis(5),
                multiplier: 2.0,
            });
            let calls = AtomicU32::new(0);

            let result: Result<(), _> = retry
                .execute(
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err(transient()) }
                    },
                    &Shutdown::never(),
                )
                .await;

            assert!(result.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert!(seen.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_no_retry_on_non_retryable_error() {
        let (retry, seen) = recording_executor(RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5),
            multiplier: 2.0,
        });
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(TestError { retryable: false }) }
                },
                &Shutdown::never(),
            )
            .await;

        assert!(matches!(result, Err(RetryError::Operation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_during_wait() {
        let retry = RetryExecutor::new(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_secs(30),
            multiplier: 2.0,
        });
        let (trigger, shutdown) = shutdown::channel();
        let calls = AtomicU32::new(0);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let result: Result<(), _> = tokio::time::timeout(
            Duration::from_secs(5),
            retry.execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(transient()) }
                },
                &shutdown,
            ),
        )
        .await
        .expect("cancellation should cut the wait short");

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
