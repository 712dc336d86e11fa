//! Error types for the query log pipeline
//!
//! None of these ever reach the request path: producers only enqueue. They
//! exist so the flusher can decide between retrying, journaling and stopping.

use thiserror::Error;

use crate::resilience::Retryable;

/// Failure reported by a [`QueryLogSink`](crate::sink::QueryLogSink).
#[derive(Debug, Error)]
pub enum SinkError {
    /// Timeouts, connectivity loss, throttling. Worth retrying.
    #[error("transient sink error: {0}")]
    Transient(String),

    /// Rejected payloads and other failures a retry cannot fix.
    #[error("fatal sink error: {0}")]
    Fatal(String),
}

impl SinkError {
    pub fn transient(message: impl Into<String>) -> Self {
        SinkError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        SinkError::Fatal(message.into())
    }
}

impl Retryable for SinkError {
    fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Journal I/O and encoding failures.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why [`QueueConsumer::next`](crate::queue::QueueConsumer::next) stopped
/// yielding records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue consumption cancelled")]
    Cancelled,

    #[error("queue closed: every producer handle was dropped")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Errors surfaced while assembling or running the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("sink setup failed: {0}")]
    Sink(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("flusher task failed: {0}")]
    Task(String),
}
