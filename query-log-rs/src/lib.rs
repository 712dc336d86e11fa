//! Query log delivery pipeline
//!
//! Request handlers hand finished query logs to a bounded in-memory queue
//! and move on. A single background flusher batches them into a sink,
//! retrying transient failures with backoff. A circuit breaker stops
//! hammering a sink that keeps failing. Anything that cannot be delivered
//! is written to an append-only journal on disk and replayed after the next
//! successful flush or the next start.
//!
//! ```no_run
//! use query_log::{spawn_pipeline, HttpSink, PipelineConfig, QueryLog};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = PipelineConfig::from_env();
//! config.validate()?;
//! let pipeline = spawn_pipeline(&config, HttpSink::new(&config.sink)?);
//!
//! pipeline.queue().enqueue(QueryLog::new("top 5 products by revenue", "gpt-4o"));
//!
//! let report = pipeline.shutdown().await?;
//! println!("delivered {}", report.delivered);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod flusher;
pub mod journal;
pub mod logging;
pub mod queue;
pub mod record;
pub mod resilience;
pub mod shutdown;
pub mod sink;

use tokio::task::JoinHandle;

pub use config::PipelineConfig;
pub use error::{ConfigError, JournalError, PipelineError, QueueError, SinkError};
pub use flusher::{FlushConfig, FlushReport, QueryLogFlusher};
pub use journal::{FileJournal, Journal};
pub use logging::{init_logging, LoggingConfig};
pub use queue::{QueryLogQueue, QueueConsumer};
pub use record::QueryLog;
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, RetryConfig, RetryExecutor,
    RetryPolicy, TimeWindowCircuitBreaker,
};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use sink::{HttpSink, QueryLogSink, SinkConfig};

/// A running pipeline: the producer handle plus the flusher task.
pub struct PipelineHandle {
    queue: QueryLogQueue,
    trigger: ShutdownTrigger,
    task: JoinHandle<FlushReport>,
}

impl PipelineHandle {
    /// Producer handle. Clone it into every request handler.
    pub fn queue(&self) -> &QueryLogQueue {
        &self.queue
    }

    /// A view of the shutdown signal driving the flusher.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.trigger.subscribe()
    }

    /// Stop the flusher and wait for its final flush.
    pub async fn shutdown(self) -> Result<FlushReport, PipelineError> {
        self.trigger.trigger();
        self.task
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))
    }
}

/// Wire the queue, journal, retry policy and circuit breaker from `config`
/// and start the flusher on the current runtime.
pub fn spawn_pipeline<S>(config: &PipelineConfig, sink: S) -> PipelineHandle
where
    S: QueryLogSink + 'static,
{
    let (queue, consumer) = QueryLogQueue::new(config.queue.capacity);
    let (trigger, shutdown) = shutdown::channel();

    let flusher = QueryLogFlusher::with_policies(
        sink,
        config.journal.journal(),
        RetryExecutor::new(config.retry.clone()),
        TimeWindowCircuitBreaker::new(config.circuit_breaker.clone()),
        config.flush.clone(),
    );
    let task = tokio::spawn(flusher.run(consumer, shutdown));

    tracing::info!(
        capacity = config.queue.capacity,
        journal = %config.journal.journal().path().display(),
        retry = %config.retry,
        "Query log pipeline started"
    );

    PipelineHandle {
        queue,
        trigger,
        task,
    }
}
