//! Batching consumer
//!
//! The flusher is the only reader of the ingestion queue. It accumulates
//! records, flushes them to the sink when the batch is full or the flush
//! interval has passed, and spills to the journal whenever the sink is
//! skipped or fails. The buffer, the circuit breaker and the journal are all
//! owned by this one task.
//!
//! Journal bookkeeping per flush cycle:
//! - records recovered at startup sit at the head of the buffer and are
//!   already on disk, so a failed flush only appends the part of the batch
//!   that is not;
//! - once anything has been spilled, the journal holds records that are no
//!   longer in memory. After the next successful flush those are replayed
//!   to the sink before the journal is cleared, instead of being dropped
//!   along with the file.

use std::time::{Duration, Instant};

use metrics::counter;

use crate::error::QueueError;
use crate::journal::Journal;
use crate::queue::QueueConsumer;
use crate::record::QueryLog;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerStatus, RetryError, RetryExecutor, RetryPolicy,
    TimeWindowCircuitBreaker,
};
use crate::shutdown::Shutdown;
use crate::sink::QueryLogSink;

/// Batching thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct FlushConfig {
    /// Flush as soon as the buffer holds this many records
    pub max_batch_size: usize,

    /// Flush when this long has passed since the last successful flush
    pub max_flush_interval: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_flush_interval: Duration::from_secs(30),
        }
    }
}

/// Counters returned when the flusher stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Records loaded from the journal at startup
    pub recovered: usize,
    /// Records accepted by the sink, journal replays included
    pub delivered: usize,
    /// Records written to the journal
    pub journaled: usize,
    /// Flush cycles started
    pub flushes: usize,
    /// Flush cycles where the sink call failed
    pub failed_flushes: usize,
    /// Flush cycles that skipped the sink because the circuit was open
    pub skipped_flushes: usize,
    /// Journal reads or writes that failed
    pub journal_errors: usize,
    /// Circuit state at exit
    pub circuit: CircuitBreakerStatus,
}

impl Default for FlushReport {
    fn default() -> Self {
        Self {
            recovered: 0,
            delivered: 0,
            journaled: 0,
            flushes: 0,
            failed_flushes: 0,
            skipped_flushes: 0,
            journal_errors: 0,
            circuit: CircuitBreakerStatus::Closed,
        }
    }
}

enum FlushOutcome {
    Delivered,
    Journaled,
    /// Shutdown fired during a retry wait; the batch was neither delivered
    /// nor journaled.
    Interrupted {
        batch: Vec<QueryLog>,
        on_disk: usize,
    },
}

/// The single consumer of the ingestion queue.
pub struct QueryLogFlusher<S, J, R = RetryExecutor, C = TimeWindowCircuitBreaker> {
    sink: S,
    journal: J,
    retry: R,
    breaker: C,
    config: FlushConfig,
    buffer: Vec<QueryLog>,
    last_flush: Instant,
    /// Leading buffer records that are already stored in the journal.
    recovered_on_disk: usize,
    /// The journal holds records that are not in the buffer.
    journal_backlog: bool,
    /// Recovered records in chunks not yet flushed; their only durable copy
    /// is the journal, so it must not be cleared yet.
    on_disk_pending: usize,
    report: FlushReport,
}

impl<S, J> QueryLogFlusher<S, J>
where
    S: QueryLogSink,
    J: Journal,
{
    /// Flusher with the default retry policy and circuit breaker.
    pub fn new(sink: S, journal: J, config: FlushConfig) -> Self {
        Self::with_policies(
            sink,
            journal,
            RetryExecutor::default(),
            TimeWindowCircuitBreaker::default(),
            config,
        )
    }
}

impl<S, J, R, C> QueryLogFlusher<S, J, R, C>
where
    S: QueryLogSink,
    J: Journal,
    R: RetryPolicy,
    C: CircuitBreaker,
{
    pub fn with_policies(sink: S, journal: J, retry: R, breaker: C, config: FlushConfig) -> Self {
        Self {
            sink,
            journal,
            retry,
            breaker,
            config,
            buffer: Vec::new(),
            last_flush: Instant::now(),
            recovered_on_disk: 0,
            journal_backlog: false,
            on_disk_pending: 0,
            report: FlushReport::default(),
        }
    }

    /// Recover the journal, then consume until shutdown fires or every
    /// producer is gone. Ends with one final flush.
    pub async fn run(mut self, mut consumer: QueueConsumer, shutdown: Shutdown) -> FlushReport {
        tracing::info!(
            max_batch_size = self.config.max_batch_size,
            max_flush_interval_ms = self.config.max_flush_interval.as_millis() as u64,
            "Query log flusher running"
        );
        self.recover().await;
        self.last_flush = Instant::now();

        loop {
            let next = if self.buffer.is_empty() {
                consumer.next(&shutdown).await.map(Some)
            } else {
                let deadline = self.last_flush + self.config.max_flush_interval;
                tokio::select! {
                    received = consumer.next(&shutdown) => received.map(Some),
                    _ = tokio::time::sleep_until(deadline.into()) => Ok(None),
                }
            };

            match next {
                Ok(Some(log)) => {
                    self.buffer.push(log);
                    if self.flush_due() && !self.flush_buffer(&shutdown).await {
                        break;
                    }
                }
                Ok(None) => {
                    if !self.flush_buffer(&shutdown).await {
                        break;
                    }
                }
                Err(QueueError::Cancelled) => {
                    tracing::info!("Shutdown requested, stopping query log flusher");
                    break;
                }
                Err(QueueError::Closed) => {
                    tracing::info!("All producers gone, stopping query log flusher");
                    break;
                }
            }
        }

        let ready = consumer.drain_ready();
        self.buffer.extend(ready);

        // The shutdown signal has already fired; the last flush gets to
        // finish its retries.
        self.flush_buffer(&Shutdown::never()).await;

        self.report.circuit = self.breaker.status();
        tracing::info!(
            recovered = self.report.recovered,
            delivered = self.report.delivered,
            journaled = self.report.journaled,
            flushes = self.report.flushes,
            failed_flushes = self.report.failed_flushes,
            skipped_flushes = self.report.skipped_flushes,
            dropped = consumer.dropped(),
            "Query log flusher stopped"
        );
        self.report
    }

    fn flush_due(&self) -> bool {
        self.buffer.len() >= self.config.max_batch_size
            || self.last_flush.elapsed() >= self.config.max_flush_interval
    }

    async fn recover(&mut self) {
        match self.journal.load_all().await {
            Ok(recovered) if !recovered.is_empty() => {
                tracing::info!(
                    count = recovered.len(),
                    "Recovered {} unflushed logs from journal",
                    recovered.len()
                );
                self.report.recovered = recovered.len();
                self.recovered_on_disk = recovered.len();
                let fresh = std::mem::replace(&mut self.buffer, recovered);
                self.buffer.extend(fresh);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "Failed to read journal; starting with an empty buffer");
                self.report.journal_errors += 1;
                // Whatever is in there gets replayed after the next success.
                self.journal_backlog = true;
            }
        }
    }

    /// Flush the whole buffer in batches of at most `max_batch_size`.
    /// Returns false when shutdown interrupted a batch and the loop must stop;
    /// the unflushed records are back in the buffer.
    async fn flush_buffer(&mut self, shutdown: &Shutdown) -> bool {
        let chunk_size = self.config.max_batch_size.max(1);
        let mut pending = std::mem::take(&mut self.buffer);
        let mut on_disk = std::mem::take(&mut self.recovered_on_disk);

        while !pending.is_empty() {
            let rest = pending.split_off(chunk_size.min(pending.len()));
            let chunk_on_disk = on_disk.min(pending.len());
            on_disk -= chunk_on_disk;
            self.on_disk_pending = on_disk;

            if let FlushOutcome::Interrupted {
                mut batch,
                on_disk: batch_on_disk,
            } = self.flush(pending, chunk_on_disk, shutdown).await
            {
                batch.extend(rest);
                self.buffer = batch;
                self.recovered_on_disk = batch_on_disk + on_disk;
                self.on_disk_pending = 0;
                return false;
            }
            pending = rest;
        }

        self.on_disk_pending = 0;
        true
    }

    /// Flush one batch whose first `on_disk` records are already journaled.
    async fn flush(
        &mut self,
        batch: Vec<QueryLog>,
        on_disk: usize,
        shutdown: &Shutdown,
    ) -> FlushOutcome {
        self.report.flushes += 1;

        if !self.breaker.should_attempt() {
            tracing::warn!(
                count = batch.len(),
                "Circuit open - skipping sink flush; persisting {} logs to journal",
                batch.len()
            );
            self.report.skipped_flushes += 1;
            self.spill(&batch, on_disk).await;
            return FlushOutcome::Journaled;
        }

        let sink = &self.sink;
        let result = self
            .retry
            .execute(|| sink.insert_batch(&batch), shutdown)
            .await;

        match result {
            Ok(()) => {
                self.breaker.record_success();
                self.last_flush = Instant::now();
                self.report.delivered += batch.len();
                counter!("query_log.flush.delivered", batch.len() as u64);
                tracing::info!(
                    count = batch.len(),
                    "Flushed {} logs to sink successfully",
                    batch.len()
                );
                self.settle_journal(shutdown).await;
                FlushOutcome::Delivered
            }
            Err(RetryError::Cancelled) => {
                tracing::info!(count = batch.len(), "Flush interrupted by shutdown");
                FlushOutcome::Interrupted { batch, on_disk }
            }
            Err(RetryError::Operation(err)) => {
                self.breaker.record_failure();
                self.report.failed_flushes += 1;
                counter!("query_log.flush.failed", 1);
                tracing::error!(
                    error = %err,
                    count = batch.len(),
                    "Sink flush failed; persisting {} logs to journal",
                    batch.len()
                );
                self.spill(&batch, on_disk).await;
                FlushOutcome::Journaled
            }
        }
    }

    /// Journal a batch whose first `on_disk` records are already stored.
    async fn spill(&mut self, batch: &[QueryLog], on_disk: usize) {
        let fresh = &batch[on_disk.min(batch.len())..];
        match self.journal.save(fresh).await {
            Ok(()) => {
                self.journal_backlog = true;
                self.report.journaled += fresh.len();
                counter!("query_log.flush.journaled", fresh.len() as u64);
            }
            Err(err) => {
                self.report.journal_errors += 1;
                if on_disk > 0 {
                    self.journal_backlog = true;
                }
                tracing::error!(
                    error = %err,
                    count = fresh.len(),
                    "Failed to journal {} logs; they are lost",
                    fresh.len()
                );
            }
        }
    }

    /// Called after a successful flush. Replays any backlog the journal holds
    /// beyond the delivered batch, then clears it.
    async fn settle_journal(&mut self, shutdown: &Shutdown) {
        if self.on_disk_pending > 0 {
            return;
        }
        if self.journal_backlog {
            let backlog = match self.journal.load_all().await {
                Ok(backlog) => backlog,
                Err(err) => {
                    self.report.journal_errors += 1;
                    tracing::error!(error = %err, "Failed to read journal backlog; keeping it for later");
                    return;
                }
            };

            if !backlog.is_empty() {
                tracing::info!(count = backlog.len(), "Replaying {} journaled logs", backlog.len());
                if !self.replay(&backlog, shutdown).await {
                    return;
                }
            }
        }

        match self.journal.clear().await {
            Ok(()) => self.journal_backlog = false,
            Err(err) => {
                self.report.journal_errors += 1;
                tracing::error!(error = %err, "Failed to clear journal");
            }
        }
    }

    /// Deliver `backlog` in batch-sized chunks. False leaves the journal as is.
    async fn replay(&mut self, backlog: &[QueryLog], shutdown: &Shutdown) -> bool {
        for chunk in backlog.chunks(self.config.max_batch_size.max(1)) {
            let sink = &self.sink;
            match self.retry.execute(|| sink.insert_batch(chunk), shutdown).await {
                Ok(()) => {
                    self.report.delivered += chunk.len();
                    counter!("query_log.flush.delivered", chunk.len() as u64);
                }
                Err(RetryError::Cancelled) => {
                    tracing::info!("Journal replay interrupted by shutdown; journal kept");
                    return false;
                }
                Err(RetryError::Operation(err)) => {
                    self.breaker.record_failure();
                    tracing::warn!(error = %err, "Journal replay failed; journal kept for the next cycle");
                    return false;
                }
            }
        }
        true
    }
}
