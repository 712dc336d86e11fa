//! Bounded ingestion queue
//!
//! Producers hand records over with a synchronous [`QueryLogQueue::enqueue`]
//! that never waits. When the queue is full the incoming record is dropped,
//! so request latency never depends on sink health. The single
//! [`QueueConsumer`] reads records in FIFO order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{self, Stream};
use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::QueueError;
use crate::record::QueryLog;
use crate::shutdown::Shutdown;

/// Default number of records held before new arrivals are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5000;

/// Producer handle. Cheap to clone; one per request handler is fine.
#[derive(Debug, Clone)]
pub struct QueryLogQueue {
    tx: mpsc::Sender<QueryLog>,
    dropped: Arc<AtomicU64>,
}

/// The consuming end, owned by the flusher.
#[derive(Debug)]
pub struct QueueConsumer {
    rx: mpsc::Receiver<QueryLog>,
    dropped: Arc<AtomicU64>,
}

impl QueryLogQueue {
    /// Create a queue holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> (QueryLogQueue, QueueConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        (
            QueryLogQueue {
                tx,
                dropped: Arc::clone(&dropped),
            },
            QueueConsumer { rx, dropped },
        )
    }

    /// Hand a record to the pipeline. Never blocks; a full queue drops it.
    pub fn enqueue(&self, log: QueryLog) {
        match self.tx.try_send(log) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.record_drop("full"),
            Err(TrySendError::Closed(_)) => self.record_drop("closed"),
        }
    }

    /// Records dropped since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self, reason: &'static str) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("query_log.queue.dropped", 1);
        tracing::debug!(reason, dropped_total = total, "Query log dropped at ingestion");
    }
}

impl QueueConsumer {
    /// Wait for the next record.
    ///
    /// Once `shutdown` fires this returns [`QueueError::Cancelled`] even if
    /// records are still queued; use [`drain_ready`](Self::drain_ready) to
    /// collect them.
    pub async fn next(&mut self, shutdown: &Shutdown) -> Result<QueryLog, QueueError> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(QueueError::Cancelled),
            received = self.rx.recv() => received.ok_or(QueueError::Closed),
        }
    }

    /// Take every record already queued without waiting.
    pub fn drain_ready(&mut self) -> Vec<QueryLog> {
        let mut ready = Vec::new();
        while let Ok(log) = self.rx.try_recv() {
            ready.push(log);
        }
        ready
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records as a lazy stream that ends on cancellation or closure.
    pub fn into_stream(self, shutdown: Shutdown) -> impl Stream<Item = QueryLog> {
        stream::unfold((self, shutdown), |(mut consumer, shutdown)| async move {
            match consumer.next(&shutdown).await {
                Ok(log) => Some((log, (consumer, shutdown))),
                Err(_) => None,
            }
        })
    }
}
