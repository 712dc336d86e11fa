//! Sink port and the HTTP batch-insert adapter
//!
//! The pipeline only needs a batch insert with a clear success/failure
//! signal. `HttpSink` posts the batch as a JSON array to a collector
//! endpoint that writes it to the relational store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::{PipelineError, SinkError};
use crate::record::QueryLog;

/// Persistent destination for query logs.
#[async_trait]
pub trait QueryLogSink: Send + Sync {
    /// Store `logs` as one batch. Partial success is reported as failure.
    async fn insert_batch(&self, logs: &[QueryLog]) -> Result<(), SinkError>;

    async fn insert(&self, log: &QueryLog) -> Result<(), SinkError> {
        self.insert_batch(std::slice::from_ref(log)).await
    }
}

/// Configuration for [`HttpSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api/v1/query-logs".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSink {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpSink {
    pub fn new(config: &SinkConfig) -> Result<Self, PipelineError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Sink(e.to_string()))?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_status(status: StatusCode) -> SinkError {
    let message = format!("query log endpoint returned status: {}", status);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        SinkError::Transient(message)
    } else {
        SinkError::Fatal(message)
    }
}

#[async_trait]
impl QueryLogSink for HttpSink {
    async fn insert_batch(&self, logs: &[QueryLog]) -> Result<(), SinkError> {
        if logs.is_empty() {
            return Ok(());
        }

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(logs)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    SinkError::Fatal(e.to_string())
                } else {
                    SinkError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        tracing::debug!(count = logs.len(), status = status.as_u16(), "Inserted query log batch");
        Ok(())
    }
}
