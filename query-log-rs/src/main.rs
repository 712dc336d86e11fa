//! query-log-relay
//!
//! Reads newline-delimited JSON query logs from stdin and relays them
//! through the pipeline to the HTTP sink. Stops on Ctrl-C or end of input,
//! flushing whatever is still buffered.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use query_log::{init_logging, spawn_pipeline, HttpSink, PipelineConfig, QueryLog, QueryLogQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let (config, warnings) = PipelineConfig::from_env_deferred();
    init_logging(&config.logging)?;
    for warning in &warnings {
        tracing::warn!("{}", warning);
    }
    config.validate().context("invalid query log configuration")?;

    let sink = HttpSink::new(&config.sink)?;
    tracing::info!(endpoint = sink.endpoint(), "Relaying query logs from stdin");

    let pipeline = spawn_pipeline(&config, sink);
    let reader = tokio::spawn(relay_stdin(pipeline.queue().clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            tracing::info!("Ctrl-C received, shutting down");
        }
        result = reader => {
            let (accepted, rejected) = result.context("stdin reader panicked")??;
            tracing::info!(accepted, rejected, "End of input, shutting down");
        }
    }

    let report = pipeline.shutdown().await?;
    tracing::info!(
        delivered = report.delivered,
        journaled = report.journaled,
        recovered = report.recovered,
        circuit = %report.circuit,
        "Query log relay stopped"
    );
    Ok(())
}

/// Enqueue every parsable line; returns (accepted, rejected).
async fn relay_stdin(queue: QueryLogQueue) -> anyhow::Result<(u64, u64)> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (mut accepted, mut rejected) = (0u64, 0u64);

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<QueryLog>(&line) {
            Ok(log) => {
                queue.enqueue(log);
                accepted += 1;
            }
            Err(err) => {
                rejected += 1;
                tracing::warn!(error = %err, "Skipping malformed query log line");
            }
        }
    }

    Ok((accepted, rejected))
}
