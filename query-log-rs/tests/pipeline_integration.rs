use std::path::Path;
use std::time::Duration;

use query_log::{
    spawn_pipeline, CircuitBreakerConfig, FileJournal, FlushConfig, HttpSink, Journal,
    PipelineConfig, QueryLog, RetryConfig, SinkConfig,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ROUTE: &str = "/api/v1/query-logs";

fn config(data_dir: &Path, server: &MockServer) -> PipelineConfig {
    PipelineConfig {
        flush: FlushConfig {
            max_batch_size: 3,
            max_flush_interval: Duration::from_secs(30),
        },
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            multiplier: 2.0,
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            open_duration: Duration::from_secs(60),
        },
        journal: query_log::config::JournalConfig {
            data_dir: data_dir.to_path_buf(),
        },
        sink: SinkConfig {
            endpoint: format!("{}{}", server.uri(), ROUTE),
            timeout: Duration::from_secs(2),
        },
        ..PipelineConfig::default()
    }
}

fn log(n: usize) -> QueryLog {
    QueryLog::new(format!("query {n}"), "test-model").with_correlation_id(format!("c-{n}"))
}

async fn delivered_batches(server: &MockServer) -> Vec<Vec<QueryLog>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == ROUTE)
        .filter_map(|request| serde_json::from_slice::<Vec<QueryLog>>(&request.body).ok())
        .collect()
}

async fn delivered_queries(server: &MockServer) -> Vec<String> {
    delivered_batches(server)
        .await
        .into_iter()
        .flatten()
        .map(|log| log.user_query)
        .collect()
}

#[tokio::test]
async fn test_records_reach_the_sink_in_batches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ROUTE))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path(), &server);

    let pipeline = spawn_pipeline(&config, HttpSink::new(&config.sink).unwrap());
    for n in 1..=7 {
        pipeline.queue().enqueue(log(n));
    }
    let report = pipeline.shutdown().await.unwrap();

    assert_eq!(report.delivered, 7);
    assert_eq!(report.journaled, 0);
    let sizes: Vec<usize> = delivered_batches(&server).await.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    let expected: Vec<String> = (1..=7).map(|n| format!("query {n}")).collect();
    assert_eq!(delivered_queries(&server).await, expected);
    assert!(config.journal.journal().load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unavailable_sink_journals_then_next_run_recovers() {
    let dir = tempfile::tempdir().expect("tempdir");

    // First run: the sink only answers 503.
    let down = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&down)
        .await;
    let config_down = config(dir.path(), &down);
    let pipeline = spawn_pipeline(&config_down, HttpSink::new(&config_down.sink).unwrap());
    for n in 1..=4 {
        pipeline.queue().enqueue(log(n));
    }
    let report = pipeline.shutdown().await.unwrap();

    assert_eq!(report.delivered, 0);
    assert_eq!(report.journaled, 4);
    let journal = FileJournal::in_data_dir(dir.path());
    assert_eq!(journal.load_all().await.unwrap().len(), 4);

    // Second run: healthy sink, no new records.
    let up = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ROUTE))
        .respond_with(ResponseTemplate::new(200))
        .mount(&up)
        .await;
    let config_up = config(dir.path(), &up);
    let pipeline = spawn_pipeline(&config_up, HttpSink::new(&config_up.sink).unwrap());
    let report = pipeline.shutdown().await.unwrap();

    assert_eq!(report.recovered, 4);
    assert_eq!(report.delivered, 4);
    let expected: Vec<String> = (1..=4).map(|n| format!("query {n}")).collect();
    assert_eq!(delivered_queries(&up).await, expected);
    assert!(journal.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_batch_is_not_retried_and_is_journaled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().expect("tempdir");
    let config = config(dir.path(), &server);

    let pipeline = spawn_pipeline(&config, HttpSink::new(&config.sink).unwrap());
    for n in 1..=2 {
        pipeline.queue().enqueue(log(n));
    }
    let report = pipeline.shutdown().await.unwrap();

    assert_eq!(report.failed_flushes, 1);
    assert_eq!(report.journaled, 2);
}

#[tokio::test]
async fn test_full_queue_drops_newest_records() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(dir.path(), &server);
    config.queue.capacity = 2;
    config.flush.max_batch_size = 100;

    // The current-thread test runtime does not run the flusher until we
    // yield, so all of these land on a queue nobody is reading yet.
    let pipeline = spawn_pipeline(&config, HttpSink::new(&config.sink).unwrap());
    for n in 1..=5 {
        pipeline.queue().enqueue(log(n));
    }
    assert_eq!(pipeline.queue().dropped(), 3);

    let report = pipeline.shutdown().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(delivered_queries(&server).await, vec!["query 1", "query 2"]);
}
