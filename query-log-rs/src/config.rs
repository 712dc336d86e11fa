//! Pipeline configuration
//!
//! Every knob has a default. `from_env` overrides them from `QUERY_LOG_*`
//! variables (a `.env` file is honoured by the binary); unparsable values
//! are reported and the default is kept.

use std::cell::RefCell;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::flusher::FlushConfig;
use crate::journal::FileJournal;
use crate::logging::LoggingConfig;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::sink::SinkConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalConfig {
    /// The journal lives at `<data_dir>/querybuffer/pending-logs.jsonl`
    pub data_dir: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./logs_data"),
        }
    }
}

impl JournalConfig {
    pub fn journal(&self) -> FileJournal {
        FileJournal::in_data_dir(&self.data_dir)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub flush: FlushConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub journal: JournalConfig,
    pub sink: SinkConfig,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Defaults overridden by `QUERY_LOG_*` environment variables. Invalid
    /// values are logged through the current subscriber.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), but hands back the messages for
    /// invalid values instead of logging them, for callers that install
    /// logging from this very config.
    pub fn from_env_deferred() -> (Self, Vec<String>) {
        Self::from_lookup_deferred(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let (config, warnings) = Self::from_lookup_deferred(lookup);
        for warning in warnings {
            tracing::warn!("{}", warning);
        }
        config
    }

    pub fn from_lookup_deferred<F>(lookup: F) -> (Self, Vec<String>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let vars = Vars {
            lookup,
            warnings: RefCell::new(Vec::new()),
        };

        let config = Self {
            queue: QueueConfig {
                capacity: vars.parse("QUERY_LOG_QUEUE_CAPACITY", defaults.queue.capacity),
            },
            flush: FlushConfig {
                max_batch_size: vars.parse("QUERY_LOG_MAX_BATCH_SIZE", defaults.flush.max_batch_size),
                max_flush_interval: vars.secs(
                    "QUERY_LOG_FLUSH_INTERVAL_SECS",
                    defaults.flush.max_flush_interval,
                ),
            },
            retry: RetryConfig {
                max_attempts: vars.parse("QUERY_LOG_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
                initial_delay: vars.millis(
                    "QUERY_LOG_RETRY_INITIAL_DELAY_MS",
                    defaults.retry.initial_delay,
                ),
                multiplier: vars.parse("QUERY_LOG_RETRY_MULTIPLIER", defaults.retry.multiplier),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: vars.parse(
                    "QUERY_LOG_CIRCUIT_FAILURE_THRESHOLD",
                    defaults.circuit_breaker.failure_threshold,
                ),
                open_duration: vars.secs(
                    "QUERY_LOG_CIRCUIT_OPEN_SECS",
                    defaults.circuit_breaker.open_duration,
                ),
            },
            journal: JournalConfig {
                data_dir: vars
                    .get("QUERY_LOG_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.journal.data_dir),
            },
            sink: SinkConfig {
                endpoint: vars
                    .get("QUERY_LOG_SINK_ENDPOINT")
                    .unwrap_or(defaults.sink.endpoint),
                timeout: vars.secs("QUERY_LOG_SINK_TIMEOUT_SECS", defaults.sink.timeout),
            },
            logging: LoggingConfig {
                level: vars.get("QUERY_LOG_LEVEL").unwrap_or(defaults.logging.level),
                service_name: vars
                    .get("QUERY_LOG_SERVICE_NAME")
                    .unwrap_or(defaults.logging.service_name),
                json_format: vars.parse("QUERY_LOG_JSON", defaults.logging.json_format),
            },
        };
        (config, vars.warnings.into_inner())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.flush.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "max batch size must be at least 1".to_string(),
            ));
        }
        if self.flush.max_flush_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "circuit failure threshold must be at least 1".to_string(),
            ));
        }
        if self.sink.endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "sink endpoint must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

struct Vars<F> {
    lookup: F,
    warnings: RefCell<Vec<String>>,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Debug,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                self.warnings.borrow_mut().push(format!(
                    "Invalid value {:?} in {}, using default {:?}",
                    raw, key, default
                ));
                default
            }),
            None => default,
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(key, default.as_secs()))
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parse(key, default.as_millis() as u64))
    }
}
