//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` wins over the
//! configured level when it is set.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::error::PipelineError;

static LOGGING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// Attached to the startup event so aggregated logs can be told apart
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "query-log-relay".to_string(),
            json_format: false,
        }
    }
}

/// Initializes the structured logging system. Later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) -> Result<(), PipelineError> {
    LOGGING_INITIALIZED.get_or_try_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
        let subscriber = Registry::default().with(filter);

        let installed = if config.json_format {
            let json_layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_target(true);
            tracing::subscriber::set_global_default(subscriber.with(json_layer))
        } else {
            let text_layer = fmt::layer().with_target(true);
            tracing::subscriber::set_global_default(subscriber.with(text_layer))
        };
        installed.map_err(|e| PipelineError::Logging(e.to_string()))?;

        tracing::info!(
            service = %config.service_name,
            level = %config.level,
            json = config.json_format,
            "Logging initialized"
        );
        Ok::<(), PipelineError>(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            ..LoggingConfig::default()
        };
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }
}
