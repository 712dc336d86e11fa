//! Query log record
//!
//! One `QueryLog` describes one completed request, on the success path or
//! the failure path. Records are built by the request handler, moved into the
//! ingestion queue and never touched again until they reach the sink or the
//! journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User id recorded when the request carried no identity.
pub const ANONYMOUS_USER: &str = "anonymous";

fn anonymous_user() -> String {
    ANONYMOUS_USER.to_string()
}

/// A single request observation.
///
/// `user_query` and `model` are always present. The derived fields
/// (`translated_intent`, `intent_response`, `sql_query`) are all `None` when
/// the request failed before translation finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLog {
    /// Row id assigned by the sink; unset until the record is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,

    #[serde(default = "anonymous_user")]
    pub user_id: String,

    pub user_query: String,

    /// Model or provider that served the request.
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_intent: Option<String>,

    /// Serialized intent structure returned by the translator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_response: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_query: Option<String>,

    /// Result summary on success, error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_summary: Option<String>,

    #[serde(default)]
    pub response_time_ms: u64,

    pub created_at: DateTime<Utc>,
}

impl QueryLog {
    /// Start a record for `user_query` served by `model`, stamped now.
    pub fn new(user_query: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: None,
            correlation_id: None,
            client_ip: None,
            user_id: anonymous_user(),
            user_query: user_query.into(),
            model: model.into(),
            translated_intent: None,
            intent_response: None,
            sql_query: None,
            response_summary: None,
            response_time_ms: 0,
            created_at: Utc::now(),
        }
    }

    /// Record for a request that failed before translation completed.
    pub fn failure(
        user_query: impl Into<String>,
        model: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(user_query, model).with_response_summary(error)
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    /// Set the user id; an empty id falls back to [`ANONYMOUS_USER`].
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        self.user_id = if user_id.trim().is_empty() {
            anonymous_user()
        } else {
            user_id
        };
        self
    }

    /// Attach the translation outputs of a successful request.
    pub fn with_translation(
        mut self,
        intent: impl Into<String>,
        intent_response: impl Into<String>,
        sql_query: impl Into<String>,
    ) -> Self {
        self.translated_intent = Some(intent.into());
        self.intent_response = Some(intent_response.into());
        self.sql_query = Some(sql_query.into());
        self
    }

    pub fn with_response_summary(mut self, summary: impl Into<String>) -> Self {
        self.response_summary = Some(summary.into());
        self
    }

    pub fn with_response_time_ms(mut self, elapsed_ms: u64) -> Self {
        self.response_time_ms = elapsed_ms;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// True when the request failed before any translation output existed.
    pub fn is_failure(&self) -> bool {
        self.translated_intent.is_none()
            && self.intent_response.is_none()
            && self.sql_query.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_record_has_no_derived_fields() {
        let log = QueryLog::failure("top products", "gpt-4o", "translator timed out");
        assert!(log.is_failure());
        assert_eq!(log.response_summary.as_deref(), Some("translator timed out"));
        assert_eq!(log.user_id, ANONYMOUS_USER);
    }

    #[test]
    fn test_success_record() {
        let log = QueryLog::new("top products", "claude")
            .with_user_id("u-17")
            .with_translation("TopN", "{\"n\":5}", "SELECT TOP 5 * FROM products")
            .with_response_time_ms(120);
        assert!(!log.is_failure());
        assert_eq!(log.user_id, "u-17");
        assert_eq!(log.response_time_ms, 120);
    }

    #[test]
    fn test_blank_user_id_is_anonymous() {
        let log = QueryLog::new("q", "m").with_user_id("   ");
        assert_eq!(log.user_id, ANONYMOUS_USER);
    }

    #[test]
    fn test_nulls_are_omitted_from_json() {
        let log = QueryLog::failure("q", "m", "boom");
        let json = serde_json::to_string(&log).unwrap();
        assert!(!json.contains("null"));
        assert!(!json.contains("sql_query"));
        assert!(json.contains("\"response_summary\":\"boom\""));
    }

    #[test]
    fn test_missing_user_id_defaults_to_anonymous() {
        let json = r#"{"user_query":"q","model":"m","created_at":"2025-01-01T00:00:00Z"}"#;
        let log: QueryLog = serde_json::from_str(json).unwrap();
        assert_eq!(log.user_id, ANONYMOUS_USER);
        assert_eq!(log.response_time_ms, 0);
        assert!(log.is_failure());
    }
}
