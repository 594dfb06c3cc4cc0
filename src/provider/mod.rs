//! External provider contract
//!
//! Every step delegates its work to exactly one provider: submit a task, then
//! ask for its status by task id.

pub mod http;
pub mod poller;
pub mod status;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub use http::HttpProvider;
pub use poller::{PollConfig, PollError, TaskPoller};
pub use status::TaskState;

/// Error types for provider calls
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("rate limited by provider{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invalid provider credentials")]
    InvalidCredentials,

    #[error("provider quota exceeded")]
    QuotaExceeded,

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Worth retrying at the unit-of-work level
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Unavailable(_)
                | ProviderError::Timeout(_)
        )
    }
}

/// A task submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Provider-side operation (e.g. "theme", "generate_music")
    pub operation: String,

    /// Operation input
    pub input: Value,

    /// Where the provider should post its completion callback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl TaskRequest {
    pub fn new(operation: impl Into<String>, input: Value) -> Self {
        Self {
            operation: operation.into(),
            input,
            callback_url: None,
        }
    }

    pub fn with_callback(mut self, url: Option<String>) -> Self {
        self.callback_url = url;
        self
    }
}

/// Raw status report of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Provider's own status word
    #[serde(alias = "status")]
    pub state: String,

    #[serde(default)]
    pub output: Option<Value>,

    #[serde(default)]
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn classify(&self) -> TaskState {
        TaskState::from_provider(&self.state)
    }

    /// URL of the produced artifact, if the output carries one
    pub fn output_url(&self) -> Option<&str> {
        self.output.as_ref().and_then(find_url)
    }
}

/// Locate an artifact URL in a provider payload
///
/// Accepts a bare string or any of `output_url`, `url`, `result.url`, `data.url`.
pub fn find_url(value: &Value) -> Option<&str> {
    if let Some(url) = value.as_str() {
        return Some(url).filter(|u| !u.trim().is_empty());
    }
    [
        value.get("output_url"),
        value.get("url"),
        value.get("result").and_then(|r| r.get("url")),
        value.get("data").and_then(|d| d.get("url")),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .find(|u| !u.trim().is_empty())
}

/// Trait for external providers - allows for different implementations
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Submit a task and return the provider's opaque task id
    async fn submit(&self, request: &TaskRequest) -> Result<String, ProviderError>;

    /// Fetch the status of a submitted task
    async fn status(&self, task_id: &str) -> Result<TaskStatus, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::Unavailable("502".into()).is_transient());
        assert!(ProviderError::Timeout("read".into()).is_transient());
        assert!(!ProviderError::InvalidCredentials.is_transient());
        assert!(!ProviderError::QuotaExceeded.is_transient());
        assert!(!ProviderError::Malformed("no id".into()).is_transient());
    }

    #[test]
    fn test_rate_limit_message() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.to_string(), "rate limited by provider (retry after 30s)");
    }

    #[test]
    fn test_find_url_aliases() {
        assert_eq!(find_url(&json!("https://a/x.mp3")), Some("https://a/x.mp3"));
        assert_eq!(find_url(&json!({"url": "https://a/1"})), Some("https://a/1"));
        assert_eq!(find_url(&json!({"result": {"url": "https://a/2"}})), Some("https://a/2"));
        assert_eq!(find_url(&json!({"data": {"url": "https://a/3"}})), Some("https://a/3"));
        assert_eq!(find_url(&json!({"output_url": "", "url": "https://a/4"})), Some("https://a/4"));
        assert_eq!(find_url(&json!({"title": "no url"})), None);
    }

    #[test]
    fn test_task_request_omits_missing_callback() {
        let request = TaskRequest::new("theme", json!({"theme": "sea"}));
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("callback_url").is_none());
    }
}
