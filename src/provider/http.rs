//! JSON-over-HTTP provider client
//!
//! Talks to a task API of the shape:
//!
//! - `POST {base_url}/tasks` with a [`TaskRequest`] body, answering `{"task_id": ".."}`
//! - `GET {base_url}/tasks/{task_id}`, answering a [`TaskStatus`] body

use crate::core::config::ProviderConfig;
use crate::provider::{Provider, ProviderError, TaskRequest, TaskStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Provider reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "id")]
    task_id: String,
}

impl HttpProvider {
    /// Create a client for one provider endpoint
    pub fn new(name: impl Into<String>, config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            name: name.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key(),
            client,
        })
    }

    #[cfg(test)]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    /// Turn a non-success response into a classified error
    async fn error_for(&self, response: Response) -> ProviderError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        warn!(
            provider = %self.name,
            status = status.as_u16(),
            "Provider returned an error response"
        );
        classify_status(status, body, retry_after)
    }
}

/// Map an HTTP error status to the provider error taxonomy
pub fn classify_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::InvalidCredentials,
        StatusCode::PAYMENT_REQUIRED => ProviderError::QuotaExceeded,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ProviderError::Timeout(format!("HTTP {}", status.as_u16()))
        }
        s if s.is_server_error() => {
            ProviderError::Unavailable(format!("HTTP {}: {}", s.as_u16(), body.trim()))
        }
        s => ProviderError::Rejected {
            status: s.as_u16(),
            message: body.trim().to_string(),
        },
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_decode() {
        ProviderError::Malformed(err.to_string())
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: &TaskRequest) -> Result<String, ProviderError> {
        debug!(provider = %self.name, operation = %request.operation, "Submitting task");

        let response = self
            .authorize(self.client.post(format!("{}/tasks", self.base_url)))
            .json(request)
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("submit response: {}", e)))?;

        if body.task_id.trim().is_empty() {
            return Err(ProviderError::Malformed("empty task id".to_string()));
        }
        Ok(body.task_id)
    }

    async fn status(&self, task_id: &str) -> Result<TaskStatus, ProviderError> {
        let response = self
            .authorize(self.client.get(format!("{}/tasks/{}", self.base_url, task_id)))
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }

        response
            .json::<TaskStatus>()
            .await
            .map_err(|e| ProviderError::Malformed(format!("status response: {}", e)))
    }
}
