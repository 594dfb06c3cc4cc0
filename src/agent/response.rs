//! Step results and step errors

use crate::core::AssetType;
use crate::provider::{PollError, ProviderError};
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error types for step execution
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// Fails the step and the pipeline
    #[error("{0}")]
    Permanent(String),

    /// Worth another attempt of the whole unit of work
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Timeout(String),

    #[error("storage failed: {0}")]
    Storage(StorageError),

    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn permanent(message: impl Into<String>) -> Self {
        StepError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        match self {
            StepError::Transient(_) => true,
            StepError::Storage(e) => e.retryable,
            _ => false,
        }
    }

    /// Classify a provider failure, naming the provider in the message
    pub fn from_provider(provider: &str, err: ProviderError) -> Self {
        match err {
            e if e.is_transient() => StepError::Transient(format!("{} provider: {}", provider, e)),
            ProviderError::InvalidCredentials => {
                StepError::Permanent(format!("{} provider rejected our credentials", provider))
            }
            ProviderError::QuotaExceeded => {
                StepError::Permanent(format!("{} provider quota exhausted", provider))
            }
            e => StepError::Permanent(format!("{} provider: {}", provider, e)),
        }
    }

    pub fn from_poll(provider: &str, err: PollError) -> Self {
        match err {
            PollError::TimedOut { task_id, attempts } => StepError::Timeout(format!(
                "{} task {} still unfinished after {} status checks",
                provider, task_id, attempts
            )),
            PollError::TaskFailed { message, .. } => {
                StepError::Permanent(format!("{} generation failed: {}", provider, message))
            }
            PollError::Cancelled => StepError::Cancelled,
            PollError::Provider(e) => StepError::from_provider(provider, e),
        }
    }
}

impl From<StorageError> for StepError {
    fn from(err: StorageError) -> Self {
        StepError::Storage(err)
    }
}

/// An artifact a step produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub asset_type: AssetType,

    /// Permanent URL, once the bytes are in durable storage
    pub url: Option<String>,

    /// Provider task still producing the artifact
    pub task_id: Option<String>,

    pub metadata: Value,
}

impl ArtifactRecord {
    pub fn stored(asset_type: AssetType, url: String, metadata: Value) -> Self {
        Self {
            asset_type,
            url: Some(url),
            task_id: None,
            metadata,
        }
    }

    /// Completion arrives later through the webhook reconciler
    pub fn pending(asset_type: AssetType, task_id: String, metadata: Value) -> Self {
        Self {
            asset_type,
            url: None,
            task_id: Some(task_id),
            metadata,
        }
    }
}

/// Result of a successful step
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Stored as the step's result and fed to later steps
    pub result: Value,

    pub artifacts: Vec<ArtifactRecord>,

    /// Provider task whose callback finishes the step; the step stays
    /// running until then and `result` is kept as its checkpoint
    pub awaiting: Option<String>,
}

impl StepOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            artifacts: Vec::new(),
            awaiting: None,
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactRecord) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn awaiting_callback(mut self, task_id: impl Into<String>) -> Self {
        self.awaiting = Some(task_id.into());
        self
    }
}
