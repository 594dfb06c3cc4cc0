//! External task poller
//!
//! Submit-then-poll over any [`Provider`]. The wait is an ordinary future: it
//! polls at a fixed interval, gives up after a bounded number of attempts, and
//! stops between polls as soon as its cancellation token fires.

use crate::core::config::ProviderConfig;
use crate::provider::{Provider, ProviderError, TaskRequest, TaskState, TaskStatus};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Poll cadence for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl From<&ProviderConfig> for PollConfig {
    fn from(config: &ProviderConfig) -> Self {
        Self::new(config.poll_interval(), config.max_attempts)
    }
}

/// Error types for a submit-and-wait cycle
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PollError {
    #[error("task {task_id} did not finish after {attempts} status checks")]
    TimedOut { task_id: String, attempts: u32 },

    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("polling cancelled")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Waits for external tasks to reach a terminal state
#[derive(Debug, Clone)]
pub struct TaskPoller {
    config: PollConfig,
}

impl TaskPoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> PollConfig {
        self.config
    }

    /// Submit a task, then wait for it
    ///
    /// Returns the provider task id alongside the terminal status.
    pub async fn submit_and_wait(
        &self,
        provider: &dyn Provider,
        request: &TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<(String, TaskStatus), PollError> {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        let task_id = provider.submit(request).await?;
        debug!(provider = provider.name(), task_id = %task_id, "Task submitted");
        let status = self.wait(provider, &task_id, cancel).await?;
        Ok((task_id, status))
    }

    /// Poll a submitted task until it completes, fails, or attempts run out
    ///
    /// A transient error on a status check uses up that attempt; any other
    /// provider error ends the wait.
    pub async fn wait(
        &self,
        provider: &dyn Provider,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskStatus, PollError> {
        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }

            match provider.status(task_id).await {
                Ok(status) => match status.classify() {
                    TaskState::Completed => return Ok(status),
                    TaskState::Failed => {
                        return Err(PollError::TaskFailed {
                            task_id: task_id.to_string(),
                            message: status
                                .error
                                .unwrap_or_else(|| "provider reported failure".to_string()),
                        })
                    }
                    state => {
                        debug!(task_id, attempt, ?state, "Task not finished yet");
                    }
                },
                Err(e) if e.is_transient() => {
                    warn!(task_id, attempt, error = %e, "Status check failed, will poll again");
                }
                Err(e) => return Err(e.into()),
            }

            if attempt == self.config.max_attempts {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        Err(PollError::TimedOut {
            task_id: task_id.to_string(),
            attempts: self.config.max_attempts,
        })
    }
}
