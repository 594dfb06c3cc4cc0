//! Execution state models

use crate::core::StepId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Overall pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Pipeline has not started
    Pending,
    /// Pipeline is currently running
    Running,
    /// Pipeline is paused between steps
    Paused,
    /// Pipeline completed successfully
    Completed,
    /// Pipeline failed or was cancelled
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Paused => "paused",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PipelineStatus::Pending),
            "running" => Some(PipelineStatus::Running),
            "paused" => Some(PipelineStatus::Paused),
            "completed" => Some(PipelineStatus::Completed),
            "failed" => Some(PipelineStatus::Failed),
            _ => None,
        }
    }
}

/// Execution mode of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Continue to the next step as soon as one completes
    #[default]
    Auto,
    /// Wait for an explicit "run step" call between steps
    Manual,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Auto => "auto",
            PipelineMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(PipelineMode::Auto),
            "manual" => Some(PipelineMode::Manual),
            _ => None,
        }
    }
}

/// Flat status of a step, as reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// State of a single step
///
/// `result` only exists on `Completed` and `error` only on `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepState {
    /// Step has not started
    Pending,
    /// Step is currently running
    Running {
        started_at: DateTime<Utc>,
        progress: u8,
        /// External task whose callback finishes the step
        #[serde(default, skip_serializing_if = "Option::is_none")]
        awaiting: Option<String>,
        /// Partial work an interrupted attempt left for the next one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint: Option<Value>,
    },
    /// Step completed successfully
    Completed {
        result: Value,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// Step failed
    Failed {
        error: String,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
}

/// Illegal state machine transition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("step {step} cannot move from {from:?} to {to:?}")]
    Step {
        step: StepId,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("pipeline cannot {action} while {status}")]
    Pipeline {
        action: &'static str,
        status: &'static str,
    },

    #[error("step {0} is not part of this pipeline type")]
    UnknownStep(StepId),

    #[error("{0}")]
    Invalid(String),
}

impl StepState {
    pub fn status(&self) -> StepStatus {
        match self {
            StepState::Pending => StepStatus::Pending,
            StepState::Running { .. } => StepStatus::Running,
            StepState::Completed { .. } => StepStatus::Completed,
            StepState::Failed { .. } => StepStatus::Failed,
        }
    }

    pub fn progress(&self) -> u8 {
        match self {
            StepState::Pending => 0,
            StepState::Running { progress, .. } => *progress,
            StepState::Completed { .. } => 100,
            StepState::Failed { .. } => 0,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            StepState::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StepState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            StepState::Pending => None,
            StepState::Running { started_at, .. }
            | StepState::Completed { started_at, .. }
            | StepState::Failed { started_at, .. } => Some(*started_at),
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            StepState::Completed { completed_at, .. } | StepState::Failed { completed_at, .. } => {
                Some(*completed_at)
            }
            _ => None,
        }
    }

    /// Task id of the callback a running step waits for
    pub fn awaiting(&self) -> Option<&str> {
        match self {
            StepState::Running { awaiting, .. } => awaiting.as_deref(),
            _ => None,
        }
    }

    pub fn checkpoint(&self) -> Option<&Value> {
        match self {
            StepState::Running { checkpoint, .. } => checkpoint.as_ref(),
            _ => None,
        }
    }

    /// Check if step is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Completed { .. } | StepState::Failed { .. })
    }

    /// pending -> running; a running step stays running with its original start time
    pub fn begin(&self, step: StepId, now: DateTime<Utc>) -> Result<StepState, TransitionError> {
        match self {
            StepState::Pending => Ok(StepState::Running {
                started_at: now,
                progress: 0,
                awaiting: None,
                checkpoint: None,
            }),
            StepState::Running { .. } => Ok(self.clone()),
            _ => Err(self.illegal(step, StepStatus::Running)),
        }
    }

    /// running -> completed
    pub fn complete(
        &self,
        step: StepId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<StepState, TransitionError> {
        match self {
            StepState::Running { started_at, .. } => Ok(StepState::Completed {
                result,
                started_at: *started_at,
                completed_at: now,
            }),
            _ => Err(self.illegal(step, StepStatus::Completed)),
        }
    }

    /// running -> failed
    pub fn fail(
        &self,
        step: StepId,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<StepState, TransitionError> {
        match self {
            StepState::Running { started_at, .. } => Ok(StepState::Failed {
                error,
                started_at: *started_at,
                completed_at: now,
            }),
            _ => Err(self.illegal(step, StepStatus::Failed)),
        }
    }

    fn illegal(&self, step: StepId, to: StepStatus) -> TransitionError {
        TransitionError::Step {
            step,
            from: self.status(),
            to,
        }
    }
}

impl Default for StepState {
    fn default() -> Self {
        StepState::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_state_is_terminal() {
        let now = Utc::now();
        assert!(!StepState::Pending.is_terminal());
        assert!(!StepState::Running {
            started_at: now,
            progress: 10,
            awaiting: None,
            checkpoint: None,
        }
        .is_terminal());
        assert!(StepState::Completed {
            result: json!({}),
            started_at: now,
            completed_at: now
        }
        .is_terminal());
        assert!(StepState::Failed {
            error: "boom".to_string(),
            started_at: now,
            completed_at: now
        }
        .is_terminal());
    }

    #[test]
    fn test_forward_transitions() {
        let now = Utc::now();
        let running = StepState::Pending.begin(StepId::Theme, now).unwrap();
        assert_eq!(running.status(), StepStatus::Running);

        let done = running
            .complete(StepId::Theme, json!({"title": "Dawn"}), now)
            .unwrap();
        assert_eq!(done.status(), StepStatus::Completed);
        assert_eq!(done.progress(), 100);
        assert_eq!(done.result(), Some(&json!({"title": "Dawn"})));
        assert!(done.error().is_none());
    }

    #[test]
    fn test_running_reentry_keeps_start_time() {
        let first = Utc::now();
        let running = StepState::Pending.begin(StepId::Music, first).unwrap();
        let later = first + chrono::Duration::minutes(5);
        let again = running.begin(StepId::Music, later).unwrap();
        assert_eq!(again.started_at(), Some(first));
    }

    #[test]
    fn test_no_backward_transitions() {
        let now = Utc::now();
        let done = StepState::Pending
            .begin(StepId::Theme, now)
            .unwrap()
            .complete(StepId::Theme, json!(null), now)
            .unwrap();

        assert!(done.begin(StepId::Theme, now).is_err());
        assert!(done.fail(StepId::Theme, "late".into(), now).is_err());
        assert!(StepState::Pending
            .complete(StepId::Theme, json!(null), now)
            .is_err());

        let failed = StepState::Pending
            .begin(StepId::Theme, now)
            .unwrap()
            .fail(StepId::Theme, "provider said no".into(), now)
            .unwrap();
        assert_eq!(failed.error(), Some("provider said no"));
        assert!(failed.result().is_none());
        assert!(failed.begin(StepId::Theme, now).is_err());
    }

    #[test]
    fn test_step_state_serializes_with_status_tag() {
        let json = serde_json::to_value(StepState::Pending).unwrap();
        assert_eq!(json, json!({"status": "pending"}));
    }

    #[test]
    fn test_awaiting_marker_survives_storage() {
        let now = Utc::now();
        let plain = StepState::Pending.begin(StepId::Composition, now).unwrap();
        assert!(plain.awaiting().is_none());
        assert!(serde_json::to_value(&plain).unwrap().get("awaiting").is_none());

        let waiting = StepState::Running {
            started_at: now,
            progress: 90,
            awaiting: Some("renderer-1".into()),
            checkpoint: None,
        };
        let stored: StepState = serde_json::from_value(serde_json::to_value(&waiting).unwrap()).unwrap();
        assert_eq!(stored.awaiting(), Some("renderer-1"));
        assert_eq!(stored.begin(StepId::Composition, now).unwrap().awaiting(), Some("renderer-1"));
    }
}
