//! Provider status vocabulary
//!
//! Providers report task status with inconsistent words ("success", "done",
//! "completed" all mean the same thing). Both the poller and the webhook
//! reconciler classify through [`TaskState::from_provider`] so the two paths
//! can never disagree about what a status string means.

use serde::{Deserialize, Serialize};

/// Normalized state of an external task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

const SUCCESS_WORDS: &[&str] = &["completed", "success", "done"];
const FAILURE_WORDS: &[&str] = &["failed", "error"];
const PENDING_WORDS: &[&str] = &["pending", "queued"];

impl TaskState {
    /// Classify a raw provider status (case-insensitive, surrounding whitespace ignored)
    ///
    /// Unknown words mean the task is still running.
    pub fn from_provider(raw: &str) -> Self {
        let word = raw.trim().to_ascii_lowercase();
        if SUCCESS_WORDS.contains(&word.as_str()) {
            TaskState::Completed
        } else if FAILURE_WORDS.contains(&word.as_str()) {
            TaskState::Failed
        } else if PENDING_WORDS.contains(&word.as_str()) {
            TaskState::Pending
        } else {
            TaskState::Running
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_vocabulary() {
        for raw in ["completed", "success", "done", "SUCCESS", " Done "] {
            assert_eq!(TaskState::from_provider(raw), TaskState::Completed, "{raw}");
        }
    }

    #[test]
    fn test_failure_vocabulary() {
        for raw in ["failed", "error", "Error"] {
            assert_eq!(TaskState::from_provider(raw), TaskState::Failed, "{raw}");
        }
    }

    #[test]
    fn test_unknown_words_are_running() {
        for raw in ["processing", "rendering", "", "succeeded-ish"] {
            assert_eq!(TaskState::from_provider(raw), TaskState::Running, "{raw}");
        }
        assert_eq!(TaskState::from_provider("queued"), TaskState::Pending);
        assert!(!TaskState::Pending.is_terminal());
        assert!(TaskState::Failed.is_terminal());
    }
}
