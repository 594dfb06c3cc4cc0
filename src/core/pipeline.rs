//! Pipeline record and its state machine

use crate::core::{
    context::{RunConfig, StepContext},
    registry::{PipelineType, StepId},
    state::{PipelineMode, PipelineStatus, StepState, StepStatus, TransitionError},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Error message recorded on a cancelled pipeline
pub const CANCELLED_MESSAGE: &str = "Pipeline cancelled by operator";

/// One generation run for one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub project_id: Uuid,

    #[serde(rename = "type")]
    pub kind: PipelineType,
    pub mode: PipelineMode,
    pub status: PipelineStatus,

    /// Always a registry step of `kind`, or None before start
    pub current_step: Option<StepId>,
    pub current_step_progress: u8,
    pub steps_state: BTreeMap<StepId, StepState>,

    /// Run-level configuration fed to every step
    pub run: RunConfig,

    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    /// The failed pipeline this run retries
    pub retry_of: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What happens after a step completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// `current_step` moved to the given step
    Next(StepId),
    /// The last registry step completed
    Finished,
}

impl Pipeline {
    /// Create a pending pipeline with every registry step pending
    pub fn new(project_id: Uuid, kind: PipelineType, mode: PipelineMode, run: RunConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            kind,
            mode,
            status: PipelineStatus::Pending,
            current_step: None,
            current_step_progress: 0,
            steps_state: kind
                .steps()
                .iter()
                .map(|step| (*step, StepState::Pending))
                .collect(),
            run,
            error_message: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            retry_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Get the state of a step
    pub fn step_state(&self, step: StepId) -> Option<&StepState> {
        self.steps_state.get(&step)
    }

    /// State of the current step, if any
    pub fn current_state(&self) -> Option<&StepState> {
        self.current_step.and_then(|step| self.step_state(step))
    }

    /// Running with the current step not yet started
    pub fn is_idle(&self) -> bool {
        self.status == PipelineStatus::Running
            && matches!(self.current_state(), Some(StepState::Pending))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    /// pending -> running, positioned on the first step that has not completed
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<StepId, TransitionError> {
        self.require(PipelineStatus::Pending, "start")?;

        let first = self
            .kind
            .steps()
            .iter()
            .copied()
            .find(|step| !matches!(self.step_state(*step), Some(StepState::Completed { .. })))
            .ok_or_else(|| TransitionError::Invalid("no step left to run".to_string()))?;

        self.status = PipelineStatus::Running;
        self.current_step = Some(first);
        self.current_step_progress = 0;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(first)
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(PipelineStatus::Running, "pause")?;
        self.status = PipelineStatus::Paused;
        self.updated_at = now;
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(PipelineStatus::Paused, "resume")?;
        self.status = PipelineStatus::Running;
        self.updated_at = now;
        Ok(())
    }

    /// Move to failed with a cancellation error; a running step fails with it
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.illegal("cancel"));
        }
        self.abort(CANCELLED_MESSAGE, now)?;
        self.cancelled_at = Some(now);
        Ok(())
    }

    /// Fail the pipeline from outside its steps
    ///
    /// A running current step fails with the same message; a pending one
    /// stays pending.
    pub fn abort(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.illegal("abort"));
        }
        let message = message.into();

        if let Some(step) = self.current_step {
            if let Some(state @ StepState::Running { .. }) = self.steps_state.get(&step) {
                let failed = state.fail(step, message.clone(), now)?;
                self.steps_state.insert(step, failed);
            }
        }

        self.status = PipelineStatus::Failed;
        self.error_message = Some(message);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Mark the current step as running
    pub fn begin_step(&mut self, step: StepId, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.require(PipelineStatus::Running, "run a step")?;
        self.require_current(step)?;

        let state = self.state_of(step)?.begin(step, now)?;
        let progress = state.progress();
        self.steps_state.insert(step, state);
        self.current_step_progress = progress;
        self.updated_at = now;
        Ok(())
    }

    /// Record a step result and advance `current_step`
    ///
    /// Allowed while paused: the result is kept, but nothing auto-continues.
    pub fn complete_step(
        &mut self,
        step: StepId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<Advance, TransitionError> {
        if self.status.is_terminal() || self.status == PipelineStatus::Pending {
            return Err(self.illegal("complete a step"));
        }
        self.require_current(step)?;

        let state = self.state_of(step)?.complete(step, result, now)?;
        self.steps_state.insert(step, state);
        self.updated_at = now;

        match self.kind.next_step(step) {
            Some(next) => {
                self.current_step = Some(next);
                self.current_step_progress = 0;
                Ok(Advance::Next(next))
            }
            None => {
                self.current_step_progress = 100;
                self.status = PipelineStatus::Completed;
                self.completed_at = Some(now);
                Ok(Advance::Finished)
            }
        }
    }

    /// Record a step failure; the pipeline fails with the same message
    pub fn fail_step(
        &mut self,
        step: StepId,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status.is_terminal() || self.status == PipelineStatus::Pending {
            return Err(self.illegal("fail a step"));
        }
        self.require_current(step)?;

        let state = self.state_of(step)?.fail(step, error.clone(), now)?;
        self.steps_state.insert(step, state);
        self.status = PipelineStatus::Failed;
        self.error_message = Some(error);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Leave the running step open until the callback of `task_id` arrives
    pub fn await_callback(
        &mut self,
        step: StepId,
        task_id: String,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status.is_terminal() || self.status == PipelineStatus::Pending {
            return Err(self.illegal("wait on a step"));
        }
        self.require_current(step)?;

        match self.steps_state.get_mut(&step) {
            Some(StepState::Running { awaiting, .. }) => {
                *awaiting = Some(task_id);
                self.updated_at = now;
                Ok(())
            }
            Some(other) => Err(TransitionError::Step {
                step,
                from: other.status(),
                to: StepStatus::Running,
            }),
            None => Err(TransitionError::UnknownStep(step)),
        }
    }

    /// The running step waiting on `task_id`, if any
    pub fn step_awaiting(&self, task_id: &str) -> Option<StepId> {
        let step = self.current_step?;
        (self.step_state(step)?.awaiting() == Some(task_id)).then_some(step)
    }

    /// Build a fresh pending pipeline that re-runs the failed step
    ///
    /// Completed step results carry over; the failed step and everything
    /// after it start again from pending.
    pub fn retry(&self) -> Result<Pipeline, TransitionError> {
        if self.status != PipelineStatus::Failed || self.is_cancelled() {
            return Err(self.illegal("retry"));
        }

        let mut retry = Pipeline::new(self.project_id, self.kind, self.mode, self.run.clone());
        for (step, state) in &self.steps_state {
            if matches!(state, StepState::Completed { .. }) {
                retry.steps_state.insert(*step, state.clone());
            }
        }
        retry.retry_of = Some(self.id);
        Ok(retry)
    }

    /// Set progress of the running step (0-100)
    pub fn set_progress(&mut self, step: StepId, value: u8) -> Result<(), TransitionError> {
        self.require_current(step)?;
        let value = value.min(100);
        if let Some(StepState::Running { progress, .. }) = self.steps_state.get_mut(&step) {
            *progress = value;
        }
        self.current_step_progress = value;
        Ok(())
    }

    /// Keep partial work of the running step for a later attempt
    pub fn set_checkpoint(&mut self, step: StepId, value: Value) -> Result<(), TransitionError> {
        self.require_current(step)?;
        if let Some(StepState::Running { checkpoint, .. }) = self.steps_state.get_mut(&step) {
            *checkpoint = Some(value);
        }
        Ok(())
    }

    /// Create execution context from completed step results
    ///
    /// A checkpoint left on the running current step is handed back too.
    pub fn context(&self) -> StepContext {
        let mut context = StepContext::new(self.id, self.project_id, self.run.clone());
        for (step, state) in &self.steps_state {
            if let Some(result) = state.result() {
                context.results.insert(*step, result.clone());
            }
        }
        context.checkpoint = self.current_state().and_then(StepState::checkpoint).cloned();
        context
    }

    fn state_of(&self, step: StepId) -> Result<&StepState, TransitionError> {
        self.steps_state
            .get(&step)
            .ok_or(TransitionError::UnknownStep(step))
    }

    fn require(&self, status: PipelineStatus, action: &'static str) -> Result<(), TransitionError> {
        if self.status == status {
            Ok(())
        } else {
            Err(self.illegal(action))
        }
    }

    fn require_current(&self, step: StepId) -> Result<(), TransitionError> {
        if !self.kind.contains(step) {
            return Err(TransitionError::UnknownStep(step));
        }
        if self.current_step != Some(step) {
            return Err(TransitionError::Invalid(format!(
                "step {} is not the current step ({})",
                step,
                self.current_step
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string())
            )));
        }
        Ok(())
    }

    fn illegal(&self, action: &'static str) -> TransitionError {
        TransitionError::Pipeline {
            action,
            status: self.status.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn soundtrack(mode: PipelineMode) -> Pipeline {
        Pipeline::new(
            Uuid::new_v4(),
            PipelineType::Soundtrack,
            mode,
            RunConfig::new("rainy harbour"),
        )
    }

    #[test]
    fn test_new_pipeline_has_pending_steps() {
        let pipeline = soundtrack(PipelineMode::Auto);
        assert_eq!(pipeline.status, PipelineStatus::Pending);
        assert_eq!(pipeline.current_step, None);
        assert_eq!(pipeline.steps_state.len(), 2);
        assert!(pipeline
            .steps_state
            .values()
            .all(|s| *s == StepState::Pending));
    }

    #[test]
    fn test_start_positions_on_first_step() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        assert_eq!(pipeline.start(now).unwrap(), StepId::Theme);
        assert_eq!(pipeline.status, PipelineStatus::Running);
        assert_eq!(pipeline.started_at, Some(now));
        assert!(pipeline.is_idle());
        assert!(pipeline.start(now).is_err());
    }

    #[test]
    fn test_completing_last_step_finishes_pipeline() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        pipeline.start(now).unwrap();

        pipeline.begin_step(StepId::Theme, now).unwrap();
        let advance = pipeline
            .complete_step(StepId::Theme, json!({"title": "Harbour"}), now)
            .unwrap();
        assert_eq!(advance, Advance::Next(StepId::Music));
        assert_eq!(pipeline.current_step, Some(StepId::Music));

        pipeline.begin_step(StepId::Music, now).unwrap();
        let advance = pipeline
            .complete_step(StepId::Music, json!({"audio_url": "x"}), now)
            .unwrap();
        assert_eq!(advance, Advance::Finished);
        assert_eq!(pipeline.status, PipelineStatus::Completed);
        assert_eq!(pipeline.current_step, Some(StepId::Music));
        assert_eq!(pipeline.current_step_progress, 100);
    }

    #[test]
    fn test_step_failure_fails_pipeline() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        pipeline.start(now).unwrap();
        pipeline.begin_step(StepId::Theme, now).unwrap();
        pipeline
            .fail_step(StepId::Theme, "invalid API key".to_string(), now)
            .unwrap();

        assert_eq!(pipeline.status, PipelineStatus::Failed);
        assert_eq!(pipeline.error_message.as_deref(), Some("invalid API key"));
        assert_eq!(
            pipeline.step_state(StepId::Theme).unwrap().status(),
            StepStatus::Failed
        );
    }

    #[test]
    fn test_only_current_step_may_run() {
        let mut pipeline = soundtrack(PipelineMode::Manual);
        let now = Utc::now();
        pipeline.start(now).unwrap();
        assert!(pipeline.begin_step(StepId::Music, now).is_err());
        assert!(pipeline.begin_step(StepId::Images, now).is_err());
    }

    #[test]
    fn test_pause_and_resume() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        assert!(pipeline.pause(now).is_err());

        pipeline.start(now).unwrap();
        pipeline.pause(now).unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Paused);
        assert!(pipeline.begin_step(StepId::Theme, now).is_err());
        assert!(pipeline.pause(now).is_err());

        pipeline.resume(now).unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Running);
        assert_eq!(pipeline.current_step, Some(StepId::Theme));
    }

    #[test]
    fn test_step_finishing_while_paused_advances() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        pipeline.start(now).unwrap();
        pipeline.begin_step(StepId::Theme, now).unwrap();
        pipeline.pause(now).unwrap();

        let advance = pipeline
            .complete_step(StepId::Theme, json!({}), now)
            .unwrap();
        assert_eq!(advance, Advance::Next(StepId::Music));
        assert_eq!(pipeline.status, PipelineStatus::Paused);
    }

    #[test]
    fn test_cancel_fails_running_step() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        pipeline.start(now).unwrap();
        pipeline.begin_step(StepId::Theme, now).unwrap();
        pipeline.cancel(now).unwrap();

        assert!(pipeline.is_cancelled());
        assert_eq!(pipeline.status, PipelineStatus::Failed);
        assert_eq!(pipeline.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert_eq!(
            pipeline.step_state(StepId::Theme).unwrap().error(),
            Some(CANCELLED_MESSAGE)
        );
        assert!(pipeline.cancel(now).is_err());
        assert!(pipeline.complete_step(StepId::Theme, json!({}), now).is_err());
    }

    #[test]
    fn test_abort_leaves_pending_step_pending() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        pipeline.start(now).unwrap();
        pipeline.abort("worker lost", now).unwrap();

        assert_eq!(pipeline.status, PipelineStatus::Failed);
        assert!(!pipeline.is_cancelled());
        assert_eq!(pipeline.step_state(StepId::Theme), Some(&StepState::Pending));
        assert!(pipeline.retry().is_ok());
    }

    #[test]
    fn test_retry_copies_completed_steps() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        pipeline.start(now).unwrap();
        pipeline.begin_step(StepId::Theme, now).unwrap();
        pipeline
            .complete_step(StepId::Theme, json!({"title": "T"}), now)
            .unwrap();
        pipeline.begin_step(StepId::Music, now).unwrap();
        pipeline
            .fail_step(StepId::Music, "quota exceeded".to_string(), now)
            .unwrap();

        let mut retry = pipeline.retry().unwrap();
        assert_ne!(retry.id, pipeline.id);
        assert_eq!(retry.retry_of, Some(pipeline.id));
        assert_eq!(
            retry.step_state(StepId::Theme).unwrap().result(),
            Some(&json!({"title": "T"}))
        );
        assert_eq!(retry.step_state(StepId::Music), Some(&StepState::Pending));

        assert_eq!(retry.start(now).unwrap(), StepId::Music);
    }

    #[test]
    fn test_step_waits_for_callback_then_finishes() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        pipeline.start(now).unwrap();
        assert!(pipeline
            .await_callback(StepId::Theme, "t-1".into(), now)
            .is_err());

        pipeline.begin_step(StepId::Theme, now).unwrap();
        pipeline.await_callback(StepId::Theme, "t-1".into(), now).unwrap();
        assert_eq!(pipeline.step_awaiting("t-1"), Some(StepId::Theme));
        assert_eq!(pipeline.step_awaiting("t-2"), None);
        assert_eq!(
            pipeline.step_state(StepId::Theme).unwrap().status(),
            StepStatus::Running
        );

        pipeline
            .complete_step(StepId::Theme, json!({"title": "T"}), now)
            .unwrap();
        assert_eq!(pipeline.step_awaiting("t-1"), None);
    }

    #[test]
    fn test_cancelled_pipeline_cannot_retry() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        pipeline.cancel(Utc::now()).unwrap();
        assert!(pipeline.retry().is_err());
    }

    #[test]
    fn test_context_contains_completed_results() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        pipeline.start(now).unwrap();
        pipeline.begin_step(StepId::Theme, now).unwrap();
        pipeline
            .complete_step(StepId::Theme, json!({"mood": "calm"}), now)
            .unwrap();

        let context = pipeline.context();
        assert_eq!(context.pipeline_id, pipeline.id);
        assert_eq!(context.result_str(StepId::Theme, "mood"), Some("calm"));
        assert!(context.result(StepId::Music).is_none());
        assert!(context.checkpoint.is_none());

        pipeline.begin_step(StepId::Music, now).unwrap();
        pipeline
            .set_checkpoint(StepId::Music, json!({"done": 1}))
            .unwrap();
        assert_eq!(pipeline.context().checkpoint, Some(json!({"done": 1})));
    }

    #[test]
    fn test_progress_clamped() {
        let mut pipeline = soundtrack(PipelineMode::Auto);
        let now = Utc::now();
        pipeline.start(now).unwrap();
        pipeline.begin_step(StepId::Theme, now).unwrap();
        pipeline.set_progress(StepId::Theme, 250).unwrap();
        assert_eq!(pipeline.current_step_progress, 100);
        assert_eq!(pipeline.step_state(StepId::Theme).unwrap().progress(), 100);
    }
}
