//! Pipeline engine - drives pipelines through their steps
//!
//! The engine owns every pipeline transition. Control operations (start,
//! pause, resume, cancel, run-step, retry) only change state; the work queue
//! calls [`PipelineEngine::drive`] to actually execute steps.

use crate::{
    agent::{ArtifactRecord, StepOutput},
    core::{
        Advance, Asset, JobLog, LogType, Pipeline, PipelineMode, PipelineStatus, PipelineType,
        ProjectStatus, RunConfig, StepId, StepState, StepStatus, TransitionError,
    },
    events::{EventEmitter, PipelineEvent, PipelineTopic, TopicHub},
    execution::{StepExecutor, StepOutcome},
    persistence::Store,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ENGINE_AGENT: &str = "engine";

/// Error types for pipeline operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pipeline {0} not found")]
    PipelineNotFound(Uuid),

    #[error("project {0} not found")]
    ProjectNotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{0}")]
    Invalid(String),

    /// The step hit a transient error and stays running for another attempt
    #[error("step {step} interrupted: {message}")]
    Transient { step: StepId, message: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Worth retrying the unit of work
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient { .. } | EngineError::Store(_))
    }
}

/// Main pipeline engine
pub struct PipelineEngine {
    store: Arc<dyn Store>,
    emitter: EventEmitter,
    executor: StepExecutor,
    shutdown: CancellationToken,
    in_flight: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl PipelineEngine {
    pub fn new(store: Arc<dyn Store>, hub: Arc<TopicHub>, executor: StepExecutor) -> Self {
        Self {
            emitter: EventEmitter::new(store.clone(), hub),
            store,
            executor,
            shutdown: CancellationToken::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Subscribe to a pipeline's live events
    pub fn subscribe(&self, pipeline_id: Uuid) -> broadcast::Receiver<PipelineEvent> {
        self.emitter.hub().subscribe(pipeline_id)
    }

    /// Interrupt every running step (their pipelines stay running)
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn load(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        self.store
            .load_pipeline(pipeline_id)
            .await?
            .ok_or(EngineError::PipelineNotFound(pipeline_id))
    }

    /// Create a pending pipeline for an existing project
    pub async fn create(
        &self,
        project_id: Uuid,
        kind: PipelineType,
        mode: PipelineMode,
        run: RunConfig,
    ) -> Result<Pipeline, EngineError> {
        if self.store.load_project(project_id).await?.is_none() {
            return Err(EngineError::ProjectNotFound(project_id));
        }
        let pipeline = Pipeline::new(project_id, kind, mode, run);
        self.store.save_pipeline(&pipeline).await?;
        info!(pipeline_id = %pipeline.id, kind = %kind, mode = mode.as_str(), "Pipeline created");
        Ok(pipeline)
    }

    /// pending -> running, positioned on the first step
    pub async fn start(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        let mut pipeline = self.load(pipeline_id).await?;
        let first = pipeline.start(Utc::now())?;
        self.commit(&pipeline).await?;

        info!("Starting pipeline {} at step {}", pipeline.id, first);
        self.engine_log(&pipeline, LogType::Info, format!("Pipeline started at step {}", first))
            .await;
        Ok(pipeline)
    }

    pub async fn pause(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        let mut pipeline = self.load(pipeline_id).await?;
        pipeline.pause(Utc::now())?;
        self.commit(&pipeline).await?;
        self.engine_log(&pipeline, LogType::Info, "Pipeline paused").await;
        Ok(pipeline)
    }

    pub async fn resume(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        let mut pipeline = self.load(pipeline_id).await?;
        pipeline.resume(Utc::now())?;
        self.commit(&pipeline).await?;
        self.engine_log(&pipeline, LogType::Info, "Pipeline resumed").await;
        Ok(pipeline)
    }

    /// Fail the pipeline with a cancellation error and interrupt its running step
    ///
    /// Tasks already handed to providers keep running; their results are discarded.
    pub async fn cancel(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        let mut pipeline = self.load(pipeline_id).await?;
        pipeline.cancel(Utc::now())?;
        self.commit(&pipeline).await?;

        if let Some(token) = self.token_for(pipeline_id) {
            token.cancel();
        }

        warn!("Pipeline {} cancelled", pipeline.id);
        self.engine_log(&pipeline, LogType::Error, crate::core::CANCELLED_MESSAGE)
            .await;
        self.publish_step_status(&pipeline);
        self.emitter.hub().close(pipeline_id);
        Ok(pipeline)
    }

    /// Check that a manual pipeline may run its current step now
    pub async fn run_step(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        let pipeline = self.load(pipeline_id).await?;
        if pipeline.mode != PipelineMode::Manual {
            return Err(EngineError::Invalid(
                "running a single step is only possible in manual mode".to_string(),
            ));
        }
        if pipeline.status != PipelineStatus::Running {
            return Err(TransitionError::Pipeline {
                action: "run a step",
                status: pipeline.status.as_str(),
            }
            .into());
        }
        if !pipeline.is_idle() {
            return Err(EngineError::Invalid(format!(
                "step {} is already running",
                pipeline.current_step.map(|s| s.as_str()).unwrap_or("?")
            )));
        }
        Ok(pipeline)
    }

    /// Start a new pipeline that re-runs the failed step of this one
    pub async fn retry(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        let failed = self.load(pipeline_id).await?;
        let mut retry = failed.retry()?;
        let step = retry.start(Utc::now())?;
        self.store.save_pipeline(&retry).await?;

        info!("Retrying pipeline {} as {} from step {}", failed.id, retry.id, step);
        self.engine_log(
            &retry,
            LogType::Info,
            format!("Retry of pipeline {} started at step {}", failed.id, step),
        )
        .await;
        Ok(retry)
    }

    /// Give up on a step whose transient errors exhausted the retry budget
    pub async fn abandon(&self, pipeline_id: Uuid, cause: &str) -> Result<Pipeline, EngineError> {
        let mut pipeline = self.load(pipeline_id).await?;
        if pipeline.status.is_terminal() {
            return Ok(pipeline);
        }
        pipeline.abort(cause, Utc::now())?;
        if !self.store.save_pipeline(&pipeline).await? {
            return self.load(pipeline_id).await;
        }

        error!("Pipeline {} abandoned: {}", pipeline.id, cause);
        self.engine_log(&pipeline, LogType::Error, format!("Gave up after retries: {}", cause))
            .await;
        self.publish_step_status(&pipeline);
        self.emitter.hub().close(pipeline_id);
        Ok(pipeline)
    }

    /// Execute the current step; in auto mode keep going until the pipeline
    /// finishes, fails, pauses, or a step is left waiting on a callback
    ///
    /// Returns the pipeline as last stored. A transient step error is returned
    /// as [`EngineError::Transient`] with the step still running.
    pub async fn drive(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        loop {
            let mut pipeline = self.load(pipeline_id).await?;
            if pipeline.status != PipelineStatus::Running {
                debug!(pipeline_id = %pipeline_id, status = pipeline.status.as_str(), "Nothing to drive");
                return Ok(pipeline);
            }
            let Some(step) = pipeline.current_step else {
                return Ok(pipeline);
            };
            if !matches!(
                pipeline.step_state(step),
                Some(StepState::Pending | StepState::Running { .. })
            ) {
                return Ok(pipeline);
            }
            if let Some(task_id) = pipeline.step_state(step).and_then(StepState::awaiting) {
                debug!(pipeline_id = %pipeline_id, step = %step, task_id, "Step waits for its callback");
                return Ok(pipeline);
            }

            let Some(token) = self.claim(pipeline_id) else {
                debug!(pipeline_id = %pipeline_id, "Step already executing in this process");
                return Ok(pipeline);
            };

            let result = self.run_current(&mut pipeline, step, &token).await;
            self.release(pipeline_id);

            match result? {
                Some(Advance::Next(_)) if pipeline.mode == PipelineMode::Auto => continue,
                _ => {
                    let pipeline = self.load(pipeline_id).await?;
                    if pipeline.status.is_terminal() {
                        self.emitter.hub().close(pipeline_id);
                    }
                    return Ok(pipeline);
                }
            }
        }
    }

    /// Run one step. Returns how the pipeline advanced, or None if the step
    /// did not complete (or its result was discarded).
    async fn run_current(
        &self,
        pipeline: &mut Pipeline,
        step: StepId,
        token: &CancellationToken,
    ) -> Result<Option<Advance>, EngineError> {
        let topic = self.emitter.topic(pipeline.id);
        pipeline.begin_step(step, Utc::now())?;
        if !self.store.save_pipeline(pipeline).await? {
            return Ok(None);
        }
        self.emitter
            .step_status(&topic, step, StepStatus::Running, pipeline.current_step_progress, None);
        self.log(&topic, step.as_str(), LogType::Info, format!("Step {} started", step), None)
            .await;

        let context = pipeline.context();
        let reporter = self.emitter.reporter(pipeline.id, step);
        let outcome = self.executor.execute(step, &context, &reporter, token).await;

        // Pick up progress, pause and cancellation written while the step ran
        *pipeline = self.load(pipeline.id).await?;
        if pipeline.status.is_terminal() {
            info!("Discarding result of step {} for finished pipeline {}", step, pipeline.id);
            return Ok(None);
        }

        let now = Utc::now();
        match outcome {
            StepOutcome::Completed(output) if output.awaiting.is_some() => {
                self.park(pipeline, step, output).await?;
                Ok(None)
            }
            StepOutcome::Completed(output) => {
                self.record_artifacts(pipeline, step, &output.artifacts).await?;

                let advance = pipeline.complete_step(step, output.result.clone(), now)?;
                if !self.store.save_pipeline(pipeline).await? {
                    info!("Pipeline {} finished while step {} ran; result discarded", pipeline.id, step);
                    return Ok(None);
                }

                let next_step = match advance {
                    Advance::Next(next) => Some(next),
                    Advance::Finished => None,
                };
                self.log(
                    &topic,
                    step.as_str(),
                    LogType::Result,
                    format!("Step {} completed", step),
                    Some(output.result.clone()),
                )
                .await;
                self.emitter.step_status(&topic, step, StepStatus::Completed, 100, None);
                self.emitter.step_completed(&topic, step, output.result, next_step);

                if advance == Advance::Finished {
                    info!("Pipeline {} completed", pipeline.id);
                    self.log(&topic, ENGINE_AGENT, LogType::Info, "Pipeline completed", None)
                        .await;
                }
                Ok(Some(advance))
            }
            StepOutcome::Failed(message) => {
                pipeline.fail_step(step, message.clone(), now)?;
                if self.store.save_pipeline(pipeline).await? {
                    error!("Pipeline {} failed at step {}: {}", pipeline.id, step, message);
                    self.log(&topic, step.as_str(), LogType::Error, message.clone(), None)
                        .await;
                    self.emitter
                        .step_status(&topic, step, StepStatus::Failed, pipeline.current_step_progress, Some(message));
                }
                Ok(None)
            }
            StepOutcome::Transient(message) => {
                self.log(
                    &topic,
                    step.as_str(),
                    LogType::Error,
                    format!("Transient error, will retry: {}", message),
                    None,
                )
                .await;
                Err(EngineError::Transient { step, message })
            }
            StepOutcome::Cancelled => Ok(None),
        }
    }

    /// Leave the step running until the webhook reconciler finishes it
    ///
    /// The pipeline is saved before the job exists, so a callback that finds
    /// the job also finds the step waiting for it.
    async fn park(&self, pipeline: &mut Pipeline, step: StepId, output: StepOutput) -> Result<(), EngineError> {
        let Some(task_id) = output.awaiting.clone() else {
            return Ok(());
        };
        let now = Utc::now();
        pipeline.set_checkpoint(step, output.result.clone())?;
        pipeline.await_callback(step, task_id.clone(), now)?;
        if !self.store.save_pipeline(pipeline).await? {
            info!("Pipeline {} finished while step {} ran; task {} left unwatched", pipeline.id, step, task_id);
            return Ok(());
        }
        self.record_artifacts(pipeline, step, &output.artifacts).await?;

        info!("Step {} of pipeline {} waits for task {}", step, pipeline.id, task_id);
        let topic = self.emitter.topic(pipeline.id);
        self.log(
            &topic,
            step.as_str(),
            LogType::Info,
            format!("Step {} waiting for callback of task {}", step, task_id),
            Some(output.result),
        )
        .await;
        self.emitter.step_status(
            &topic,
            step,
            StepStatus::Running,
            pipeline.current_step_progress,
            Some("waiting for callback".to_string()),
        );
        Ok(())
    }

    /// Persist step artifacts. A pending artifact gets a running job and puts
    /// the project into processing until the webhook resolves it.
    async fn record_artifacts(
        &self,
        pipeline: &Pipeline,
        step: StepId,
        artifacts: &[ArtifactRecord],
    ) -> Result<(), EngineError> {
        let mut pending = false;
        for artifact in artifacts {
            match (&artifact.url, &artifact.task_id) {
                (Some(url), _) => {
                    let asset = Asset::resolved(
                        pipeline.project_id,
                        artifact.asset_type,
                        url.clone(),
                        artifact.metadata.clone(),
                    )
                    .for_pipeline(pipeline.id);
                    self.store.insert_asset(&asset).await?;
                }
                (None, Some(task_id)) => {
                    let asset = Asset::pending(
                        pipeline.project_id,
                        artifact.asset_type,
                        task_id.clone(),
                        artifact.metadata.clone(),
                    )
                    .for_pipeline(pipeline.id);
                    self.store.insert_asset(&asset).await?;
                    let job = JobLog::running(pipeline.project_id, step.as_str(), task_id.clone(), Some(asset.id))
                        .for_pipeline(pipeline.id);
                    self.store.insert_job(&job).await?;
                    pending = true;
                }
                (None, None) => {
                    warn!("Step {} declared an artifact with neither URL nor task id", step);
                }
            }
        }

        if pending {
            self.store
                .transition_project(
                    pipeline.project_id,
                    &[
                        ProjectStatus::Draft,
                        ProjectStatus::Processing,
                        ProjectStatus::Completed,
                        ProjectStatus::Failed,
                    ],
                    ProjectStatus::Processing,
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// Save a control transition, refusing to overwrite a terminal pipeline
    async fn commit(&self, pipeline: &Pipeline) -> Result<(), EngineError> {
        if self.store.save_pipeline(pipeline).await? {
            Ok(())
        } else {
            let stored = self.load(pipeline.id).await?;
            Err(TransitionError::Pipeline {
                action: "change",
                status: stored.status.as_str(),
            }
            .into())
        }
    }

    fn publish_step_status(&self, pipeline: &Pipeline) {
        if let (Some(step), Some(state)) = (pipeline.current_step, pipeline.current_state()) {
            self.emitter.step_status(
                &self.emitter.topic(pipeline.id),
                step,
                state.status(),
                pipeline.current_step_progress,
                pipeline.error_message.clone(),
            );
        }
    }

    async fn engine_log(&self, pipeline: &Pipeline, log_type: LogType, message: impl Into<String>) {
        let topic = self.emitter.topic(pipeline.id);
        self.log(&topic, ENGINE_AGENT, log_type, message, None).await;
    }

    /// Pipeline logs are history, not control flow; a failed write is logged and skipped
    async fn log(
        &self,
        topic: &PipelineTopic,
        agent_type: &str,
        log_type: LogType,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        if let Err(e) = self.emitter.emit(topic, agent_type, log_type, message, data).await {
            warn!(pipeline_id = %topic.pipeline_id(), error = %e, "Failed to record pipeline log");
        }
    }

    fn token_for(&self, pipeline_id: Uuid) -> Option<CancellationToken> {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.get(&pipeline_id).cloned()
    }

    fn claim(&self, pipeline_id: Uuid) -> Option<CancellationToken> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.contains_key(&pipeline_id) {
            return None;
        }
        let token = self.shutdown.child_token();
        in_flight.insert(pipeline_id, token.clone());
        Some(token)
    }

    fn release(&self, pipeline_id: Uuid) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&pipeline_id);
    }
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine").finish_non_exhaustive()
    }
}
