//! Stale-state reconciler
//!
//! A periodic sweep that repairs state the normal paths left behind: projects
//! stuck in processing because a dispatch or a webhook got lost, and
//! pipelines whose worker disappeared mid-step. A step waiting on a callback
//! is held to the job timeout instead of the step timeout. Verdicts are pure functions of
//! persisted state and `now`; the writes that apply them are conditional, so
//! the sweep can run twice, or alongside the webhook path, without harm.

use crate::core::config::ReconcilerConfig;
use crate::core::{
    JobLog, JobStatus, LogType, Pipeline, PipelineMode, PipelineStatus, Project, ProjectStatus, StepId,
    StepState,
};
use crate::events::EventEmitter;
use crate::persistence::Store;
use crate::reconcile::callback::finish_awaiting_step;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SWEEP_AGENT: &str = "reconciler";

/// Diagnosis of one processing project
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectVerdict {
    /// Processing with no job long after dispatch: the worker never got it
    DispatchLost,
    /// Every job completed but the project was never marked
    AllCompleted,
    /// A job failed; its error becomes the project's
    JobFailed { error: String },
    /// A job has been running past the job timeout
    JobTimedOut {
        job_id: Uuid,
        job_type: String,
        minutes: i64,
        /// Pipeline whose step waits on the job
        pipeline_id: Option<Uuid>,
        task_id: Option<String>,
    },
    /// Still legitimately in flight
    Waiting,
}

/// Decide what to do with a processing project
///
/// Cases are checked in order; the first that matches wins.
pub fn diagnose(project: &Project, jobs: &[JobLog], now: DateTime<Utc>, config: &ReconcilerConfig) -> ProjectVerdict {
    if jobs.is_empty() {
        return if now - project.updated_at > config.dispatch_grace() {
            ProjectVerdict::DispatchLost
        } else {
            ProjectVerdict::Waiting
        };
    }

    if jobs.iter().all(|j| j.status == JobStatus::Completed) {
        return ProjectVerdict::AllCompleted;
    }

    if let Some(job) = jobs.iter().find(|j| j.status == JobStatus::Failed) {
        return ProjectVerdict::JobFailed {
            error: job
                .error_message
                .clone()
                .unwrap_or_else(|| format!("{} job failed", job.job_type)),
        };
    }

    let timed_out = jobs.iter().find(|j| {
        j.status == JobStatus::Running && now - j.started_at.unwrap_or(j.created_at) > config.job_timeout()
    });
    if let Some(job) = timed_out {
        return ProjectVerdict::JobTimedOut {
            job_id: job.id,
            job_type: job.job_type.clone(),
            minutes: config.job_timeout().num_minutes(),
            pipeline_id: job.pipeline_id,
            task_id: job.external_task_id.clone(),
        };
    }

    ProjectVerdict::Waiting
}

/// Diagnosis of one running pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineVerdict {
    Healthy,
    /// The current step has been running past the step timeout
    StepTimedOut { step: StepId },
    /// An auto pipeline sat on a pending step past the step timeout
    ContinueLost { step: StepId },
    /// A step waited on its callback past the job timeout
    CallbackLost { step: StepId },
}

impl PipelineVerdict {
    fn diagnosis(&self, config: &ReconcilerConfig) -> Option<String> {
        match self {
            PipelineVerdict::Healthy => None,
            PipelineVerdict::StepTimedOut { step } => Some(format!(
                "worker lost: step {} ran for more than {} minutes",
                step,
                config.step_timeout().num_minutes()
            )),
            PipelineVerdict::ContinueLost { step } => Some(format!(
                "worker lost: step {} was never started after {} minutes",
                step,
                config.step_timeout().num_minutes()
            )),
            PipelineVerdict::CallbackLost { step } => Some(format!(
                "callback lost: step {} heard nothing for {} minutes",
                step,
                config.job_timeout().num_minutes()
            )),
        }
    }
}

pub fn diagnose_pipeline(pipeline: &Pipeline, now: DateTime<Utc>, config: &ReconcilerConfig) -> PipelineVerdict {
    if pipeline.status != PipelineStatus::Running {
        return PipelineVerdict::Healthy;
    }
    let Some(step) = pipeline.current_step else {
        return PipelineVerdict::Healthy;
    };
    let step_timeout = config.step_timeout();

    match pipeline.step_state(step) {
        Some(StepState::Running {
            started_at,
            awaiting: Some(_),
            ..
        }) => {
            if now - *started_at > config.job_timeout() {
                PipelineVerdict::CallbackLost { step }
            } else {
                PipelineVerdict::Healthy
            }
        }
        Some(StepState::Running { started_at, .. }) if now - *started_at > step_timeout => {
            PipelineVerdict::StepTimedOut { step }
        }
        Some(StepState::Pending)
            if pipeline.mode == PipelineMode::Auto && now - pipeline.updated_at > step_timeout =>
        {
            PipelineVerdict::ContinueLost { step }
        }
        _ => PipelineVerdict::Healthy,
    }
}

/// What one sweep changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub projects_checked: usize,
    pub projects_completed: Vec<Uuid>,
    pub projects_failed: Vec<(Uuid, String)>,
    pub jobs_timed_out: Vec<Uuid>,
    pub pipelines_failed: Vec<(Uuid, String)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.projects_completed.is_empty()
            && self.projects_failed.is_empty()
            && self.jobs_timed_out.is_empty()
            && self.pipelines_failed.is_empty()
    }
}

/// Runs the sweep against a store
pub struct StaleReconciler {
    store: Arc<dyn Store>,
    emitter: EventEmitter,
    config: ReconcilerConfig,
}

impl StaleReconciler {
    pub fn new(store: Arc<dyn Store>, emitter: EventEmitter, config: ReconcilerConfig) -> Self {
        Self { store, emitter, config }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for project in self.store.list_projects_with_status(ProjectStatus::Processing).await? {
            report.projects_checked += 1;
            let jobs = self.store.list_jobs(project.id).await?;
            let verdict = diagnose(&project, &jobs, now, &self.config);
            debug!(project_id = %project.id, ?verdict, "Project diagnosed");
            self.apply(&project, verdict, now, &mut report).await?;
        }

        for pipeline in self.store.list_pipelines_with_status(PipelineStatus::Running).await? {
            let verdict = diagnose_pipeline(&pipeline, now, &self.config);
            if let Some(diagnosis) = verdict.diagnosis(&self.config) {
                self.fail_pipeline(pipeline, diagnosis, now, &mut report).await?;
            }
        }

        if report.is_empty() {
            debug!("Sweep found nothing to repair ({} projects checked)", report.projects_checked);
        } else {
            info!(
                completed = report.projects_completed.len(),
                failed = report.projects_failed.len(),
                jobs_timed_out = report.jobs_timed_out.len(),
                pipelines_failed = report.pipelines_failed.len(),
                "Sweep repaired stale state"
            );
        }
        Ok(report)
    }

    /// Sweep every configured interval until the token is cancelled
    pub async fn run_periodic(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Stale-state reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!(error = %e, "Sweep failed");
                    }
                }
            }
        }
    }

    async fn apply(
        &self,
        project: &Project,
        verdict: ProjectVerdict,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let failure = match verdict {
            ProjectVerdict::Waiting => return Ok(()),
            ProjectVerdict::AllCompleted => {
                if self
                    .store
                    .transition_project(project.id, &[ProjectStatus::Processing], ProjectStatus::Completed, None)
                    .await?
                {
                    info!(project_id = %project.id, "Project forward-filled to completed");
                    report.projects_completed.push(project.id);
                }
                return Ok(());
            }
            ProjectVerdict::DispatchLost => {
                "dispatch lost: no job was recorded, the worker may be unavailable".to_string()
            }
            ProjectVerdict::JobFailed { error } => error,
            ProjectVerdict::JobTimedOut {
                job_id,
                job_type,
                minutes,
                pipeline_id,
                task_id,
            } => {
                let message = format!("{} job timed out after {} minutes", job_type, minutes);
                if self
                    .store
                    .finish_job(job_id, JobStatus::Failed, Some(message.clone()), now)
                    .await?
                {
                    report.jobs_timed_out.push(job_id);
                }
                if let (Some(pipeline_id), Some(task_id)) = (pipeline_id, task_id) {
                    let status = finish_awaiting_step(
                        self.store.as_ref(),
                        &self.emitter,
                        SWEEP_AGENT,
                        pipeline_id,
                        &task_id,
                        Err(message.clone()),
                        now,
                    )
                    .await?;
                    if status == Some(PipelineStatus::Failed) {
                        report.pipelines_failed.push((pipeline_id, message.clone()));
                    }
                }
                message
            }
        };

        if self
            .store
            .transition_project(
                project.id,
                &[ProjectStatus::Processing],
                ProjectStatus::Failed,
                Some(failure.clone()),
            )
            .await?
        {
            warn!(project_id = %project.id, "Project failed by sweep: {}", failure);
            report.projects_failed.push((project.id, failure));
        }
        Ok(())
    }

    async fn fail_pipeline(
        &self,
        mut pipeline: Pipeline,
        diagnosis: String,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        pipeline.abort(diagnosis.clone(), now)?;
        if !self.store.save_pipeline(&pipeline).await? {
            return Ok(());
        }

        warn!(pipeline_id = %pipeline.id, "Pipeline failed by sweep: {}", diagnosis);
        let topic = self.emitter.topic(pipeline.id);
        if let Err(e) = self
            .emitter
            .emit(&topic, SWEEP_AGENT, LogType::Error, diagnosis.clone(), None)
            .await
        {
            warn!(pipeline_id = %pipeline.id, error = %e, "Failed to record pipeline log");
        }
        if let (Some(step), Some(state)) = (pipeline.current_step, pipeline.current_state()) {
            self.emitter.step_status(
                &topic,
                step,
                state.status(),
                pipeline.current_step_progress,
                Some(diagnosis.clone()),
            );
        }
        self.emitter.hub().close(pipeline.id);
        report.pipelines_failed.push((pipeline.id, diagnosis));
        Ok(())
    }
}
