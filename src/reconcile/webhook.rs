//! Webhook reconciler
//!
//! Folds one provider task report into persisted state. Renderer callbacks
//! and the poll path of the job dispatcher both end up here, so a report is
//! handled the same way no matter how it arrived. Every write is conditional,
//! which makes delivering the same report twice equivalent to delivering it
//! once.
//!
//! A task started by a pipeline step also finishes that step: the owning
//! pipeline completes or fails with the task.

use crate::core::{Asset, JobLog, JobStatus, PipelineStatus, ProjectStatus, CANCELLED_MESSAGE};
use crate::events::EventEmitter;
use crate::persistence::Store;
use crate::reconcile::callback::finish_awaiting_step;
use crate::provider::{find_url, TaskState};
use crate::storage::{persist_remote, ObjectStore};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A provider's report on one external task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    /// Raw provider status word
    pub status: String,
    pub output_url: Option<String>,
    pub error: Option<String>,
}

impl TaskReport {
    pub fn new(task_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: status.into(),
            output_url: None,
            error: None,
        }
    }

    pub fn with_output(mut self, url: impl Into<String>) -> Self {
        self.output_url = Some(url.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Parse an inbound payload
    ///
    /// Accepts `task_id` or `id`, `status` or `state`, and the output URL as
    /// `output_url`, `url`, `result.url` or `data.url`. `error` may be a
    /// string or an object with a `message`.
    pub fn from_json(payload: &Value) -> Result<Self, ReconcileError> {
        let task_id = ["task_id", "id"]
            .iter()
            .filter_map(|key| payload.get(*key))
            .find_map(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| ReconcileError::Malformed("missing task_id".to_string()))?;

        let status = ["status", "state"]
            .iter()
            .filter_map(|key| payload.get(*key))
            .find_map(Value::as_str)
            .ok_or_else(|| ReconcileError::Malformed(format!("task {} has no status", task_id)))?
            .to_string();

        let error = payload.get("error").and_then(|e| match e {
            Value::String(s) => Some(s.clone()),
            Value::Object(_) => e.get("message").and_then(Value::as_str).map(str::to_string),
            _ => None,
        });

        Ok(Self {
            task_id,
            status,
            output_url: find_url(payload).map(str::to_string),
            error,
        })
    }

    /// Status in the shared vocabulary
    pub fn state(&self) -> TaskState {
        TaskState::from_provider(&self.status)
    }
}

impl<'de> Deserialize<'de> for TaskReport {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let payload = Value::deserialize(deserializer)?;
        TaskReport::from_json(&payload).map_err(serde::de::Error::custom)
    }
}

/// Error types for reconciliation
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("malformed task report: {0}")]
    Malformed(String),

    /// Nothing is correlated with the task (yet). A callback can beat the
    /// engine's write of the job, so this is retried.
    #[error("no job or asset is waiting on task {0}")]
    UnknownTask(String),

    #[error("storage failed, will retry: {0}")]
    Retryable(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::Malformed(_))
    }
}

/// What a report changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The task is not finished yet
    InProgress,
    /// The pipeline that started the task was cancelled; the result was dropped
    Discarded,
    Applied {
        /// False when the job was already terminal
        job_finished: bool,
        /// A new permanent URL was stored for the asset
        uploaded: bool,
        /// Status the project moved to, if it moved
        project_status: Option<ProjectStatus>,
        /// Status the owning pipeline moved to when its waiting step finished
        pipeline_status: Option<PipelineStatus>,
    },
}

const WEBHOOK_AGENT: &str = "webhook";

/// Folds task reports into jobs, assets, pipelines and project status
pub struct WebhookReconciler {
    store: Arc<dyn Store>,
    storage: Arc<dyn ObjectStore>,
    emitter: EventEmitter,
}

impl WebhookReconciler {
    pub fn new(store: Arc<dyn Store>, storage: Arc<dyn ObjectStore>, emitter: EventEmitter) -> Self {
        Self { store, storage, emitter }
    }

    pub async fn reconcile(&self, report: &TaskReport) -> Result<ReconcileOutcome, ReconcileError> {
        let state = report.state();
        let job = self.store.find_job_by_task(&report.task_id).await?;
        let asset = self.store.find_asset_by_task(&report.task_id).await?;

        let (project_id, pipeline_id) = match (&job, &asset) {
            (Some(job), _) => (job.project_id, job.pipeline_id.or(asset.as_ref().and_then(|a| a.pipeline_id))),
            (None, Some(asset)) => (asset.project_id, asset.pipeline_id),
            (None, None) => return Err(ReconcileError::UnknownTask(report.task_id.clone())),
        };

        if !state.is_terminal() {
            debug!(task_id = %report.task_id, status = %report.status, "Task still in progress");
            return Ok(ReconcileOutcome::InProgress);
        }

        if self.pipeline_cancelled(pipeline_id).await? {
            info!(task_id = %report.task_id, project_id = %project_id, "Discarding report for cancelled pipeline");
            if let Some(job) = &job {
                self.finish(job, JobStatus::Failed, Some(CANCELLED_MESSAGE.to_string()))
                    .await?;
            }
            self.settle_project(project_id).await?;
            return Ok(ReconcileOutcome::Discarded);
        }

        let (status, error, uploaded) = match state {
            TaskState::Completed => match &asset {
                Some(asset) => match self.store_output(asset, report).await? {
                    Ok(uploaded) => (JobStatus::Completed, None, uploaded),
                    Err(cause) => (JobStatus::Failed, Some(cause), false),
                },
                None => (JobStatus::Completed, None, false),
            },
            _ => {
                let cause = report
                    .error
                    .clone()
                    .unwrap_or_else(|| "provider reported failure".to_string());
                if let Some(asset) = &asset {
                    self.store.annotate_asset_failure(asset.id, &cause).await?;
                }
                (JobStatus::Failed, Some(cause), false)
            }
        };

        let job_finished = match &job {
            Some(job) => self.finish(job, status, error.clone()).await?,
            None => false,
        };
        let pipeline_status = match pipeline_id {
            Some(pipeline_id) => {
                let outcome = match error {
                    None => Ok(self.step_output(asset.as_ref()).await?),
                    Some(cause) => Err(cause),
                };
                self.finish_step(pipeline_id, &report.task_id, outcome).await?
            }
            None => None,
        };
        let project_status = self.settle_project(project_id).await?;

        Ok(ReconcileOutcome::Applied {
            job_finished,
            uploaded,
            project_status,
            pipeline_status,
        })
    }

    /// Give up on a report whose retries ran out: the asset and job fail with `cause`
    pub async fn abandon(&self, report: &TaskReport, cause: &str) -> Result<(), ReconcileError> {
        warn!(task_id = %report.task_id, cause, "Giving up on task report");
        let job = self.store.find_job_by_task(&report.task_id).await?;
        let asset = self.store.find_asset_by_task(&report.task_id).await?;

        if let Some(asset) = &asset {
            self.store.annotate_asset_failure(asset.id, cause).await?;
        }
        if let Some(job) = &job {
            self.finish(job, JobStatus::Failed, Some(cause.to_string())).await?;
        }
        let pipeline_id = job
            .as_ref()
            .and_then(|j| j.pipeline_id)
            .or(asset.as_ref().and_then(|a| a.pipeline_id));
        if let Some(pipeline_id) = pipeline_id {
            self.finish_step(pipeline_id, &report.task_id, Err(cause.to_string()))
                .await?;
        }
        if let Some(project_id) = job.map(|j| j.project_id).or(asset.map(|a| a.project_id)) {
            self.settle_project(project_id).await?;
        }
        Ok(())
    }

    /// Derive the project status from its jobs once none is left open
    ///
    /// Returns the status the project moved to. Only a processing project moves.
    pub async fn settle_project(&self, project_id: Uuid) -> Result<Option<ProjectStatus>, ReconcileError> {
        let jobs = self.store.list_jobs(project_id).await?;
        if jobs.is_empty() || jobs.iter().any(|j| !j.status.is_terminal()) {
            return Ok(None);
        }

        let failure = jobs.iter().find(|j| j.status == JobStatus::Failed);
        let (to, error) = match failure {
            Some(job) => (
                ProjectStatus::Failed,
                Some(
                    job.error_message
                        .clone()
                        .unwrap_or_else(|| format!("{} job failed", job.job_type)),
                ),
            ),
            None => (ProjectStatus::Completed, None),
        };

        let moved = self
            .store
            .transition_project(project_id, &[ProjectStatus::Processing], to, error)
            .await?;
        if moved {
            info!(project_id = %project_id, status = to.as_str(), "Project settled");
        }
        Ok(moved.then_some(to))
    }

    /// Persist the task output into the asset
    ///
    /// The outer error is for the queue; the inner one is a permanent failure
    /// cause already recorded on the asset.
    async fn store_output(
        &self,
        asset: &Asset,
        report: &TaskReport,
    ) -> Result<Result<bool, String>, ReconcileError> {
        if asset.is_resolved() {
            debug!(asset_id = %asset.id, "Asset already stored, skipping upload");
            return Ok(Ok(false));
        }
        if let Some(failure) = &asset.failure {
            return Ok(Err(failure.clone()));
        }

        let Some(source_url) = report.output_url.as_deref() else {
            let cause = format!("task {} completed without an output URL", report.task_id);
            self.store.annotate_asset_failure(asset.id, &cause).await?;
            return Ok(Err(cause));
        };

        match persist_remote(self.storage.as_ref(), asset.project_id, asset.asset_type, source_url).await {
            Ok(url) => {
                let stored = self.store.resolve_asset(asset.id, &url).await?;
                if stored {
                    info!(asset_id = %asset.id, url = %url, "Asset stored");
                }
                Ok(Ok(stored))
            }
            Err(e) if e.retryable => Err(ReconcileError::Retryable(e.message)),
            Err(e) => {
                warn!(asset_id = %asset.id, error = %e, "Asset could not be stored");
                let cause = format!("storage failed: {}", e.message);
                self.store.annotate_asset_failure(asset.id, &cause).await?;
                Ok(Err(cause))
            }
        }
    }

    async fn finish(
        &self,
        job: &JobLog,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<bool, ReconcileError> {
        let finished = self.store.finish_job(job.id, status, error, Utc::now()).await?;
        if !finished {
            debug!(job_id = %job.id, "Job already terminal");
        }
        Ok(finished)
    }

    /// Only a task started by a pipeline can belong to a cancelled one
    async fn pipeline_cancelled(&self, pipeline_id: Option<Uuid>) -> Result<bool, ReconcileError> {
        let Some(pipeline_id) = pipeline_id else {
            return Ok(false);
        };
        Ok(self
            .store
            .load_pipeline(pipeline_id)
            .await?
            .is_some_and(|p| p.is_cancelled()))
    }

    /// Result fields a completed task adds to its step
    async fn step_output(&self, asset: Option<&Asset>) -> Result<Value, ReconcileError> {
        let stored = match asset {
            Some(asset) => self.store.load_asset(asset.id).await?,
            None => None,
        };
        Ok(match stored {
            Some(asset) => json!({
                "status": "completed",
                "asset_id": asset.id,
                "url": asset.permanent_url,
            }),
            None => json!({ "status": "completed" }),
        })
    }

    async fn finish_step(
        &self,
        pipeline_id: Uuid,
        task_id: &str,
        outcome: Result<Value, String>,
    ) -> Result<Option<PipelineStatus>, ReconcileError> {
        Ok(finish_awaiting_step(
            self.store.as_ref(),
            &self.emitter,
            WEBHOOK_AGENT,
            pipeline_id,
            task_id,
            outcome,
            Utc::now(),
        )
        .await?)
    }
}
