//! Persistence layer for pipelines and project records
//!
//! Every terminal transition is a conditional write, so a duplicate webhook,
//! a second sweep, or a late step result cannot undo a terminal state:
//!
//! - a pipeline row that is completed or failed is never overwritten
//! - a job only finishes if it is not terminal yet
//! - an asset's permanent URL is only set while it is empty
//! - a project only moves out of the statuses the caller expects

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

use crate::core::{
    Asset, JobLog, JobStatus, Pipeline, PipelineLog, PipelineStatus, Project, ProjectStatus, StepId,
    StepStatus,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn insert_project(&self, project: &Project) -> Result<()>;

    async fn load_project(&self, id: Uuid) -> Result<Option<Project>>;

    /// Move a project to `to` if its status is one of `from`
    ///
    /// Returns false (and writes nothing) when the project is missing or in
    /// another status.
    async fn transition_project(
        &self,
        id: Uuid,
        from: &[ProjectStatus],
        to: ProjectStatus,
        error: Option<String>,
    ) -> Result<bool>;

    async fn list_projects_with_status(&self, status: ProjectStatus) -> Result<Vec<Project>>;

    /// Insert or update a pipeline. Returns false if the stored row is
    /// already terminal, in which case nothing is written.
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<bool>;

    async fn load_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>>;

    /// Most recently created pipeline of a project
    async fn latest_pipeline_for_project(&self, project_id: Uuid) -> Result<Option<Pipeline>>;

    async fn list_pipelines_for_project(&self, project_id: Uuid) -> Result<Vec<Pipeline>>;

    async fn list_pipelines_with_status(&self, status: PipelineStatus) -> Result<Vec<Pipeline>>;

    /// Record progress of the running current step of a live pipeline
    async fn update_step_progress(&self, pipeline_id: Uuid, step: StepId, value: u8) -> Result<bool>;

    /// Replace the checkpoint of the running current step of a live pipeline
    async fn save_step_checkpoint(&self, pipeline_id: Uuid, step: StepId, checkpoint: &Value) -> Result<bool>;

    async fn append_log(&self, log: &PipelineLog) -> Result<()>;

    /// Logs of a pipeline, oldest first
    async fn list_logs(&self, pipeline_id: Uuid) -> Result<Vec<PipelineLog>>;

    async fn insert_asset(&self, asset: &Asset) -> Result<()>;

    async fn load_asset(&self, id: Uuid) -> Result<Option<Asset>>;

    async fn find_asset_by_task(&self, task_id: &str) -> Result<Option<Asset>>;

    async fn list_assets(&self, project_id: Uuid) -> Result<Vec<Asset>>;

    /// Set the permanent URL if none is set yet
    async fn resolve_asset(&self, id: Uuid, url: &str) -> Result<bool>;

    /// Record a terminal failure on an asset that is neither resolved nor failed
    async fn annotate_asset_failure(&self, id: Uuid, failure: &str) -> Result<bool>;

    async fn insert_job(&self, job: &JobLog) -> Result<()>;

    async fn find_job_by_task(&self, task_id: &str) -> Result<Option<JobLog>>;

    /// Jobs of a project, oldest first
    async fn list_jobs(&self, project_id: Uuid) -> Result<Vec<JobLog>>;

    /// Apply a terminal status to a job that is not terminal yet
    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}

/// In-memory persistence (for testing or ephemeral use)
pub struct InMemoryStore {
    projects: RwLock<HashMap<Uuid, Project>>,
    pipelines: RwLock<HashMap<Uuid, Pipeline>>,
    logs: RwLock<Vec<PipelineLog>>,
    assets: RwLock<HashMap<Uuid, Asset>>,
    jobs: RwLock<HashMap<Uuid, JobLog>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            pipelines: RwLock::new(HashMap::new()),
            logs: RwLock::new(Vec::new()),
            assets: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    async fn insert_project(&self, project: &Project) -> Result<()> {
        self.projects.write().await.insert(project.id, project.clone());
        Ok(())
    }

    async fn load_project(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.projects.read().await.get(&id).cloned())
    }

    async fn transition_project(
        &self,
        id: Uuid,
        from: &[ProjectStatus],
        to: ProjectStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let mut projects = self.projects.write().await;
        match projects.get_mut(&id) {
            Some(project) if from.contains(&project.status) => {
                project.status = to;
                project.error_message = error;
                project.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_projects_with_status(&self, status: ProjectStatus) -> Result<Vec<Project>> {
        let projects = self.projects.read().await;
        let mut result: Vec<Project> = projects
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|p| p.updated_at);
        Ok(result)
    }

    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<bool> {
        let mut pipelines = self.pipelines.write().await;
        if let Some(existing) = pipelines.get(&pipeline.id) {
            if existing.status.is_terminal() {
                return Ok(false);
            }
        }
        pipelines.insert(pipeline.id, pipeline.clone());
        Ok(true)
    }

    async fn load_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.read().await.get(&id).cloned())
    }

    async fn latest_pipeline_for_project(&self, project_id: Uuid) -> Result<Option<Pipeline>> {
        Ok(self
            .list_pipelines_for_project(project_id)
            .await?
            .into_iter()
            .last())
    }

    async fn list_pipelines_for_project(&self, project_id: Uuid) -> Result<Vec<Pipeline>> {
        let pipelines = self.pipelines.read().await;
        let mut result: Vec<Pipeline> = pipelines
            .values()
            .filter(|p| p.project_id == project_id)
            .cloned()
            .collect();
        result.sort_by_key(|p| p.created_at);
        Ok(result)
    }

    async fn list_pipelines_with_status(&self, status: PipelineStatus) -> Result<Vec<Pipeline>> {
        let pipelines = self.pipelines.read().await;
        let mut result: Vec<Pipeline> = pipelines
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|p| p.created_at);
        Ok(result)
    }

    async fn update_step_progress(&self, pipeline_id: Uuid, step: StepId, value: u8) -> Result<bool> {
        let mut pipelines = self.pipelines.write().await;
        match pipelines.get_mut(&pipeline_id) {
            Some(pipeline) if !pipeline.status.is_terminal() && pipeline.current_step == Some(step) => {
                Ok(pipeline.set_progress(step, value).is_ok())
            }
            _ => Ok(false),
        }
    }

    async fn save_step_checkpoint(&self, pipeline_id: Uuid, step: StepId, checkpoint: &Value) -> Result<bool> {
        let mut pipelines = self.pipelines.write().await;
        match pipelines.get_mut(&pipeline_id) {
            Some(pipeline)
                if !pipeline.status.is_terminal()
                    && pipeline.current_step == Some(step)
                    && pipeline.current_state().is_some_and(|s| s.status() == StepStatus::Running) =>
            {
                Ok(pipeline.set_checkpoint(step, checkpoint.clone()).is_ok())
            }
            _ => Ok(false),
        }
    }

    async fn append_log(&self, log: &PipelineLog) -> Result<()> {
        self.logs.write().await.push(log.clone());
        Ok(())
    }

    async fn list_logs(&self, pipeline_id: Uuid) -> Result<Vec<PipelineLog>> {
        let logs = self.logs.read().await;
        Ok(logs
            .iter()
            .filter(|l| l.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn insert_asset(&self, asset: &Asset) -> Result<()> {
        self.assets.write().await.insert(asset.id, asset.clone());
        Ok(())
    }

    async fn load_asset(&self, id: Uuid) -> Result<Option<Asset>> {
        Ok(self.assets.read().await.get(&id).cloned())
    }

    async fn find_asset_by_task(&self, task_id: &str) -> Result<Option<Asset>> {
        let assets = self.assets.read().await;
        Ok(assets
            .values()
            .filter(|a| a.external_task_id.as_deref() == Some(task_id))
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn list_assets(&self, project_id: Uuid) -> Result<Vec<Asset>> {
        let assets = self.assets.read().await;
        let mut result: Vec<Asset> = assets
            .values()
            .filter(|a| a.project_id == project_id)
            .cloned()
            .collect();
        result.sort_by_key(|a| a.created_at);
        Ok(result)
    }

    async fn resolve_asset(&self, id: Uuid, url: &str) -> Result<bool> {
        let mut assets = self.assets.write().await;
        match assets.get_mut(&id) {
            Some(asset) if !asset.is_resolved() => {
                asset.permanent_url = url.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn annotate_asset_failure(&self, id: Uuid, failure: &str) -> Result<bool> {
        let mut assets = self.assets.write().await;
        match assets.get_mut(&id) {
            Some(asset) if !asset.is_resolved() && asset.failure.is_none() => {
                asset.failure = Some(failure.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_job(&self, job: &JobLog) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_job_by_task(&self, task_id: &str) -> Result<Option<JobLog>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| j.external_task_id.as_deref() == Some(task_id))
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn list_jobs(&self, project_id: Uuid) -> Result<Vec<JobLog>> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<JobLog> = jobs
            .values()
            .filter(|j| j.project_id == project_id)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.created_at);
        Ok(result)
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        Ok(match jobs.get_mut(&id) {
            Some(job) => job.finish(status, error, at),
            None => false,
        })
    }
}
