//! Durable records that live alongside pipelines: logs, assets, jobs, projects

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of a pipeline log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Info,
    Progress,
    Result,
    Error,
    Thinking,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Info => "info",
            LogType::Progress => "progress",
            LogType::Result => "result",
            LogType::Error => "error",
            LogType::Thinking => "thinking",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogType::Info),
            "progress" => Some(LogType::Progress),
            "result" => Some(LogType::Result),
            "error" => Some(LogType::Error),
            "thinking" => Some(LogType::Thinking),
            _ => None,
        }
    }
}

/// Immutable, append-only event record of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLog {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    /// Which step (or "engine") emitted the entry
    pub agent_type: String,
    pub log_type: LogType,
    pub message: String,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl PipelineLog {
    pub fn new(
        pipeline_id: Uuid,
        agent_type: impl Into<String>,
        log_type: LogType,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            agent_type: agent_type.into(),
            log_type,
            message: message.into(),
            data,
            created_at: Utc::now(),
        }
    }
}

/// Type of a generated artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Music,
    Image,
    VideoClip,
    FinalVideo,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Music => "music",
            AssetType::Image => "image",
            AssetType::VideoClip => "video_clip",
            AssetType::FinalVideo => "final_video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "music" => Some(AssetType::Music),
            "image" => Some(AssetType::Image),
            "video_clip" => Some(AssetType::VideoClip),
            "final_video" => Some(AssetType::FinalVideo),
            _ => None,
        }
    }

    /// Extension used when the source URL does not carry one
    pub fn default_extension(&self) -> &'static str {
        match self {
            AssetType::Music => "mp3",
            AssetType::Image => "png",
            AssetType::VideoClip | AssetType::FinalVideo => "mp4",
        }
    }
}

/// A generated artifact belonging to a project
///
/// `permanent_url` stays empty while the artifact is pending at the provider
/// and never changes once set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub project_id: Uuid,
    pub asset_type: AssetType,
    pub permanent_url: String,
    pub external_task_id: Option<String>,
    /// Pipeline whose step produced the asset; None for dispatched work
    #[serde(default)]
    pub pipeline_id: Option<Uuid>,
    pub metadata: Value,
    /// Terminal failure annotation (provider failure or non-retryable storage error)
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    /// An asset whose bytes are already in durable storage
    pub fn resolved(project_id: Uuid, asset_type: AssetType, url: String, metadata: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            asset_type,
            permanent_url: url,
            external_task_id: None,
            pipeline_id: None,
            metadata,
            failure: None,
            created_at: Utc::now(),
        }
    }

    /// An asset still being produced by an external provider
    pub fn pending(project_id: Uuid, asset_type: AssetType, task_id: String, metadata: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            asset_type,
            permanent_url: String::new(),
            external_task_id: Some(task_id),
            pipeline_id: None,
            metadata,
            failure: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_pipeline(mut self, pipeline_id: Uuid) -> Self {
        self.pipeline_id = Some(pipeline_id);
        self
    }

    pub fn is_resolved(&self) -> bool {
        !self.permanent_url.is_empty()
    }
}

/// Status of an async unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Project-scoped record of one dispatched unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub id: Uuid,
    pub project_id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub external_task_id: Option<String>,
    pub asset_id: Option<Uuid>,
    /// Pipeline whose step waits on this job; None for dispatched work
    #[serde(default)]
    pub pipeline_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobLog {
    pub fn new(project_id: Uuid, job_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            job_type: job_type.into(),
            status: JobStatus::Pending,
            external_task_id: None,
            asset_id: None,
            pipeline_id: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// A job already handed to a provider
    pub fn running(
        project_id: Uuid,
        job_type: impl Into<String>,
        task_id: String,
        asset_id: Option<Uuid>,
    ) -> Self {
        let mut job = Self::new(project_id, job_type);
        job.status = JobStatus::Running;
        job.external_task_id = Some(task_id);
        job.asset_id = asset_id;
        job.started_at = Some(Utc::now());
        job
    }

    pub fn for_pipeline(mut self, pipeline_id: Uuid) -> Self {
        self.pipeline_id = Some(pipeline_id);
        self
    }

    /// Apply a terminal status. Returns false (and changes nothing) if the
    /// job is already terminal.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error_message = error;
        self.completed_at = Some(now);
        true
    }
}

/// Lifecycle status of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Draft,
    Processing,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::Processing => "processing",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ProjectStatus::Draft),
            "processing" => Some(ProjectStatus::Processing),
            "completed" => Some(ProjectStatus::Completed),
            "failed" => Some(ProjectStatus::Failed),
            _ => None,
        }
    }
}

/// The part of a project the engine reads and writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub status: ProjectStatus,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: ProjectStatus::Draft,
            error_message: None,
            updated_at: Utc::now(),
        }
    }
}
