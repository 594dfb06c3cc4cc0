//! SQLite-based persistence store

use crate::core::{
    Asset, AssetType, JobLog, JobStatus, Pipeline, PipelineLog, PipelineMode, PipelineStatus,
    PipelineType, LogType, Project, ProjectStatus, StepId,
};
use crate::persistence::Store;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipelines (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    type TEXT NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    current_step TEXT,
    current_step_progress INTEGER NOT NULL DEFAULT 0,
    steps_state TEXT NOT NULL,
    run TEXT NOT NULL,
    error_message TEXT,
    started_at TEXT,
    completed_at TEXT,
    cancelled_at TEXT,
    retry_of TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_logs (
    id TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL,
    agent_type TEXT NOT NULL,
    log_type TEXT NOT NULL,
    message TEXT NOT NULL,
    data TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS assets (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    asset_type TEXT NOT NULL,
    permanent_url TEXT NOT NULL DEFAULT '',
    external_task_id TEXT,
    metadata TEXT NOT NULL,
    failure TEXT,
    pipeline_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_logs (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    external_task_id TEXT,
    asset_id TEXT,
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT,
    pipeline_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status);
CREATE INDEX IF NOT EXISTS idx_pipelines_project ON pipelines(project_id);
CREATE INDEX IF NOT EXISTS idx_pipelines_status ON pipelines(status);
CREATE INDEX IF NOT EXISTS idx_logs_pipeline ON pipeline_logs(pipeline_id);
CREATE INDEX IF NOT EXISTS idx_assets_task ON assets(external_task_id);
CREATE INDEX IF NOT EXISTS idx_jobs_task ON job_logs(external_task_id);
CREATE INDEX IF NOT EXISTS idx_jobs_project ON job_logs(project_id);
"#;

const PIPELINE_COLUMNS: &str = "id, project_id, type, mode, status, current_step, current_step_progress, \
     steps_state, run, error_message, started_at, completed_at, cancelled_at, retry_of, created_at, updated_at";

const ASSET_COLUMNS: &str =
    "id, project_id, asset_type, permanent_url, external_task_id, metadata, failure, created_at, pipeline_id";

const JOB_COLUMNS: &str = "id, project_id, job_type, status, external_task_id, asset_id, started_at, \
     completed_at, error_message, created_at, pipeline_id";

/// SQLite store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database at `db_path`; `:memory:` gives a private in-memory database
    pub async fn new(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);

        // Every connection to :memory: would see its own empty database
        let max_connections = if db_path == ":memory:" { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to initialize schema")?;
        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
        Ok(Uuid::parse_str(&row.get::<String, _>(column))?)
    }

    fn opt_uuid(row: &SqliteRow, column: &str) -> Result<Option<Uuid>> {
        row.get::<Option<String>, _>(column)
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(Into::into)
    }

    fn opt_time(row: &SqliteRow, column: &str) -> Option<DateTime<Utc>> {
        row.get::<Option<NaiveDateTime>, _>(column).map(Self::from_naive)
    }

    fn project_from_row(row: &SqliteRow) -> Result<Project> {
        let status: String = row.get("status");
        Ok(Project {
            id: Self::uuid(row, "id")?,
            name: row.get("name"),
            status: ProjectStatus::parse(&status)
                .ok_or_else(|| anyhow!("Unknown project status '{}'", status))?,
            error_message: row.get("error_message"),
            updated_at: Self::from_naive(row.get("updated_at")),
        })
    }

    fn pipeline_from_row(row: &SqliteRow) -> Result<Pipeline> {
        let kind: String = row.get("type");
        let mode: String = row.get("mode");
        let status: String = row.get("status");
        let current_step = row
            .get::<Option<String>, _>("current_step")
            .map(|s| StepId::from_str(&s))
            .transpose()
            .map_err(|e| anyhow!(e))?;

        Ok(Pipeline {
            id: Self::uuid(row, "id")?,
            project_id: Self::uuid(row, "project_id")?,
            kind: PipelineType::from_str(&kind).map_err(|e| anyhow!(e))?,
            mode: PipelineMode::parse(&mode).ok_or_else(|| anyhow!("Unknown mode '{}'", mode))?,
            status: PipelineStatus::parse(&status)
                .ok_or_else(|| anyhow!("Unknown pipeline status '{}'", status))?,
            current_step,
            current_step_progress: row.get::<i64, _>("current_step_progress").clamp(0, 100) as u8,
            steps_state: serde_json::from_str(&row.get::<String, _>("steps_state"))
                .context("Corrupt steps_state column")?,
            run: serde_json::from_str(&row.get::<String, _>("run")).context("Corrupt run column")?,
            error_message: row.get("error_message"),
            started_at: Self::opt_time(row, "started_at"),
            completed_at: Self::opt_time(row, "completed_at"),
            cancelled_at: Self::opt_time(row, "cancelled_at"),
            retry_of: Self::opt_uuid(row, "retry_of")?,
            created_at: Self::from_naive(row.get("created_at")),
            updated_at: Self::from_naive(row.get("updated_at")),
        })
    }

    fn log_from_row(row: &SqliteRow) -> Result<PipelineLog> {
        let log_type: String = row.get("log_type");
        Ok(PipelineLog {
            id: Self::uuid(row, "id")?,
            pipeline_id: Self::uuid(row, "pipeline_id")?,
            agent_type: row.get("agent_type"),
            log_type: LogType::parse(&log_type)
                .ok_or_else(|| anyhow!("Unknown log type '{}'", log_type))?,
            message: row.get("message"),
            data: row
                .get::<Option<String>, _>("data")
                .map(|d| serde_json::from_str(&d))
                .transpose()?,
            created_at: Self::from_naive(row.get("created_at")),
        })
    }

    fn asset_from_row(row: &SqliteRow) -> Result<Asset> {
        let asset_type: String = row.get("asset_type");
        Ok(Asset {
            id: Self::uuid(row, "id")?,
            project_id: Self::uuid(row, "project_id")?,
            asset_type: AssetType::parse(&asset_type)
                .ok_or_else(|| anyhow!("Unknown asset type '{}'", asset_type))?,
            permanent_url: row.get("permanent_url"),
            external_task_id: row.get("external_task_id"),
            metadata: serde_json::from_str(&row.get::<String, _>("metadata"))?,
            failure: row.get("failure"),
            pipeline_id: Self::opt_uuid(row, "pipeline_id")?,
            created_at: Self::from_naive(row.get("created_at")),
        })
    }

    fn job_from_row(row: &SqliteRow) -> Result<JobLog> {
        let status: String = row.get("status");
        Ok(JobLog {
            id: Self::uuid(row, "id")?,
            project_id: Self::uuid(row, "project_id")?,
            job_type: row.get("job_type"),
            status: JobStatus::parse(&status).ok_or_else(|| anyhow!("Unknown job status '{}'", status))?,
            external_task_id: row.get("external_task_id"),
            asset_id: Self::opt_uuid(row, "asset_id")?,
            pipeline_id: Self::opt_uuid(row, "pipeline_id")?,
            started_at: Self::opt_time(row, "started_at"),
            completed_at: Self::opt_time(row, "completed_at"),
            error_message: row.get("error_message"),
            created_at: Self::from_naive(row.get("created_at")),
        })
    }

    async fn query_pipelines(&self, filter: &str, bind: String) -> Result<Vec<Pipeline>> {
        let sql = format!(
            "SELECT {} FROM pipelines WHERE {} = ?1 ORDER BY created_at ASC, rowid ASC",
            PIPELINE_COLUMNS, filter
        );
        let rows = sqlx::query(&sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list pipelines")?;
        rows.iter().map(Self::pipeline_from_row).collect()
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, status, error_message, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(project.id.to_string())
        .bind(&project.name)
        .bind(project.status.as_str())
        .bind(&project.error_message)
        .bind(Self::to_naive(project.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert project")?;
        Ok(())
    }

    async fn load_project(&self, id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT id, name, status, error_message, updated_at FROM projects WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load project")?;
        row.as_ref().map(Self::project_from_row).transpose()
    }

    async fn transition_project(
        &self,
        id: Uuid,
        from: &[ProjectStatus],
        to: ProjectStatus,
        error: Option<String>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = (0..from.len())
            .map(|i| format!("?{}", i + 5))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE projects SET status = ?1, error_message = ?2, updated_at = ?3 \
             WHERE id = ?4 AND status IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(error)
            .bind(Self::to_naive(Utc::now()))
            .bind(id.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool)
            .await
            .context("Failed to update project status")?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_projects_with_status(&self, status: ProjectStatus) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, name, status, error_message, updated_at FROM projects \
             WHERE status = ?1 ORDER BY updated_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list projects")?;
        rows.iter().map(Self::project_from_row).collect()
    }

    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<bool> {
        let sql = format!(
            r#"
            INSERT INTO pipelines ({})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(id) DO UPDATE SET
                mode = excluded.mode,
                status = excluded.status,
                current_step = excluded.current_step,
                current_step_progress = excluded.current_step_progress,
                steps_state = excluded.steps_state,
                run = excluded.run,
                error_message = excluded.error_message,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                cancelled_at = excluded.cancelled_at,
                updated_at = excluded.updated_at
            WHERE pipelines.status NOT IN ('completed', 'failed')
            "#,
            PIPELINE_COLUMNS
        );

        let result = sqlx::query(&sql)
            .bind(pipeline.id.to_string())
            .bind(pipeline.project_id.to_string())
            .bind(pipeline.kind.as_str())
            .bind(pipeline.mode.as_str())
            .bind(pipeline.status.as_str())
            .bind(pipeline.current_step.map(|s| s.as_str()))
            .bind(pipeline.current_step_progress as i64)
            .bind(serde_json::to_string(&pipeline.steps_state)?)
            .bind(serde_json::to_string(&pipeline.run)?)
            .bind(&pipeline.error_message)
            .bind(pipeline.started_at.map(Self::to_naive))
            .bind(pipeline.completed_at.map(Self::to_naive))
            .bind(pipeline.cancelled_at.map(Self::to_naive))
            .bind(pipeline.retry_of.map(|id| id.to_string()))
            .bind(Self::to_naive(pipeline.created_at))
            .bind(Self::to_naive(pipeline.updated_at))
            .execute(&self.pool)
            .await
            .context("Failed to save pipeline")?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>> {
        let sql = format!("SELECT {} FROM pipelines WHERE id = ?1", PIPELINE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load pipeline")?;
        row.as_ref().map(Self::pipeline_from_row).transpose()
    }

    async fn latest_pipeline_for_project(&self, project_id: Uuid) -> Result<Option<Pipeline>> {
        let sql = format!(
            "SELECT {} FROM pipelines WHERE project_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            PIPELINE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(project_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to get latest pipeline")?;
        row.as_ref().map(Self::pipeline_from_row).transpose()
    }

    async fn list_pipelines_for_project(&self, project_id: Uuid) -> Result<Vec<Pipeline>> {
        self.query_pipelines("project_id", project_id.to_string()).await
    }

    async fn list_pipelines_with_status(&self, status: PipelineStatus) -> Result<Vec<Pipeline>> {
        self.query_pipelines("status", status.as_str().to_string()).await
    }

    async fn update_step_progress(&self, pipeline_id: Uuid, step: StepId, value: u8) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET current_step_progress = ?1,
                steps_state = CASE
                    WHEN json_extract(steps_state, '$.' || current_step || '.status') = 'running'
                    THEN json_set(steps_state, '$.' || current_step || '.progress', ?1)
                    ELSE steps_state
                END
            WHERE id = ?2 AND current_step = ?3 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(value.min(100) as i64)
        .bind(pipeline_id.to_string())
        .bind(step.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update step progress")?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_step_checkpoint(&self, pipeline_id: Uuid, step: StepId, checkpoint: &Value) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET steps_state = json_set(steps_state, '$.' || current_step || '.checkpoint', json(?1))
            WHERE id = ?2 AND current_step = ?3 AND status NOT IN ('completed', 'failed')
              AND json_extract(steps_state, '$.' || current_step || '.status') = 'running'
            "#,
        )
        .bind(serde_json::to_string(checkpoint)?)
        .bind(pipeline_id.to_string())
        .bind(step.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to save step checkpoint")?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_log(&self, log: &PipelineLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_logs (id, pipeline_id, agent_type, log_type, message, data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.pipeline_id.to_string())
        .bind(&log.agent_type)
        .bind(log.log_type.as_str())
        .bind(&log.message)
        .bind(log.data.as_ref().map(serde_json::to_string).transpose()?)
        .bind(Self::to_naive(log.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to append log")?;
        Ok(())
    }

    async fn list_logs(&self, pipeline_id: Uuid) -> Result<Vec<PipelineLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, pipeline_id, agent_type, log_type, message, data, created_at
            FROM pipeline_logs
            WHERE pipeline_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(pipeline_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list logs")?;
        rows.iter().map(Self::log_from_row).collect()
    }

    async fn insert_asset(&self, asset: &Asset) -> Result<()> {
        let sql = format!(
            "INSERT INTO assets ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            ASSET_COLUMNS
        );
        sqlx::query(&sql)
            .bind(asset.id.to_string())
            .bind(asset.project_id.to_string())
            .bind(asset.asset_type.as_str())
            .bind(&asset.permanent_url)
            .bind(&asset.external_task_id)
            .bind(serde_json::to_string(&asset.metadata)?)
            .bind(&asset.failure)
            .bind(Self::to_naive(asset.created_at))
            .bind(asset.pipeline_id.map(|id| id.to_string()))
            .execute(&self.pool)
            .await
            .context("Failed to insert asset")?;
        Ok(())
    }

    async fn load_asset(&self, id: Uuid) -> Result<Option<Asset>> {
        let sql = format!("SELECT {} FROM assets WHERE id = ?1", ASSET_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load asset")?;
        row.as_ref().map(Self::asset_from_row).transpose()
    }

    async fn find_asset_by_task(&self, task_id: &str) -> Result<Option<Asset>> {
        let sql = format!(
            "SELECT {} FROM assets WHERE external_task_id = ?1 ORDER BY created_at DESC LIMIT 1",
            ASSET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to find asset")?;
        row.as_ref().map(Self::asset_from_row).transpose()
    }

    async fn list_assets(&self, project_id: Uuid) -> Result<Vec<Asset>> {
        let sql = format!(
            "SELECT {} FROM assets WHERE project_id = ?1 ORDER BY created_at ASC, rowid ASC",
            ASSET_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list assets")?;
        rows.iter().map(Self::asset_from_row).collect()
    }

    async fn resolve_asset(&self, id: Uuid, url: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE assets SET permanent_url = ?1 WHERE id = ?2 AND permanent_url = ''")
            .bind(url)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to resolve asset")?;
        Ok(result.rows_affected() > 0)
    }

    async fn annotate_asset_failure(&self, id: Uuid, failure: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE assets SET failure = ?1 WHERE id = ?2 AND permanent_url = '' AND failure IS NULL",
        )
        .bind(failure)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to annotate asset")?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_job(&self, job: &JobLog) -> Result<()> {
        let sql = format!(
            "INSERT INTO job_logs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            JOB_COLUMNS
        );
        sqlx::query(&sql)
            .bind(job.id.to_string())
            .bind(job.project_id.to_string())
            .bind(&job.job_type)
            .bind(job.status.as_str())
            .bind(&job.external_task_id)
            .bind(job.asset_id.map(|id| id.to_string()))
            .bind(job.started_at.map(Self::to_naive))
            .bind(job.completed_at.map(Self::to_naive))
            .bind(&job.error_message)
            .bind(Self::to_naive(job.created_at))
            .bind(job.pipeline_id.map(|id| id.to_string()))
            .execute(&self.pool)
            .await
            .context("Failed to insert job")?;
        Ok(())
    }

    async fn find_job_by_task(&self, task_id: &str) -> Result<Option<JobLog>> {
        let sql = format!(
            "SELECT {} FROM job_logs WHERE external_task_id = ?1 ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to find job")?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn list_jobs(&self, project_id: Uuid) -> Result<Vec<JobLog>> {
        let sql = format!(
            "SELECT {} FROM job_logs WHERE project_id = ?1 ORDER BY created_at ASC, rowid ASC",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list jobs")?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE job_logs SET status = ?1, error_message = ?2, completed_at = ?3
            WHERE id = ?4 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Self::to_naive(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to finish job")?;
        Ok(result.rows_affected() > 0)
    }
}
