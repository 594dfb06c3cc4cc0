//! Engine and run configuration from YAML

use crate::core::{
    context::RunConfig,
    registry::PipelineType,
    state::PipelineMode,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration (`conductor.yaml`)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConductorConfig {
    /// SQLite database path (defaults to the local data directory)
    #[serde(default)]
    pub database: Option<PathBuf>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

/// Object store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory artifacts are written under
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// Public URL prefix for stored artifacts; `file://` URLs when absent
    #[serde(default)]
    pub public_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            public_base_url: None,
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("artifacts")
}

/// One external provider endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the provider's task API
    pub base_url: String,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Interval between status polls, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum number of status polls before timing out
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            base_url: base_url.into(),
            api_key_env: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolve the API key from the environment, if configured
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// All provider endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_llm")]
    pub llm: ProviderConfig,

    #[serde(default = "default_music")]
    pub music: ProviderConfig,

    #[serde(default = "default_image")]
    pub image: ProviderConfig,

    #[serde(default = "default_renderer")]
    pub renderer: ProviderConfig,

    /// Where the renderer posts completion callbacks
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            llm: default_llm(),
            music: default_music(),
            image: default_image(),
            renderer: default_renderer(),
            callback_url: None,
        }
    }
}

fn default_llm() -> ProviderConfig {
    ProviderConfig::new("http://localhost:8101", 60)
}

fn default_music() -> ProviderConfig {
    ProviderConfig::new("http://localhost:8102", 120)
}

fn default_image() -> ProviderConfig {
    ProviderConfig::new("http://localhost:8103", 60)
}

fn default_renderer() -> ProviderConfig {
    ProviderConfig::new("http://localhost:8104", 120)
}

/// Work queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempts per unit of work, including the first
    #[serde(default = "default_unit_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Double the delay on every retry
    #[serde(default = "default_exponential")]
    pub exponential: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_unit_attempts(),
            backoff_ms: default_backoff_ms(),
            exponential: default_exponential(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_unit_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    10_000
}

fn default_exponential() -> bool {
    true
}

/// Stale-state sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// How often the sweep runs, in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// A job running longer than this is timed out, in seconds
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// A processing project with no jobs is only failed after this, in seconds
    #[serde(default = "default_dispatch_grace_secs")]
    pub dispatch_grace_secs: u64,

    /// A pipeline step running (or idle in auto mode) longer than this is abandoned, in seconds
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            dispatch_grace_secs: default_dispatch_grace_secs(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn job_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_timeout_secs as i64)
    }

    pub fn dispatch_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dispatch_grace_secs as i64)
    }

    pub fn step_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.step_timeout_secs as i64)
    }
}

fn default_interval_secs() -> u64 {
    30 * 60
}

fn default_job_timeout_secs() -> u64 {
    60 * 60
}

fn default_dispatch_grace_secs() -> u64 {
    10 * 60
}

fn default_step_timeout_secs() -> u64 {
    30 * 60
}

impl ConductorConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ConductorConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, provider) in [
            ("llm", &self.providers.llm),
            ("music", &self.providers.music),
            ("image", &self.providers.image),
            ("renderer", &self.providers.renderer),
        ] {
            if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://") {
                anyhow::bail!(
                    "Provider '{}' base_url must be an http(s) URL, got '{}'",
                    name,
                    provider.base_url
                );
            }
            if provider.poll_interval_ms == 0 {
                anyhow::bail!("Provider '{}' poll_interval_ms must be positive", name);
            }
            if provider.max_attempts == 0 {
                anyhow::bail!("Provider '{}' max_attempts must be positive", name);
            }
        }

        if self.queue.workers == 0 {
            anyhow::bail!("queue.workers must be at least 1");
        }
        if self.queue.max_attempts == 0 {
            anyhow::bail!("queue.max_attempts must be at least 1");
        }
        if self.reconciler.interval_secs == 0 {
            anyhow::bail!("reconciler.interval_secs must be positive");
        }
        if self.reconciler.job_timeout_secs == 0 || self.reconciler.step_timeout_secs == 0 {
            anyhow::bail!("reconciler timeouts must be positive");
        }

        Ok(())
    }

    /// Database path, falling back to the local data directory
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        let db_dir = data_dir.join("conductor");
        std::fs::create_dir_all(&db_dir)?;
        Ok(db_dir.join("conductor.db"))
    }
}

/// A generation run request loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFile {
    /// Project name
    pub project: String,

    #[serde(rename = "type", default)]
    pub kind: PipelineType,

    #[serde(default)]
    pub mode: PipelineMode,

    pub theme: String,

    #[serde(default)]
    pub target_duration_secs: Option<u32>,

    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl RunFile {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let run: RunFile = serde_yaml::from_str(yaml)?;
        if run.theme.trim().is_empty() {
            anyhow::bail!("Run theme must not be empty");
        }
        if run.target_duration_secs == Some(0) {
            anyhow::bail!("target_duration_secs must be positive");
        }
        Ok(run)
    }

    /// Convert into the run-level configuration stored on the pipeline
    pub fn to_run_config(&self) -> RunConfig {
        let mut run = RunConfig::new(self.theme.clone());
        if let Some(duration) = self.target_duration_secs {
            run.target_duration_secs = duration;
        }
        if let Some(platform) = &self.platform {
            run.platform = platform.clone();
        }
        run.variables = self.variables.clone();
        run
    }
}
