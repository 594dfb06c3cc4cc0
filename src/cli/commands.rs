//! CLI command definitions

use crate::core::PipelineMode;
use clap::Args;
use uuid::Uuid;

/// Create a project and run a pipeline for it
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the run YAML file
    #[arg(short, long)]
    pub file: String,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,

    /// Override the mode from the run file
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,
}

/// A command that only needs a pipeline id
#[derive(Debug, Args, Clone)]
pub struct PipelineArg {
    pub pipeline_id: Uuid,
}

/// Show a pipeline
#[derive(Debug, Args, Clone)]
pub struct ShowCommand {
    pub pipeline_id: Uuid,

    /// Include the pipeline log
    #[arg(long)]
    pub logs: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Feed a provider callback payload to the reconciler
#[derive(Debug, Args, Clone)]
pub struct WebhookCommand {
    /// Path to a JSON payload file
    #[arg(short, long, conflicts_with = "payload")]
    pub file: Option<String>,

    /// Inline JSON payload
    #[arg(long)]
    pub payload: Option<String>,
}

/// Repair stale projects and pipelines
#[derive(Debug, Args, Clone)]
pub struct SweepCommand {
    /// Keep sweeping at the configured interval until interrupted
    #[arg(long)]
    pub watch: bool,
}

/// Validate configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Run file to validate alongside the engine configuration
    #[arg(short, long)]
    pub file: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Pipeline mode argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModeArg {
    Auto,
    Manual,
}

impl From<ModeArg> for PipelineMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Auto => PipelineMode::Auto,
            ModeArg::Manual => PipelineMode::Manual,
        }
    }
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
