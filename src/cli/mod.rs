//! Command-line interface

pub mod commands;
pub mod output;
pub mod runtime;

use clap::{Parser, Subcommand};
use commands::{PipelineArg, RunCommand, ShowCommand, SweepCommand, ValidateCommand, WebhookCommand};
use std::ffi::OsString;

pub use runtime::Runtime;

/// Orchestrates AI content-generation pipelines
#[derive(Debug, Parser, Clone)]
#[command(name = "conductor")]
#[command(version = "0.1.0")]
#[command(about = "Run and reconcile multi-step AI content-generation pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the engine configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Keep state in memory only (nothing survives the process)
    #[arg(long, global = true)]
    pub ephemeral: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Create a project and run a pipeline for it
    Run(RunCommand),

    /// Run the current step of a manual pipeline
    Step(PipelineArg),

    /// Pause a running pipeline
    Pause(PipelineArg),

    /// Resume a paused pipeline
    Resume(PipelineArg),

    /// Cancel a pipeline
    Cancel(PipelineArg),

    /// Re-run the failed step of a pipeline as a new pipeline
    Retry(PipelineArg),

    /// Show a pipeline with its steps and logs
    Show(ShowCommand),

    /// Feed a provider callback payload to the reconciler
    Webhook(WebhookCommand),

    /// Repair stale projects and pipelines
    Sweep(SweepCommand),

    /// Validate the engine configuration and a run file
    Validate(ValidateCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
