use anyhow::{bail, Context, Result};
use chrono::Utc;
use conductor::cli::commands::{PipelineArg, RunCommand, ShowCommand, SweepCommand, ValidateCommand, WebhookCommand};
use conductor::cli::output::*;
use conductor::cli::{Cli, Command, Runtime};
use conductor::core::config::{ConductorConfig, RunFile};
use conductor::core::{Pipeline, PipelineMode, PipelineStatus, Project, StepState};
use conductor::execution::{EngineError, WorkUnit};
use conductor::persistence::Store;
use conductor::reconcile::TaskReport;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

const DEFAULT_CONFIG: &str = "conductor.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(log_level).into()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    let config = load_config(cli.config.as_deref())?;
    if let Command::Validate(cmd) = &cli.command {
        return validate(cmd, &config);
    }

    let runtime = Runtime::build(config, cli.ephemeral).await?;
    let result = match &cli.command {
        Command::Run(cmd) => run_pipeline(&runtime, cmd).await,
        Command::Step(arg) => run_step(&runtime, arg).await,
        Command::Pause(arg) => print_control(runtime.control.pause(arg.pipeline_id).await, "paused"),
        Command::Resume(arg) => resume(&runtime, arg).await,
        Command::Cancel(arg) => print_control(runtime.control.cancel(arg.pipeline_id).await, "cancelled"),
        Command::Retry(arg) => retry(&runtime, arg).await,
        Command::Show(cmd) => show(&runtime, cmd).await,
        Command::Webhook(cmd) => webhook(&runtime, cmd).await,
        Command::Sweep(cmd) => sweep(&runtime, cmd).await,
        Command::Validate(_) => Ok(()),
    };
    runtime.shutdown().await;

    if let Err(e) = &result {
        error!("{:#}", e);
        println!("\n{} {}", CROSS, style(format!("{:#}", e)).red());
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(path: Option<&str>) -> Result<ConductorConfig> {
    match path {
        Some(path) => ConductorConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            ConductorConfig::from_file(DEFAULT_CONFIG).context("Failed to load conductor.yaml")
        }
        None => Ok(ConductorConfig::default()),
    }
}

async fn run_pipeline(rt: &Runtime, cmd: &RunCommand) -> Result<()> {
    let run_file = RunFile::from_file(&cmd.file).context("Failed to load run file")?;
    let mut run = run_file.to_run_config();

    // Apply variable overrides
    for (key, value) in &cmd.var {
        run.variables.insert(key.clone(), value.clone());
        println!("{} Variable override: {} = {}", INFO, style(key).cyan(), style(value).dim());
    }
    let mode = cmd.mode.map(PipelineMode::from).unwrap_or(run_file.mode);

    let project = Project::new(run_file.project.clone());
    rt.store.insert_project(&project).await?;
    let pipeline = rt.engine.create(project.id, run_file.kind, mode, run).await?;

    println!(
        "{} Starting {} pipeline {} for {}",
        ROCKET,
        style(pipeline.kind).bold(),
        style(pipeline.id).dim(),
        style(&project.name).cyan()
    );

    let pipeline = follow(rt, pipeline.id, rt.control.start(pipeline.id)).await?;
    report_outcome(rt, &pipeline).await
}

async fn run_step(rt: &Runtime, arg: &PipelineArg) -> Result<()> {
    let pipeline = follow(rt, arg.pipeline_id, rt.control.run_step(arg.pipeline_id)).await?;
    report_outcome(rt, &pipeline).await
}

async fn resume(rt: &Runtime, arg: &PipelineArg) -> Result<()> {
    let pipeline = follow(rt, arg.pipeline_id, rt.control.resume(arg.pipeline_id)).await?;
    report_outcome(rt, &pipeline).await
}

async fn retry(rt: &Runtime, arg: &PipelineArg) -> Result<()> {
    let retry = rt.control.retry(arg.pipeline_id).await?;
    println!(
        "{} Retrying as {} from step {}",
        ROCKET,
        style(retry.id).dim(),
        style(retry.current_step.map(|s| s.as_str()).unwrap_or("-")).cyan()
    );
    let pipeline = follow(rt, retry.id, async { Ok::<_, EngineError>(retry.clone()) }).await?;
    report_outcome(rt, &pipeline).await
}

fn print_control(result: Result<Pipeline, EngineError>, verb: &str) -> Result<()> {
    let pipeline = result?;
    println!("{} Pipeline {} {}", INFO, style(pipeline.id).dim(), verb);
    println!("{}", format_pipeline_summary(&pipeline));
    Ok(())
}

/// Run a control operation while printing the pipeline's events, then wait
/// for the queue to drain
async fn follow<F>(rt: &Runtime, pipeline_id: Uuid, op: F) -> Result<Pipeline>
where
    F: std::future::Future<Output = Result<Pipeline, EngineError>>,
{
    let (printer, bar) = spawn_event_printer(rt.engine.subscribe(pipeline_id));
    let result = op.await;
    if result.is_ok() {
        rt.queue.wait_idle().await;
    }
    printer.abort();
    bar.finish_and_clear();

    result?;
    Ok(rt.engine.load(pipeline_id).await?)
}

async fn report_outcome(rt: &Runtime, pipeline: &Pipeline) -> Result<()> {
    println!();
    match pipeline.status {
        PipelineStatus::Completed => {
            println!("{} Pipeline {} completed {}", CHECK, style(pipeline.id).dim(), style("successfully").green());
            if let Some(project) = rt.store.load_project(pipeline.project_id).await? {
                if project.status == conductor::core::ProjectStatus::Processing {
                    println!("{} Project is processing; waiting for the renderer callback", SPINNER);
                }
            }
        }
        PipelineStatus::Running if pipeline.is_idle() && pipeline.mode == PipelineMode::Manual => {
            println!(
                "{} Step {} is ready. Run it with: conductor step {}",
                INFO,
                style(pipeline.current_step.map(|s| s.as_str()).unwrap_or("-")).cyan(),
                pipeline.id
            );
        }
        PipelineStatus::Failed => {
            println!(
                "{} Pipeline {} {}: {}",
                CROSS,
                style(pipeline.id).dim(),
                style("failed").red(),
                pipeline.error_message.as_deref().unwrap_or("unknown error")
            );
            bail!("pipeline failed");
        }
        _ => println!("{}", format_pipeline_summary(pipeline)),
    }
    Ok(())
}

async fn show(rt: &Runtime, cmd: &ShowCommand) -> Result<()> {
    let pipeline = rt.engine.load(cmd.pipeline_id).await?;
    let logs = if cmd.logs {
        rt.store.list_logs(pipeline.id).await?
    } else {
        Vec::new()
    };

    if cmd.json {
        let data = serde_json::json!({ "pipeline": pipeline, "logs": logs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("{} Pipeline Details", INFO);
    println!("  ID: {}", style(pipeline.id).cyan());
    println!("  Type: {} ({})", style(pipeline.kind).bold(), pipeline.mode.as_str());
    println!("  Status: {}", format_status(&pipeline));
    println!("  Theme: {}", pipeline.run.theme);
    if let Some(started) = pipeline.started_at {
        println!("  Started: {}", style(started.to_rfc3339()).dim());
        let end = pipeline.completed_at.unwrap_or_else(Utc::now);
        if let Ok(duration) = end.signed_duration_since(started).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    if let Some(retry_of) = pipeline.retry_of {
        println!("  Retry of: {}", style(retry_of).dim());
    }
    if let Some(error) = &pipeline.error_message {
        println!("  Error: {}", style(error).red());
    }

    println!("\n  {}", style("Steps:").bold());
    for step in pipeline.kind.steps() {
        let Some(state) = pipeline.step_state(*step) else {
            continue;
        };
        let marker = if pipeline.current_step == Some(*step) { ">" } else { " " };
        println!("  {} {:<12} {}", marker, step.as_str(), format_step_state(state));
        match state {
            StepState::Completed { result, .. } => {
                for line in format_result(result, 6).lines() {
                    println!("      {}", style(line).dim());
                }
            }
            StepState::Failed { error, .. } => println!("      {}", style(error).red()),
            _ => {}
        }
    }

    if let Some(project) = rt.store.load_project(pipeline.project_id).await? {
        println!("\n  Project: {} ({})", style(&project.name).bold(), project.status.as_str());
        for asset in rt.store.list_assets(project.id).await? {
            let state = match (&asset.failure, asset.is_resolved()) {
                (Some(failure), _) => style(format!("failed: {}", failure)).red().to_string(),
                (None, true) => asset.permanent_url.clone(),
                (None, false) => style("pending").yellow().to_string(),
            };
            println!("    {:<12} {}", asset.asset_type.as_str(), state);
        }
    }

    if cmd.logs {
        println!("\n  {}", style("Log:").bold());
        for log in &logs {
            println!("{}", format_log(log));
        }
    }

    Ok(())
}

async fn webhook(rt: &Runtime, cmd: &WebhookCommand) -> Result<()> {
    let raw = match (&cmd.file, &cmd.payload) {
        (Some(path), _) => std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?,
        (None, Some(payload)) => payload.clone(),
        (None, None) => bail!("Provide a payload with --file or --payload"),
    };
    let payload: serde_json::Value = serde_json::from_str(&raw).context("Payload is not valid JSON")?;
    let report = TaskReport::from_json(&payload)?;

    println!(
        "{} Reconciling task {} ({})",
        INFO,
        style(&report.task_id).cyan(),
        report.status
    );
    rt.queue.enqueue(WorkUnit::Reconcile(report.clone()))?;
    rt.queue.wait_idle().await;

    match rt.store.find_job_by_task(&report.task_id).await? {
        Some(job) => {
            println!("  Job: {} {}", job.job_type, job.status.as_str());
            if let Some(error) = &job.error_message {
                println!("  Error: {}", style(error).red());
            }
            if let Some(project) = rt.store.load_project(job.project_id).await? {
                println!("  Project: {} {}", project.name, project.status.as_str());
            }
        }
        None => println!("{} No job is waiting on task {}", WARN, report.task_id),
    }
    Ok(())
}

async fn sweep(rt: &Runtime, cmd: &SweepCommand) -> Result<()> {
    if cmd.watch {
        let token = CancellationToken::new();
        let stop = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.cancel();
            }
        });
        println!(
            "{} Sweeping every {} (Ctrl-C to stop)",
            INFO,
            format_duration(rt.config.reconciler.interval())
        );
        rt.stale.run_periodic(token).await;
        return Ok(());
    }

    let report = rt.stale.sweep(Utc::now()).await?;
    println!("{} Checked {} processing projects", INFO, report.projects_checked);
    for id in &report.projects_completed {
        println!("  {} project {} completed", CHECK, style(id).dim());
    }
    for (id, reason) in &report.projects_failed {
        println!("  {} project {} failed: {}", CROSS, style(id).dim(), reason);
    }
    for (id, reason) in &report.pipelines_failed {
        println!("  {} pipeline {} failed: {}", CROSS, style(id).dim(), reason);
    }
    if report.is_empty() {
        println!("{} Nothing to repair", CHECK);
    }
    Ok(())
}

fn validate(cmd: &ValidateCommand, config: &ConductorConfig) -> Result<()> {
    println!("{} Validating configuration...", INFO);
    config.validate()?;
    println!("{} Engine configuration is valid!", CHECK);
    println!("  Database: {}", style(config.database_path()?.display()).dim());
    println!("  Workers: {}", style(config.queue.workers).cyan());
    for (name, provider) in [
        ("llm", &config.providers.llm),
        ("music", &config.providers.music),
        ("image", &config.providers.image),
        ("renderer", &config.providers.renderer),
    ] {
        println!("  {:<9} {}", name, style(&provider.base_url).dim());
    }

    let run = match &cmd.file {
        Some(path) => match RunFile::from_file(path) {
            Ok(run) => {
                println!("{} Run file is valid!", CHECK);
                println!("  Project: {}", style(&run.project).bold());
                println!("  Type: {} ({:?})", style(run.kind).cyan(), run.mode);
                let steps: Vec<_> = run.kind.steps().iter().map(|s| s.as_str()).collect();
                println!("  Steps: {}", steps.join(" → "));
                Some(run)
            }
            Err(e) => {
                println!("{} Validation failed:", CROSS);
                println!("  {}", style(e).red());
                std::process::exit(1);
            }
        },
        None => None,
    };

    if cmd.json {
        let data = serde_json::json!({ "config": config, "run": run });
        println!("\n{}", serde_json::to_string_pretty(&data)?);
    }
    Ok(())
}
