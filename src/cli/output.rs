//! CLI output formatting

use crate::core::{LogType, Pipeline, PipelineLog, PipelineStatus, StepState};
use crate::events::PipelineEvent;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static THINKING: Emoji<'_, '_> = Emoji("💭 ", ". ");

/// Progress bar for the running step (0-100)
pub fn create_progress_bar() -> ProgressBar {
    let progress = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a step state for display
pub fn format_step_state(state: &StepState) -> String {
    match state {
        StepState::Pending => style("PENDING").dim().to_string(),
        StepState::Running { progress, .. } => style(format!("RUNNING {}%", progress)).yellow().to_string(),
        StepState::Completed { .. } => style("COMPLETED").green().to_string(),
        StepState::Failed { .. } => style("FAILED").red().to_string(),
    }
}

/// Format a pipeline status for display
pub fn format_status(pipeline: &Pipeline) -> String {
    match pipeline.status {
        PipelineStatus::Pending => style("PENDING").dim().to_string(),
        PipelineStatus::Running if pipeline.is_idle() => style("WAITING").blue().to_string(),
        PipelineStatus::Running => style("RUNNING").yellow().to_string(),
        PipelineStatus::Paused => style("PAUSED").blue().to_string(),
        PipelineStatus::Completed => style("COMPLETED").green().to_string(),
        PipelineStatus::Failed if pipeline.is_cancelled() => style("CANCELLED").yellow().to_string(),
        PipelineStatus::Failed => style("FAILED").red().to_string(),
    }
}

/// One-line summary of a pipeline
pub fn format_pipeline_summary(pipeline: &Pipeline) -> String {
    let icon = match pipeline.status {
        PipelineStatus::Completed => CHECK,
        PipelineStatus::Failed => CROSS,
        PipelineStatus::Running => SPINNER,
        _ => INFO,
    };
    let done = pipeline
        .steps_state
        .values()
        .filter(|s| matches!(s, StepState::Completed { .. }))
        .count();

    format!(
        "{} {} - {} - {} ({}/{}) - step {}",
        icon,
        style(pipeline.id).dim(),
        style(pipeline.kind).bold(),
        format_status(pipeline),
        done,
        pipeline.steps_state.len(),
        style(pipeline.current_step.map(|s| s.as_str()).unwrap_or("-")).cyan()
    )
}

/// Format a live pipeline event for display
pub fn format_event(event: &PipelineEvent) -> Option<String> {
    match event {
        PipelineEvent::Progress { .. } => None,
        PipelineEvent::Log {
            agent_type,
            log_type,
            message,
            ..
        } => {
            let icon = match log_type {
                LogType::Error => CROSS,
                LogType::Result => CHECK,
                LogType::Thinking => THINKING,
                LogType::Progress => SPINNER,
                LogType::Info => INFO,
            };
            Some(format!("{} [{}] {}", icon, style(agent_type).dim(), message))
        }
        PipelineEvent::StepCompleted { step, next_step, .. } => Some(match next_step {
            Some(next) => format!("{} {} → {}", CHECK, style(step).green(), style(next).cyan()),
            None => format!("{} {}", CHECK, style(step).green()),
        }),
    }
}

/// Format a stored log entry
pub fn format_log(log: &PipelineLog) -> String {
    let kind = match log.log_type {
        LogType::Error => style(log.log_type.as_str()).red(),
        LogType::Result => style(log.log_type.as_str()).green(),
        _ => style(log.log_type.as_str()).dim(),
    };
    format!(
        "  {} {:<10} {:<8} {}",
        style(log.created_at.format("%H:%M:%S")).dim(),
        log.agent_type,
        kind,
        log.message
    )
}

/// Print events of one pipeline until the task is aborted
///
/// Progress events drive a progress bar; everything else is printed above it.
pub fn spawn_event_printer(mut events: broadcast::Receiver<PipelineEvent>) -> (JoinHandle<()>, ProgressBar) {
    let bar = create_progress_bar();
    let printer_bar = bar.clone();
    let handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PipelineEvent::Progress { step, value, message, .. }) => {
                    printer_bar.set_position(value as u64);
                    printer_bar.set_message(match message {
                        Some(message) => format!("{}: {}", step, message),
                        None => step.to_string(),
                    });
                }
                Ok(event) => {
                    if let Some(line) = format_event(&event) {
                        printer_bar.println(line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    printer_bar.println(format!("{} {} events missed", WARN, missed));
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
    (handle, bar)
}

/// Render a step result with truncation
pub fn format_result(result: &Value, max_lines: usize) -> String {
    let text = serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string());
    let lines: Vec<&str> = text.lines().collect();

    if lines.len() <= max_lines {
        text
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
