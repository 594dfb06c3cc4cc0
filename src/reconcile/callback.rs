//! Pipeline steps finished by an external task's callback
//!
//! The engine parks such a step in the running state with the task id it
//! waits for. Whoever learns the task's fate (the webhook reconciler, or the
//! sweep giving up on it) finishes the step through [`finish_awaiting_step`].

use crate::core::{Advance, LogType, Pipeline, PipelineStatus, StepState, StepStatus};
use crate::events::{EventEmitter, PipelineTopic};
use crate::persistence::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Finish the step of `pipeline_id` that waits on `task_id`
///
/// `Ok(output)` completes the step with its checkpoint extended by `output`;
/// `Err(cause)` fails the step and, with it, the pipeline. Returns the
/// pipeline status written, or None when no live step waits on the task.
pub async fn finish_awaiting_step(
    store: &dyn Store,
    emitter: &EventEmitter,
    agent_type: &str,
    pipeline_id: Uuid,
    task_id: &str,
    outcome: Result<Value, String>,
    now: DateTime<Utc>,
) -> Result<Option<PipelineStatus>> {
    let Some(mut pipeline) = store.load_pipeline(pipeline_id).await? else {
        warn!(pipeline_id = %pipeline_id, task_id, "Task belongs to an unknown pipeline");
        return Ok(None);
    };
    if pipeline.status.is_terminal() {
        debug!(pipeline_id = %pipeline_id, task_id, "Pipeline already finished");
        return Ok(None);
    }
    let Some(step) = pipeline.step_awaiting(task_id) else {
        debug!(pipeline_id = %pipeline_id, task_id, "No step waits for this task");
        return Ok(None);
    };

    let topic = emitter.topic(pipeline.id);
    match outcome {
        Ok(output) => {
            let mut result = pipeline
                .step_state(step)
                .and_then(StepState::checkpoint)
                .cloned()
                .unwrap_or_else(|| json!({}));
            extend(&mut result, output);

            let advance = pipeline.complete_step(step, result.clone(), now)?;
            if !store.save_pipeline(&pipeline).await? {
                return Ok(None);
            }

            info!("Step {} of pipeline {} completed by task {}", step, pipeline.id, task_id);
            log(emitter, &topic, step.as_str(), LogType::Result, format!("Step {} completed", step), Some(result.clone()))
                .await;
            emitter.step_status(&topic, step, StepStatus::Completed, 100, None);
            let next_step = match advance {
                Advance::Next(next) => Some(next),
                Advance::Finished => None,
            };
            emitter.step_completed(&topic, step, result, next_step);

            match advance {
                Advance::Finished => {
                    log(emitter, &topic, agent_type, LogType::Info, "Pipeline completed", None).await;
                }
                Advance::Next(next) => {
                    warn!(pipeline_id = %pipeline.id, "Step {} is next; it runs when the pipeline is driven", next);
                }
            }
        }
        Err(cause) => {
            pipeline.fail_step(step, cause.clone(), now)?;
            if !store.save_pipeline(&pipeline).await? {
                return Ok(None);
            }

            error!("Pipeline {} failed at step {}: {}", pipeline.id, step, cause);
            log(emitter, &topic, step.as_str(), LogType::Error, cause.clone(), None).await;
            emitter.step_status(&topic, step, StepStatus::Failed, pipeline.current_step_progress, Some(cause));
        }
    }

    close_if_finished(emitter, &pipeline);
    Ok(Some(pipeline.status))
}

fn close_if_finished(emitter: &EventEmitter, pipeline: &Pipeline) {
    if pipeline.status.is_terminal() {
        emitter.hub().close(pipeline.id);
    }
}

/// Shallow merge of object fields; a non-object `extra` replaces `base`
fn extend(base: &mut Value, extra: Value) {
    match extra {
        Value::Object(more) if base.is_object() => {
            if let Some(fields) = base.as_object_mut() {
                fields.extend(more);
            }
        }
        extra => *base = extra,
    }
}

async fn log(
    emitter: &EventEmitter,
    topic: &PipelineTopic,
    agent_type: &str,
    log_type: LogType,
    message: impl Into<String>,
    data: Option<Value>,
) {
    if let Err(e) = emitter.emit(topic, agent_type, log_type, message, data).await {
        warn!(pipeline_id = %topic.pipeline_id(), error = %e, "Failed to record pipeline log");
    }
}
