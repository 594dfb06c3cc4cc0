//! Visuals agent: plans the scenes the image step will render

use crate::agent::{ProviderHandle, StepError, StepOutput};
use crate::core::{LogType, StepContext, StepId};
use crate::events::StepReporter;
use crate::provider::TaskRequest;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// One planned scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub index: usize,
    pub prompt: String,
    pub duration_secs: f64,
}

#[derive(Debug, Deserialize)]
struct RawScene {
    prompt: String,
    #[serde(default)]
    duration_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    scenes: Vec<RawScene>,
}

pub async fn execute(
    context: &StepContext,
    llm: &ProviderHandle,
    reporter: &StepReporter,
    cancel: &CancellationToken,
) -> Result<StepOutput, StepError> {
    let theme = context
        .result(StepId::Theme)
        .ok_or_else(|| StepError::permanent("visuals needs a completed theme step"))?;

    let request = TaskRequest::new(
        "visual_plan",
        json!({
            "title": theme.get("title"),
            "concept": theme.get("concept"),
            "mood": theme.get("mood"),
            "keywords": theme.get("keywords"),
            "platform": context.run.platform,
            "target_duration_secs": context.run.target_duration_secs,
        }),
    );

    reporter.thinking("Planning scenes").await;
    let (_, status) = llm.run(&request, reporter, cancel).await?;

    let scenes = plan_scenes(status.output.as_ref(), context.run.target_duration_secs)?;
    reporter
        .log(LogType::Result, format!("Planned {} scenes", scenes.len()), None)
        .await;

    Ok(StepOutput::new(json!({ "scenes": scenes })))
}

/// Number the scenes and spread the target duration over those without one
fn plan_scenes(output: Option<&Value>, target_duration_secs: u32) -> Result<Vec<Scene>, StepError> {
    let output = output.ok_or_else(|| StepError::permanent("visuals provider returned no output"))?;
    let plan: RawPlan = match output {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    }
    .map_err(|e| StepError::permanent(format!("visual plan is malformed: {}", e)))?;

    if plan.scenes.is_empty() {
        return Err(StepError::permanent("visual plan contains no scenes"));
    }

    let even_split = target_duration_secs as f64 / plan.scenes.len() as f64;
    Ok(plan
        .scenes
        .into_iter()
        .enumerate()
        .map(|(index, raw)| Scene {
            index,
            prompt: raw.prompt,
            duration_secs: raw.duration_secs.filter(|d| *d > 0.0).unwrap_or(even_split),
        })
        .collect())
}

/// Read the scene list back out of a completed visuals result
pub fn scenes_from(context: &StepContext) -> Result<Vec<Scene>, StepError> {
    let result = context
        .result(StepId::Visuals)
        .ok_or_else(|| StepError::permanent("a completed visuals step is required"))?;
    let scenes: Vec<Scene> = result
        .get("scenes")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StepError::permanent(format!("stored visual plan is malformed: {}", e)))?
        .unwrap_or_default();
    if scenes.is_empty() {
        return Err(StepError::permanent("visual plan contains no scenes"));
    }
    Ok(scenes)
}
