//! Theme agent: turns the run's free-text theme into a creative concept

use crate::agent::{ProviderHandle, StepError, StepOutput};
use crate::core::{LogType, StepContext};
use crate::events::StepReporter;
use crate::provider::TaskRequest;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Concept returned by the LLM gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeConcept {
    pub title: String,
    pub concept: String,
    pub mood: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

pub async fn execute(
    context: &StepContext,
    llm: &ProviderHandle,
    reporter: &StepReporter,
    cancel: &CancellationToken,
) -> Result<StepOutput, StepError> {
    let request = TaskRequest::new(
        "theme",
        json!({
            "theme": context.run.theme,
            "platform": context.run.platform,
            "target_duration_secs": context.run.target_duration_secs,
            "variables": context.run.variables,
        }),
    );

    reporter.thinking(format!("Developing a concept for \"{}\"", context.run.theme)).await;
    let (_, status) = llm.run(&request, reporter, cancel).await?;

    let concept = parse_concept(status.output.as_ref())?;
    reporter.log(LogType::Result, format!("Concept: {}", concept.title), None).await;

    let result = serde_json::to_value(&concept)
        .map_err(|e| StepError::permanent(format!("theme result: {}", e)))?;
    Ok(StepOutput::new(result))
}

/// Accepts the concept as an object or as a JSON string
fn parse_concept(output: Option<&Value>) -> Result<ThemeConcept, StepError> {
    let output = output.ok_or_else(|| StepError::permanent("theme provider returned no output"))?;
    let parsed = match output {
        Value::String(text) => serde_json::from_str::<ThemeConcept>(text),
        other => serde_json::from_value::<ThemeConcept>(other.clone()),
    };
    let concept = parsed.map_err(|e| StepError::permanent(format!("theme output is malformed: {}", e)))?;

    if concept.title.trim().is_empty() {
        return Err(StepError::permanent("theme output has an empty title"));
    }
    Ok(concept)
}
