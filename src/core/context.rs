//! Step context - accumulated prior results plus run-level configuration

use crate::core::StepId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Run-level configuration shared by every step of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Free-text theme the whole run is built around
    pub theme: String,

    /// Target length of the final piece in seconds
    #[serde(default = "default_duration")]
    pub target_duration_secs: u32,

    /// Publishing platform (e.g. "youtube", "tiktok")
    #[serde(default = "default_platform")]
    pub platform: String,

    /// User-defined variables
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

fn default_duration() -> u32 {
    60
}

fn default_platform() -> String {
    "youtube".to_string()
}

impl RunConfig {
    pub fn new(theme: impl Into<String>) -> Self {
        Self {
            theme: theme.into(),
            target_duration_secs: default_duration(),
            platform: default_platform(),
            variables: HashMap::new(),
        }
    }
}

/// Input handed to a step executor
///
/// Plain data only, so executors can be tested without a pipeline record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepContext {
    pub pipeline_id: Uuid,
    pub project_id: Uuid,
    pub run: RunConfig,

    /// Results of completed steps (step -> result)
    pub results: BTreeMap<StepId, Value>,

    /// Partial work saved by an earlier attempt of the current step
    #[serde(default)]
    pub checkpoint: Option<Value>,
}

impl StepContext {
    pub fn new(pipeline_id: Uuid, project_id: Uuid, run: RunConfig) -> Self {
        Self {
            pipeline_id,
            project_id,
            run,
            results: BTreeMap::new(),
            checkpoint: None,
        }
    }

    /// Record the result of a step
    pub fn with_result(mut self, step: StepId, result: Value) -> Self {
        self.results.insert(step, result);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Value) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Get the result of a step
    pub fn result(&self, step: StepId) -> Option<&Value> {
        self.results.get(&step)
    }

    /// Look up a string field of a prior step's result
    pub fn result_str(&self, step: StepId, field: &str) -> Option<&str> {
        self.result(step)
            .and_then(|r| r.get(field))
            .and_then(Value::as_str)
    }

    /// Get a variable
    pub fn variable(&self, key: &str) -> Option<&String> {
        self.run.variables.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_results() {
        let ctx = StepContext::new(Uuid::new_v4(), Uuid::new_v4(), RunConfig::new("ocean"))
            .with_result(StepId::Theme, json!({"title": "Tides", "mood": "calm"}));

        assert_eq!(ctx.result_str(StepId::Theme, "mood"), Some("calm"));
        assert_eq!(ctx.result_str(StepId::Theme, "missing"), None);
        assert!(ctx.result(StepId::Music).is_none());
    }

    #[test]
    fn test_run_config_defaults() {
        let run: RunConfig = serde_yaml::from_str("theme: \"city at night\"").unwrap();
        assert_eq!(run.target_duration_secs, 60);
        assert_eq!(run.platform, "youtube");
        assert!(run.variables.is_empty());
    }

    #[test]
    fn test_context_variables() {
        let mut run = RunConfig::new("forest");
        run.variables.insert("language".to_string(), "en".to_string());
        let ctx = StepContext::new(Uuid::new_v4(), Uuid::new_v4(), run);

        assert_eq!(ctx.variable("language"), Some(&"en".to_string()));
        assert_eq!(ctx.variable("style"), None);
    }
}
