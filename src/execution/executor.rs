//! Step executor - runs individual steps with their agent

use crate::{
    agent::{AgentResources, AgentTable, StepError, StepOutput},
    core::{StepContext, StepId},
    events::StepReporter,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of executing a step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step completed successfully
    Completed(StepOutput),
    /// Step failed for good; the pipeline fails with this message
    Failed(String),
    /// Step should be attempted again by the work queue
    Transient(String),
    /// Execution was interrupted through the cancellation token
    Cancelled,
}

/// Executes a single step
#[derive(Clone)]
pub struct StepExecutor {
    agents: AgentTable,
    resources: AgentResources,
}

impl StepExecutor {
    pub fn new(resources: AgentResources) -> Self {
        Self {
            agents: AgentTable::default(),
            resources,
        }
    }

    /// Execute a step and classify the result
    pub async fn execute(
        &self,
        step: StepId,
        context: &StepContext,
        reporter: &StepReporter,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        info!("Executing step: {} (pipeline {})", step, context.pipeline_id);

        let Some(agent) = self.agents.get(step) else {
            return StepOutcome::Failed(format!("no agent registered for step {}", step));
        };

        match agent.execute(context, &self.resources, reporter, cancel).await {
            Ok(output) => StepOutcome::Completed(output),
            Err(StepError::Cancelled) => StepOutcome::Cancelled,
            Err(e) if e.is_transient() => {
                warn!("Step {} hit a transient error: {}", step, e);
                StepOutcome::Transient(e.to_string())
            }
            Err(e) => {
                warn!("Step {} failed: {}", step, e);
                StepOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunConfig;
    use crate::provider::ProviderError;
    use crate::test_support::{reporter, resources, Behavior, MemoryObjectStore, MockProvider};
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn executor(llm: MockProvider) -> StepExecutor {
        StepExecutor::new(resources(
            Arc::new(llm),
            Arc::new(MockProvider::new("music", Behavior::NeverFinish)),
            Arc::new(MockProvider::new("image", Behavior::NeverFinish)),
            Arc::new(MockProvider::new("renderer", Behavior::NeverFinish)),
            Arc::new(MemoryObjectStore::default()),
        ))
    }

    #[tokio::test]
    async fn test_outcome_classification() {
        let ctx = StepContext::new(Uuid::new_v4(), Uuid::new_v4(), RunConfig::new("x"));
        let reporter = reporter(ctx.pipeline_id, StepId::Theme);
        let cancel = CancellationToken::new();

        let ok = executor(MockProvider::completing(
            "llm",
            json!({"title": "a", "concept": "b", "mood": "c"}),
        ));
        assert!(matches!(
            ok.execute(StepId::Theme, &ctx, &reporter, &cancel).await,
            StepOutcome::Completed(_)
        ));

        let busy = executor(MockProvider::new(
            "llm",
            Behavior::SubmitError(ProviderError::Unavailable("503".into())),
        ));
        assert!(matches!(
            busy.execute(StepId::Theme, &ctx, &reporter, &cancel).await,
            StepOutcome::Transient(_)
        ));

        let denied = executor(MockProvider::new("llm", Behavior::SubmitError(ProviderError::InvalidCredentials)));
        assert_eq!(
            denied.execute(StepId::Theme, &ctx, &reporter, &cancel).await,
            StepOutcome::Failed("llm provider rejected our credentials".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_submit() {
        let ctx = StepContext::new(Uuid::new_v4(), Uuid::new_v4(), RunConfig::new("x"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let llm = MockProvider::completing("llm", json!({}));
        let outcome = executor(llm)
            .execute(StepId::Theme, &ctx, &reporter(ctx.pipeline_id, StepId::Theme), &cancel)
            .await;
        assert_eq!(outcome, StepOutcome::Cancelled);
    }
}
