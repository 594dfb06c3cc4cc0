//! Step agents
//!
//! One agent per step id. Each agent turns the step context into exactly one
//! kind of provider call and returns the step result plus any artifacts it
//! produced.

pub mod composition;
pub mod images;
pub mod music;
pub mod response;
pub mod theme;
pub mod visuals;

use crate::core::config::ProvidersConfig;
use crate::core::{StepContext, StepId};
use crate::events::StepReporter;
use crate::provider::{HttpProvider, PollConfig, Provider, TaskPoller, TaskRequest, TaskStatus};
use crate::storage::ObjectStore;
use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use response::{ArtifactRecord, StepError, StepOutput};

/// A provider together with how long to wait for it
#[derive(Clone)]
pub struct ProviderHandle {
    pub provider: Arc<dyn Provider>,
    pub poller: TaskPoller,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn Provider>, poll: PollConfig) -> Self {
        Self {
            provider,
            poller: TaskPoller::new(poll),
        }
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    /// Submit without waiting
    pub async fn submit(&self, request: &TaskRequest) -> Result<String, StepError> {
        self.provider
            .submit(request)
            .await
            .map_err(|e| StepError::from_provider(self.name(), e))
    }

    /// Submit, report the submission, then poll to a terminal status
    pub async fn run(
        &self,
        request: &TaskRequest,
        reporter: &StepReporter,
        cancel: &CancellationToken,
    ) -> Result<(String, TaskStatus), StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let task_id = self.submit(request).await?;
        reporter
            .log(
                crate::core::LogType::Info,
                format!("Submitted {} task to {}", request.operation, self.name()),
                Some(json!({ "task_id": task_id })),
            )
            .await;

        let status = self
            .poller
            .wait(self.provider.as_ref(), &task_id, cancel)
            .await
            .map_err(|e| StepError::from_poll(self.name(), e))?;
        Ok((task_id, status))
    }
}

/// Everything agents call out to
#[derive(Clone)]
pub struct AgentResources {
    pub llm: ProviderHandle,
    pub music: ProviderHandle,
    pub image: ProviderHandle,
    /// Renderer reports back through the webhook, so it is never polled
    pub renderer: Arc<dyn Provider>,
    pub storage: Arc<dyn ObjectStore>,
    pub callback_url: Option<String>,
}

impl AgentResources {
    /// Build HTTP providers from configuration
    pub fn from_config(config: &ProvidersConfig, storage: Arc<dyn ObjectStore>) -> Result<Self> {
        let handle = |name: &str, provider: &crate::core::config::ProviderConfig| -> Result<ProviderHandle> {
            Ok(ProviderHandle::new(
                Arc::new(HttpProvider::new(name, provider)?),
                PollConfig::from(provider),
            ))
        };

        Ok(Self {
            llm: handle("llm", &config.llm)?,
            music: handle("music", &config.music)?,
            image: handle("image", &config.image)?,
            renderer: Arc::new(HttpProvider::new("renderer", &config.renderer)?),
            storage,
            callback_url: config.callback_url.clone(),
        })
    }
}

/// Closed set of step agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAgent {
    Theme,
    Music,
    Visuals,
    Images,
    Composition,
}

impl StepAgent {
    pub fn for_step(step: StepId) -> Self {
        match step {
            StepId::Theme => StepAgent::Theme,
            StepId::Music => StepAgent::Music,
            StepId::Visuals => StepAgent::Visuals,
            StepId::Images => StepAgent::Images,
            StepId::Composition => StepAgent::Composition,
        }
    }

    /// Run the step
    pub async fn execute(
        &self,
        context: &StepContext,
        resources: &AgentResources,
        reporter: &StepReporter,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        match self {
            StepAgent::Theme => theme::execute(context, &resources.llm, reporter, cancel).await,
            StepAgent::Music => {
                music::execute(context, &resources.music, resources.storage.as_ref(), reporter, cancel).await
            }
            StepAgent::Visuals => visuals::execute(context, &resources.llm, reporter, cancel).await,
            StepAgent::Images => {
                images::execute(context, &resources.image, resources.storage.as_ref(), reporter, cancel).await
            }
            StepAgent::Composition => {
                composition::execute(
                    context,
                    resources.renderer.as_ref(),
                    resources.callback_url.clone(),
                    reporter,
                )
                .await
            }
        }
    }
}

/// Lookup table from step id to agent
#[derive(Debug, Clone)]
pub struct AgentTable {
    agents: HashMap<StepId, StepAgent>,
}

impl AgentTable {
    pub fn get(&self, step: StepId) -> Option<StepAgent> {
        self.agents.get(&step).copied()
    }
}

impl Default for AgentTable {
    fn default() -> Self {
        Self {
            agents: StepId::ALL
                .into_iter()
                .map(|step| (step, StepAgent::for_step(step)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_step_has_an_agent() {
        let table = AgentTable::default();
        for step in StepId::ALL {
            assert_eq!(table.get(step), Some(StepAgent::for_step(step)));
        }
    }
}
