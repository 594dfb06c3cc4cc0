//! conductor - orchestration and reconciliation of AI content-generation pipelines

pub mod agent;
pub mod cli;
pub mod core;
pub mod events;
pub mod execution;
pub mod persistence;
pub mod provider;
pub mod reconcile;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use agent::{AgentResources, ProviderHandle, StepError, StepOutput};
pub use core::{Pipeline, PipelineMode, PipelineStatus, PipelineType, StepId, StepState};
pub use events::{EventEmitter, PipelineEvent, TopicHub};
pub use execution::{PipelineControl, PipelineEngine, WorkQueue, WorkUnit};
pub use persistence::{InMemoryStore, Store};
pub use reconcile::{StaleReconciler, TaskReport, WebhookReconciler};
