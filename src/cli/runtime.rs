//! Wiring of store, engine, queue and reconcilers for one process

use crate::agent::AgentResources;
use crate::core::config::ConductorConfig;
use crate::events::{EventEmitter, TopicHub};
use crate::execution::{ConductorHandler, PipelineControl, PipelineEngine, StepExecutor, WorkQueue};
use crate::persistence::{InMemoryStore, Store};
use crate::reconcile::{StaleReconciler, WebhookReconciler};
use crate::storage::{LocalObjectStore, ObjectStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Runtime {
    pub config: ConductorConfig,
    pub store: Arc<dyn Store>,
    pub engine: Arc<PipelineEngine>,
    pub queue: Arc<WorkQueue>,
    pub control: PipelineControl,
    pub reconciler: Arc<WebhookReconciler>,
    pub stale: StaleReconciler,
}

impl Runtime {
    /// Build the runtime with HTTP providers and the local object store
    pub async fn build(config: ConductorConfig, ephemeral: bool) -> Result<Self> {
        let store = open_store(&config, ephemeral).await?;
        let storage: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::from_config(&config.storage));
        let resources = AgentResources::from_config(&config.providers, storage)
            .context("Failed to set up providers")?;
        Ok(Self::from_parts(config, store, resources))
    }

    /// Build the runtime over given collaborators
    pub fn from_parts(config: ConductorConfig, store: Arc<dyn Store>, resources: AgentResources) -> Self {
        let hub = Arc::new(TopicHub::new());
        let storage = resources.storage.clone();
        let engine = Arc::new(PipelineEngine::new(
            store.clone(),
            hub.clone(),
            StepExecutor::new(resources),
        ));
        let reconciler = Arc::new(WebhookReconciler::new(
            store.clone(),
            storage,
            engine.emitter().clone(),
        ));
        let handler = Arc::new(ConductorHandler::new(engine.clone(), reconciler.clone()));
        let queue = Arc::new(WorkQueue::from_config(handler, &config.queue));
        let stale = StaleReconciler::new(
            store.clone(),
            EventEmitter::new(store.clone(), hub),
            config.reconciler.clone(),
        );

        Self {
            control: PipelineControl::new(engine.clone(), queue.clone()),
            config,
            store,
            engine,
            queue,
            reconciler,
            stale,
        }
    }

    /// Interrupt running steps and stop the workers
    pub async fn shutdown(&self) {
        self.engine.shutdown();
        self.queue.shutdown().await;
        debug!("Runtime stopped");
    }
}

async fn open_store(config: &ConductorConfig, ephemeral: bool) -> Result<Arc<dyn Store>> {
    if ephemeral {
        info!("Using in-memory store");
        return Ok(Arc::new(InMemoryStore::new()));
    }

    #[cfg(feature = "sqlite")]
    {
        let path = config.database_path()?;
        info!("Using database {}", path.display());
        let store = crate::persistence::SqliteStore::new(&path.to_string_lossy()).await?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "sqlite"))]
    {
        let _ = config;
        info!("Built without SQLite support, using in-memory store");
        Ok(Arc::new(InMemoryStore::new()))
    }
}
