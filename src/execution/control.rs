//! Pipeline control surface
//!
//! Every operation changes state through the engine and returns the updated
//! pipeline. Operations that need a step executed hand the pipeline to the
//! work queue instead of running it on the caller's task.

use crate::core::{Pipeline, PipelineMode, PipelineType, RunConfig};
use crate::execution::{EngineError, PipelineEngine, WorkQueue, WorkUnit};
use std::sync::Arc;
use uuid::Uuid;

pub struct PipelineControl {
    engine: Arc<PipelineEngine>,
    queue: Arc<WorkQueue>,
}

impl PipelineControl {
    pub fn new(engine: Arc<PipelineEngine>, queue: Arc<WorkQueue>) -> Self {
        Self { engine, queue }
    }

    /// Create a pipeline and start it
    pub async fn launch(
        &self,
        project_id: Uuid,
        kind: PipelineType,
        mode: PipelineMode,
        run: RunConfig,
    ) -> Result<Pipeline, EngineError> {
        let pipeline = self.engine.create(project_id, kind, mode, run).await?;
        self.start(pipeline.id).await
    }

    pub async fn start(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        let pipeline = self.engine.start(pipeline_id).await?;
        self.dispatch(pipeline.id)?;
        Ok(pipeline)
    }

    pub async fn pause(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        self.engine.pause(pipeline_id).await
    }

    /// Resume; an auto pipeline picks up where it stopped
    pub async fn resume(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        let pipeline = self.engine.resume(pipeline_id).await?;
        if pipeline.mode == PipelineMode::Auto {
            self.dispatch(pipeline.id)?;
        }
        Ok(pipeline)
    }

    pub async fn cancel(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        self.engine.cancel(pipeline_id).await
    }

    /// Run the current step of a manual pipeline
    pub async fn run_step(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        let pipeline = self.engine.run_step(pipeline_id).await?;
        self.dispatch(pipeline.id)?;
        Ok(pipeline)
    }

    /// Re-run the failed step as a new pipeline
    pub async fn retry(&self, pipeline_id: Uuid) -> Result<Pipeline, EngineError> {
        let pipeline = self.engine.retry(pipeline_id).await?;
        self.dispatch(pipeline.id)?;
        Ok(pipeline)
    }

    fn dispatch(&self, pipeline_id: Uuid) -> Result<(), EngineError> {
        Ok(self.queue.enqueue(WorkUnit::RunPipeline { pipeline_id })?)
    }
}
