//! Queue handler that runs pipelines and reconciles task reports

use crate::execution::{EngineError, PipelineEngine, UnitError, UnitHandler, WorkUnit};
use crate::reconcile::{ReconcileError, WebhookReconciler};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

impl From<EngineError> for UnitError {
    fn from(err: EngineError) -> Self {
        UnitError {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<ReconcileError> for UnitError {
    fn from(err: ReconcileError) -> Self {
        UnitError {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

pub struct ConductorHandler {
    engine: Arc<PipelineEngine>,
    reconciler: Arc<WebhookReconciler>,
}

impl ConductorHandler {
    pub fn new(engine: Arc<PipelineEngine>, reconciler: Arc<WebhookReconciler>) -> Self {
        Self { engine, reconciler }
    }
}

#[async_trait]
impl UnitHandler for ConductorHandler {
    async fn handle(&self, unit: &WorkUnit) -> Result<(), UnitError> {
        match unit {
            WorkUnit::RunPipeline { pipeline_id } => {
                let pipeline = self.engine.drive(*pipeline_id).await?;
                info!(
                    pipeline_id = %pipeline.id,
                    status = pipeline.status.as_str(),
                    step = pipeline.current_step.map(|s| s.as_str()).unwrap_or("-"),
                    "Pipeline run finished"
                );
                Ok(())
            }
            WorkUnit::Reconcile(report) => {
                let outcome = self.reconciler.reconcile(report).await?;
                info!(task_id = %report.task_id, ?outcome, "Task report reconciled");
                Ok(())
            }
        }
    }

    async fn exhausted(&self, unit: &WorkUnit, err: &UnitError) {
        let result = match unit {
            WorkUnit::RunPipeline { pipeline_id } => self
                .engine
                .abandon(*pipeline_id, &err.message)
                .await
                .map(drop)
                .map_err(UnitError::from),
            WorkUnit::Reconcile(report) => self
                .reconciler
                .abandon(report, &err.message)
                .await
                .map_err(UnitError::from),
        };
        if let Err(e) = result {
            error!("Could not record exhaustion of {}: {}", unit, e);
        }
    }
}
