//! Single-task generation outside a pipeline
//!
//! Submits one provider task for a project, records the pending asset and its
//! running job, then polls. The final status becomes a [`TaskReport`] and goes
//! through the webhook reconciler, the same path a provider callback takes.

use crate::agent::ProviderHandle;
use crate::core::{Asset, AssetType, JobLog, ProjectStatus};
use crate::persistence::Store;
use crate::provider::{PollError, TaskRequest};
use crate::reconcile::{ReconcileError, ReconcileOutcome, TaskReport, WebhookReconciler};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("project {0} not found")]
    ProjectNotFound(Uuid),

    #[error("project {0} is already processing")]
    Busy(Uuid),

    #[error("{provider} rejected the task: {message}")]
    Submit { provider: String, message: String },

    #[error("dispatch cancelled; task {0} keeps running at the provider")]
    Cancelled(String),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct JobDispatcher {
    store: Arc<dyn Store>,
    reconciler: Arc<WebhookReconciler>,
}

impl JobDispatcher {
    pub fn new(store: Arc<dyn Store>, reconciler: Arc<WebhookReconciler>) -> Self {
        Self { store, reconciler }
    }

    /// Generate one asset for a project and fold the result in
    pub async fn dispatch(
        &self,
        project_id: Uuid,
        asset_type: AssetType,
        provider: &ProviderHandle,
        request: &TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, DispatchError> {
        if self.store.load_project(project_id).await?.is_none() {
            return Err(DispatchError::ProjectNotFound(project_id));
        }
        let claimed = self
            .store
            .transition_project(
                project_id,
                &[ProjectStatus::Draft, ProjectStatus::Completed, ProjectStatus::Failed],
                ProjectStatus::Processing,
                None,
            )
            .await?;
        if !claimed {
            return Err(DispatchError::Busy(project_id));
        }

        let task_id = match provider.provider.submit(request).await {
            Ok(task_id) => task_id,
            Err(e) => {
                let message = e.to_string();
                self.store
                    .transition_project(
                        project_id,
                        &[ProjectStatus::Processing],
                        ProjectStatus::Failed,
                        Some(message.clone()),
                    )
                    .await?;
                return Err(DispatchError::Submit {
                    provider: provider.name().to_string(),
                    message,
                });
            }
        };

        let asset = Asset::pending(
            project_id,
            asset_type,
            task_id.clone(),
            json!({ "operation": request.operation, "provider": provider.name() }),
        );
        self.store.insert_asset(&asset).await?;
        let job = JobLog::running(project_id, asset_type.as_str(), task_id.clone(), Some(asset.id));
        self.store.insert_job(&job).await?;
        info!(project_id = %project_id, task_id = %task_id, "Job dispatched to {}", provider.name());

        let report = match provider.poller.wait(provider.provider.as_ref(), &task_id, cancel).await {
            Ok(status) => {
                let mut report = TaskReport::new(&task_id, status.state.clone());
                report.output_url = status.output_url().map(str::to_string);
                report.error = status.error;
                report
            }
            Err(PollError::TaskFailed { message, .. }) => TaskReport::new(&task_id, "failed").with_error(message),
            Err(PollError::Cancelled) => return Err(DispatchError::Cancelled(task_id)),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Polling gave up");
                TaskReport::new(&task_id, "failed").with_error(e.to_string())
            }
        };

        Ok(self.reconciler.reconcile(&report).await?)
    }
}
