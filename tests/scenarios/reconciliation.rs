//! Renderer callbacks folded into jobs, assets and project status

use crate::helpers::*;
use conductor::cli::Runtime;
use conductor::core::{
    AssetType, JobStatus, PipelineMode, PipelineStatus, PipelineType, Project, ProjectStatus, RunConfig, StepId,
    StepStatus,
};
use conductor::execution::WorkUnit;
use conductor::persistence::Store;
use conductor::reconcile::{ReconcileError, ReconcileOutcome, TaskReport};
use serde_json::json;
use uuid::Uuid;

/// Run a slideshow until its render is handed off
async fn rendering(providers: &Providers) -> (Runtime, Project, Uuid) {
    let (rt, project) = runtime(providers).await;
    let pipeline = rt
        .control
        .launch(project.id, PipelineType::Slideshow, PipelineMode::Auto, RunConfig::new("harbour"))
        .await
        .unwrap();
    rt.queue.wait_idle().await;

    let handed_off = reload(&rt, pipeline.id).await;
    assert_eq!(handed_off.status, PipelineStatus::Running);
    assert_eq!(handed_off.current_step, Some(StepId::Composition));
    assert_step_status(&handed_off, StepId::Composition, StepStatus::Running);
    (rt, project, pipeline.id)
}

#[tokio::test]
async fn test_render_callback_completes_project() {
    let providers = Providers::happy();
    let (rt, project, pipeline_id) = rendering(&providers).await;

    let processing = rt.store.load_project(project.id).await.unwrap().unwrap();
    assert_eq!(processing.status, ProjectStatus::Processing);
    let video = rt.store.find_asset_by_task("renderer-1").await.unwrap().unwrap();
    assert!(!video.is_resolved());
    assert_eq!(providers.storage.uploads().len(), 2);

    let report = TaskReport::from_json(&json!({
        "id": "renderer-1",
        "status": "Completed",
        "output_url": "https://render.example.com/tmp/final.mp4"
    }))
    .unwrap();
    rt.queue.enqueue(WorkUnit::Reconcile(report)).unwrap();
    rt.queue.wait_idle().await;

    let project = rt.store.load_project(project.id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    let video = rt.store.find_asset_by_task("renderer-1").await.unwrap().unwrap();
    assert_eq!(video.asset_type, AssetType::FinalVideo);
    assert!(video.is_resolved());
    let job = rt.store.find_job_by_task("renderer-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(providers.storage.uploads().len(), 3);

    let finished = reload(&rt, pipeline_id).await;
    assert_pipeline_completed(&finished);
    let result = finished.step_state(StepId::Composition).unwrap().result().unwrap();
    assert_eq!(result["url"].as_str(), Some(video.permanent_url.as_str()));
    rt.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_callback_changes_nothing() {
    let providers = Providers::happy();
    let (rt, project, _pipeline_id) = rendering(&providers).await;
    let report = TaskReport::new("renderer-1", "done").with_output("https://render.example.com/tmp/final.mp4");

    let first = rt.reconciler.reconcile(&report).await.unwrap();
    assert_eq!(
        first,
        ReconcileOutcome::Applied {
            job_finished: true,
            uploaded: true,
            project_status: Some(ProjectStatus::Completed),
            pipeline_status: Some(PipelineStatus::Completed),
        }
    );
    let job = rt.store.find_job_by_task("renderer-1").await.unwrap().unwrap();

    let second = rt.reconciler.reconcile(&report).await.unwrap();
    assert_eq!(
        second,
        ReconcileOutcome::Applied {
            job_finished: false,
            uploaded: false,
            project_status: None,
            pipeline_status: None,
        }
    );
    assert_eq!(providers.storage.uploads().len(), 3);
    assert_eq!(rt.store.find_job_by_task("renderer-1").await.unwrap().unwrap(), job);
    assert_eq!(
        rt.store.load_project(project.id).await.unwrap().unwrap().status,
        ProjectStatus::Completed
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn test_failed_render_fails_project() {
    let providers = Providers::happy();
    let (rt, project, pipeline_id) = rendering(&providers).await;

    let report = TaskReport::from_json(&json!({
        "task_id": "renderer-1",
        "state": "error",
        "error": {"message": "codec crashed"}
    }))
    .unwrap();
    rt.queue.enqueue(WorkUnit::Reconcile(report)).unwrap();
    rt.queue.wait_idle().await;

    let project = rt.store.load_project(project.id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    assert_eq!(project.error_message.as_deref(), Some("codec crashed"));
    let video = rt.store.find_asset_by_task("renderer-1").await.unwrap().unwrap();
    assert!(!video.is_resolved());
    assert_eq!(video.failure.as_deref(), Some("codec crashed"));

    let failed = reload(&rt, pipeline_id).await;
    assert_eq!(failed.status, PipelineStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("codec crashed"));
    assert_step_status(&failed, StepId::Composition, StepStatus::Failed);

    // A late success cannot revive the failed job
    let late = TaskReport::new("renderer-1", "success").with_output("https://render.example.com/tmp/final.mp4");
    rt.reconciler.reconcile(&late).await.unwrap();
    let job = rt.store.find_job_by_task("renderer-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(providers.storage.uploads().len(), 2);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_report_for_unknown_task_is_retryable() {
    let providers = Providers::happy();
    let (rt, _project) = runtime(&providers).await;

    let err = rt
        .reconciler
        .reconcile(&TaskReport::new("renderer-404", "completed"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::UnknownTask(_)));
    assert!(err.is_retryable());

    assert!(matches!(
        TaskReport::from_json(&json!({"status": "completed"})),
        Err(ReconcileError::Malformed(_))
    ));
    rt.shutdown().await;
}
