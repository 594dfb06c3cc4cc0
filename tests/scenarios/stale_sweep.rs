//! Periodic repair of projects and pipelines left behind

use crate::helpers::*;
use chrono::{Duration, Utc};
use conductor::core::{JobLog, JobStatus, PipelineMode, PipelineStatus, PipelineType, ProjectStatus, RunConfig};
use conductor::persistence::Store;
use conductor::reconcile::TaskReport;

#[tokio::test]
async fn test_render_running_too_long_fails_project() {
    let providers = Providers::happy();
    let (rt, project) = runtime(&providers).await;
    let pipeline = rt
        .control
        .launch(project.id, PipelineType::Slideshow, PipelineMode::Auto, RunConfig::new("harbour"))
        .await
        .unwrap();
    rt.queue.wait_idle().await;

    // Waiting on the renderer is not a lost worker
    let report = rt.stale.sweep(Utc::now() + Duration::minutes(45)).await.unwrap();
    assert!(report.is_empty());

    let later = Utc::now() + Duration::minutes(90);
    let report = rt.stale.sweep(later).await.unwrap();
    assert_eq!(report.jobs_timed_out.len(), 1);
    assert_eq!(report.projects_failed.len(), 1);
    assert_eq!(report.pipelines_failed.len(), 1);
    assert_eq!(report.pipelines_failed[0].0, pipeline.id);

    let job = rt.store.find_job_by_task("renderer-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("composition job timed out after 60 minutes")
    );
    let failed = rt.store.load_project(project.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ProjectStatus::Failed);
    assert_eq!(failed.error_message, job.error_message);
    let failed_pipeline = reload(&rt, pipeline.id).await;
    assert_eq!(failed_pipeline.status, PipelineStatus::Failed);
    assert_eq!(failed_pipeline.error_message, job.error_message);

    // A second sweep finds nothing left to repair
    assert!(rt.stale.sweep(later).await.unwrap().is_empty());

    // A callback arriving after the timeout cannot reopen the job
    let late = TaskReport::new("renderer-1", "completed").with_output("https://render.example.com/tmp/final.mp4");
    rt.reconciler.reconcile(&late).await.unwrap();
    let job = rt.store.find_job_by_task("renderer-1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        rt.store.load_project(project.id).await.unwrap().unwrap().status,
        ProjectStatus::Failed
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn test_completed_jobs_forward_fill_project() {
    let providers = Providers::happy();
    let (rt, project) = runtime(&providers).await;
    rt.store
        .transition_project(project.id, &[ProjectStatus::Draft], ProjectStatus::Processing, None)
        .await
        .unwrap();
    let job = JobLog::running(project.id, "image", "image-77".to_string(), None);
    rt.store.insert_job(&job).await.unwrap();
    rt.store
        .finish_job(job.id, JobStatus::Completed, None, Utc::now())
        .await
        .unwrap();

    let report = rt.stale.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.projects_completed, vec![project.id]);
    assert_eq!(
        rt.store.load_project(project.id).await.unwrap().unwrap().status,
        ProjectStatus::Completed
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn test_lost_dispatch_fails_only_after_grace() {
    let providers = Providers::happy();
    let (rt, project) = runtime(&providers).await;
    rt.store
        .transition_project(project.id, &[ProjectStatus::Draft], ProjectStatus::Processing, None)
        .await
        .unwrap();

    assert!(rt.stale.sweep(Utc::now()).await.unwrap().is_empty());

    let report = rt.stale.sweep(Utc::now() + Duration::minutes(11)).await.unwrap();
    assert_eq!(report.projects_failed.len(), 1);
    let failed = rt.store.load_project(project.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ProjectStatus::Failed);
    assert!(failed.error_message.unwrap().contains("dispatch lost"));
    rt.shutdown().await;
}

#[tokio::test]
async fn test_auto_pipeline_without_worker_is_failed() {
    let providers = Providers::happy();
    let (rt, project) = runtime(&providers).await;

    // Started, but never handed to the queue
    let pipeline = rt
        .engine
        .create(project.id, PipelineType::Soundtrack, PipelineMode::Auto, RunConfig::new("harbour"))
        .await
        .unwrap();
    rt.engine.start(pipeline.id).await.unwrap();

    assert!(rt.stale.sweep(Utc::now()).await.unwrap().is_empty());

    let report = rt.stale.sweep(Utc::now() + Duration::minutes(45)).await.unwrap();
    assert_eq!(report.pipelines_failed.len(), 1);
    let failed = reload(&rt, pipeline.id).await;
    assert_eq!(failed.status, PipelineStatus::Failed);
    assert!(failed.error_message.as_deref().unwrap().starts_with("worker lost"));

    let logs = rt.store.list_logs(pipeline.id).await.unwrap();
    assert!(logs.iter().any(|l| l.agent_type == "reconciler"));
    rt.shutdown().await;
}
