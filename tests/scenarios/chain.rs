//! Step chaining in auto and manual mode

use crate::helpers::*;
use conductor::core::{AssetType, PipelineMode, PipelineStatus, PipelineType, RunConfig, StepId, StepStatus};
use conductor::events::PipelineEvent;
use conductor::persistence::Store;

#[tokio::test]
async fn test_auto_soundtrack_runs_to_completion() {
    let providers = Providers::happy();
    let (rt, project) = runtime(&providers).await;

    let pipeline = rt
        .engine
        .create(project.id, PipelineType::Soundtrack, PipelineMode::Auto, RunConfig::new("harbour"))
        .await
        .unwrap();
    let mut events = rt.engine.subscribe(pipeline.id);
    rt.control.start(pipeline.id).await.unwrap();
    rt.queue.wait_idle().await;

    let done = reload(&rt, pipeline.id).await;
    assert_pipeline_completed(&done);
    assert_step_status(&done, StepId::Theme, StepStatus::Completed);
    assert_step_status(&done, StepId::Music, StepStatus::Completed);
    assert_eq!(done.current_step_progress, 100);

    // Theme hands over to music without a trigger
    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::StepCompleted { step, next_step, .. } = event {
            completed.push((step, next_step));
        }
    }
    assert_eq!(
        completed,
        vec![(StepId::Theme, Some(StepId::Music)), (StepId::Music, None)]
    );

    let assets = rt.store.list_assets(project.id).await.unwrap();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].asset_type, AssetType::Music);
    assert!(assets[0].is_resolved());
    assert_eq!(providers.storage.uploads().len(), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_manual_pipeline_waits_for_each_step() {
    let providers = Providers::happy();
    let (rt, project) = runtime(&providers).await;

    let pipeline = rt
        .control
        .launch(project.id, PipelineType::Soundtrack, PipelineMode::Manual, RunConfig::new("harbour"))
        .await
        .unwrap();
    rt.queue.wait_idle().await;

    let waiting = reload(&rt, pipeline.id).await;
    assert_eq!(waiting.status, PipelineStatus::Running);
    assert_eq!(waiting.current_step, Some(StepId::Music));
    assert!(waiting.is_idle());
    assert!(providers.music.submissions().is_empty());

    rt.control.run_step(pipeline.id).await.unwrap();
    rt.queue.wait_idle().await;

    let done = reload(&rt, pipeline.id).await;
    assert_pipeline_completed(&done);
    assert_eq!(providers.music.submissions().len(), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_music_request_carries_theme() {
    let providers = Providers::happy();
    let (rt, project) = runtime(&providers).await;

    rt.control
        .launch(project.id, PipelineType::Soundtrack, PipelineMode::Auto, RunConfig::new("harbour"))
        .await
        .unwrap();
    rt.queue.wait_idle().await;

    let requests = providers.music.submissions();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].input.to_string().contains("Low Tide"));
    rt.shutdown().await;
}

#[tokio::test]
async fn test_paused_pipeline_resumes_where_it_stopped() {
    let providers = Providers::happy();
    let (rt, project) = runtime(&providers).await;

    let pipeline = rt
        .engine
        .create(project.id, PipelineType::Soundtrack, PipelineMode::Auto, RunConfig::new("harbour"))
        .await
        .unwrap();
    rt.engine.start(pipeline.id).await.unwrap();
    rt.control.pause(pipeline.id).await.unwrap();

    let paused = reload(&rt, pipeline.id).await;
    assert_eq!(paused.status, PipelineStatus::Paused);

    rt.control.resume(pipeline.id).await.unwrap();
    rt.queue.wait_idle().await;
    assert_pipeline_completed(&reload(&rt, pipeline.id).await);
    rt.shutdown().await;
}
