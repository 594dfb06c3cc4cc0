//! Permanent and transient step failures, cancellation and retry

use crate::helpers::*;
use conductor::core::{LogType, PipelineMode, PipelineStatus, PipelineType, RunConfig, StepId, StepStatus, CANCELLED_MESSAGE};
use conductor::provider::ProviderError;
use conductor::persistence::Store;

#[tokio::test]
async fn test_provider_failure_fails_pipeline_at_step() {
    let providers = Providers::happy().with_music(ScriptedProvider::new(
        "music",
        Ok(vec![running(), failed("lyrics flagged")]),
    ));
    let (rt, project) = runtime(&providers).await;

    let pipeline = rt
        .control
        .launch(project.id, PipelineType::Soundtrack, PipelineMode::Auto, RunConfig::new("harbour"))
        .await
        .unwrap();
    rt.queue.wait_idle().await;

    let failed = reload(&rt, pipeline.id).await;
    assert_eq!(failed.status, PipelineStatus::Failed);
    assert_step_status(&failed, StepId::Theme, StepStatus::Completed);
    assert_step_status(&failed, StepId::Music, StepStatus::Failed);
    let message = failed.error_message.clone().unwrap();
    assert!(message.contains("lyrics flagged"), "{message}");
    assert_eq!(failed.step_state(StepId::Music).unwrap().error(), Some(message.as_str()));

    // Permanent failures are not retried
    assert_eq!(providers.music.submissions().len(), 1);

    let logs = rt.store.list_logs(pipeline.id).await.unwrap();
    assert!(logs.iter().any(|l| l.log_type == LogType::Error && l.agent_type == "music"));
    rt.shutdown().await;
}

#[tokio::test]
async fn test_rate_limited_step_is_retried_then_abandoned() {
    let rate_limited = || Err(ProviderError::RateLimited { retry_after: None });
    let providers = Providers::happy().with_music(
        ScriptedProvider::finishing("music", track())
            .then(rate_limited())
            .then(rate_limited())
            .then(rate_limited()),
    );
    let (rt, project) = runtime(&providers).await;

    let pipeline = rt
        .control
        .launch(project.id, PipelineType::Soundtrack, PipelineMode::Auto, RunConfig::new("harbour"))
        .await
        .unwrap();
    rt.queue.wait_idle().await;

    let abandoned = reload(&rt, pipeline.id).await;
    assert_eq!(abandoned.status, PipelineStatus::Failed);
    assert_step_status(&abandoned, StepId::Music, StepStatus::Failed);
    assert!(abandoned.error_message.as_deref().unwrap().contains("rate limited"));

    // The retry starts at the failed step with the theme carried over
    let retry = rt.control.retry(pipeline.id).await.unwrap();
    assert_ne!(retry.id, pipeline.id);
    assert_eq!(retry.retry_of, Some(pipeline.id));
    rt.queue.wait_idle().await;

    let done = reload(&rt, retry.id).await;
    assert_pipeline_completed(&done);
    assert_eq!(providers.llm.submissions().len(), 1);
    assert_eq!(providers.music.submissions().len(), 1);

    // The original row stays failed
    assert_eq!(reload(&rt, pipeline.id).await.status, PipelineStatus::Failed);
    rt.shutdown().await;
}

#[tokio::test]
async fn test_cancel_discards_running_step() {
    let providers = Providers::happy().with_music(ScriptedProvider::stalled("music"));
    let (rt, project) = runtime(&providers).await;

    let pipeline = rt
        .engine
        .create(project.id, PipelineType::Soundtrack, PipelineMode::Manual, RunConfig::new("harbour"))
        .await
        .unwrap();
    rt.control.start(pipeline.id).await.unwrap();
    rt.queue.wait_idle().await;

    let cancelled = rt.control.cancel(pipeline.id).await.unwrap();
    assert_eq!(cancelled.status, PipelineStatus::Failed);
    assert_eq!(cancelled.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert!(cancelled.is_cancelled());

    // Nothing runs after cancellation
    assert!(rt.control.run_step(pipeline.id).await.is_err());
    assert!(rt.control.retry(pipeline.id).await.is_err());
    assert!(providers.music.submissions().is_empty());
    rt.shutdown().await;
}
