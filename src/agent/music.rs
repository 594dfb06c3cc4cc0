//! Music agent: generates the soundtrack and copies it into durable storage

use crate::agent::{ArtifactRecord, ProviderHandle, StepError, StepOutput};
use crate::core::{AssetType, LogType, StepContext, StepId};
use crate::events::StepReporter;
use crate::provider::TaskRequest;
use crate::storage::{persist_remote, ObjectStore};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

pub async fn execute(
    context: &StepContext,
    music: &ProviderHandle,
    storage: &dyn ObjectStore,
    reporter: &StepReporter,
    cancel: &CancellationToken,
) -> Result<StepOutput, StepError> {
    let theme = context
        .result(StepId::Theme)
        .ok_or_else(|| StepError::permanent("music needs a completed theme step"))?;

    let request = TaskRequest::new(
        "generate_music",
        json!({
            "title": theme.get("title"),
            "mood": theme.get("mood"),
            "prompt": theme.get("concept"),
            "keywords": theme.get("keywords"),
            "duration_secs": context.run.target_duration_secs,
        }),
    );

    reporter.progress(5, "Composing soundtrack").await;
    let (task_id, status) = music.run(&request, reporter, cancel).await?;

    let source_url = status
        .output_url()
        .ok_or_else(|| StepError::permanent("music provider returned no audio URL"))?
        .to_string();
    reporter.progress(80, "Soundtrack generated, storing audio").await;

    let audio_url = persist_remote(storage, context.project_id, AssetType::Music, &source_url).await?;
    let duration_secs = status
        .output
        .as_ref()
        .and_then(|o| o.get("duration_secs"))
        .and_then(Value::as_f64)
        .unwrap_or(context.run.target_duration_secs as f64);

    reporter
        .log(LogType::Result, "Soundtrack stored", Some(json!({ "audio_url": audio_url })))
        .await;

    let result = json!({
        "audio_url": audio_url,
        "duration_secs": duration_secs,
        "provider_task_id": task_id,
    });
    Ok(StepOutput::new(result).with_artifact(ArtifactRecord::stored(
        AssetType::Music,
        audio_url,
        json!({ "provider_task_id": task_id, "source_url": source_url, "duration_secs": duration_secs }),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunConfig;
    use crate::storage::StorageError;
    use crate::test_support::{fast_poll, reporter, Behavior, MemoryObjectStore, MockProvider};
    use std::sync::Arc;
    use uuid::Uuid;

    fn context() -> StepContext {
        StepContext::new(Uuid::new_v4(), Uuid::new_v4(), RunConfig::new("harbor at dawn")).with_result(
            StepId::Theme,
            json!({"title": "Low Tide", "concept": "gulls", "mood": "calm", "keywords": []}),
        )
    }

    #[tokio::test]
    async fn test_audio_is_stored_before_completion() {
        let provider = Arc::new(MockProvider::completing(
            "music",
            json!({"url": "https://music.example.com/t/1.mp3", "duration_secs": 62.5}),
        ));
        let storage = MemoryObjectStore::default();
        let ctx = context();

        let output = execute(
            &ctx,
            &ProviderHandle::new(provider.clone(), fast_poll()),
            &storage,
            &reporter(ctx.pipeline_id, StepId::Music),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(storage.upload_count(), 1);
        let audio_url = output.result["audio_url"].as_str().unwrap();
        assert!(audio_url.starts_with("mem://"));
        assert!(audio_url.ends_with(".mp3"));
        assert_eq!(output.result["duration_secs"], json!(62.5));
        assert_eq!(output.result["provider_task_id"], "music-1");
        assert_eq!(output.artifacts.len(), 1);
        assert_eq!(output.artifacts[0].url.as_deref(), Some(audio_url));
        assert_eq!(provider.requests()[0].input["mood"], "calm");
    }

    #[tokio::test]
    async fn test_requires_theme_result() {
        let provider = Arc::new(MockProvider::completing("music", json!({"url": "https://x/y.mp3"})));
        let ctx = StepContext::new(Uuid::new_v4(), Uuid::new_v4(), RunConfig::new("x"));
        let err = execute(
            &ctx,
            &ProviderHandle::new(provider.clone(), fast_poll()),
            &MemoryObjectStore::default(),
            &reporter(ctx.pipeline_id, StepId::Music),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StepError::Permanent(_)));
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_retryable_upload_failure_is_transient() {
        let provider = Arc::new(MockProvider::completing("music", json!({"url": "https://x/y.mp3"})));
        let storage = MemoryObjectStore::default();
        *storage.fail_uploads.lock().unwrap() = Some(StorageError::retryable("bucket throttled"));
        let ctx = context();

        let err = execute(
            &ctx,
            &ProviderHandle::new(provider, fast_poll()),
            &storage,
            &reporter(ctx.pipeline_id, StepId::Music),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_generation_failure_is_permanent() {
        let provider = Arc::new(MockProvider::new("music", Behavior::Fail("lyrics flagged".into())));
        let ctx = context();
        let err = execute(
            &ctx,
            &ProviderHandle::new(provider, fast_poll()),
            &MemoryObjectStore::default(),
            &reporter(ctx.pipeline_id, StepId::Music),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            StepError::Permanent("music generation failed: lyrics flagged".to_string())
        );
    }
}
