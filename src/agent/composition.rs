//! Composition agent: hands the render to the video renderer
//!
//! The renderer reports completion through the webhook, so this step only
//! submits. The step stays running, and its artifact pending, until the
//! webhook reconciler finishes both.

use crate::agent::visuals::scenes_from;
use crate::agent::{ArtifactRecord, StepError, StepOutput};
use crate::core::{AssetType, LogType, StepContext, StepId};
use crate::events::StepReporter;
use crate::provider::{Provider, TaskRequest};
use serde_json::{json, Value};
use tracing::warn;

pub async fn execute(
    context: &StepContext,
    renderer: &dyn Provider,
    callback_url: Option<String>,
    reporter: &StepReporter,
) -> Result<StepOutput, StepError> {
    let scenes = scenes_from(context)?;
    let images = context
        .result(StepId::Images)
        .and_then(|r| r.get("images"))
        .and_then(Value::as_array)
        .filter(|images| !images.is_empty())
        .ok_or_else(|| StepError::permanent("composition needs the generated images"))?;

    // Slideshows have no soundtrack
    let audio_url = context.result_str(StepId::Music, "audio_url");

    let clips: Vec<Value> = images
        .iter()
        .filter_map(|image| {
            let index = image.get("scene")?.as_u64()? as usize;
            let scene = scenes.iter().find(|s| s.index == index)?;
            Some(json!({
                "url": image.get("url")?,
                "duration_secs": scene.duration_secs,
            }))
        })
        .collect();
    if clips.is_empty() {
        return Err(StepError::permanent("no image matches a planned scene"));
    }

    if callback_url.is_none() {
        warn!(pipeline_id = %context.pipeline_id, "No renderer callback URL configured");
    }

    let request = TaskRequest::new(
        "render_video",
        json!({
            "title": context.result_str(StepId::Theme, "title"),
            "clips": clips,
            "audio_url": audio_url,
            "target_duration_secs": context.run.target_duration_secs,
            "platform": context.run.platform,
        }),
    )
    .with_callback(callback_url);

    let task_id = renderer
        .submit(&request)
        .await
        .map_err(|e| StepError::from_provider(renderer.name(), e))?;

    reporter
        .log(
            LogType::Info,
            "Render submitted, waiting for renderer callback",
            Some(json!({ "task_id": task_id })),
        )
        .await;

    Ok(StepOutput::new(json!({
        "render_task_id": task_id,
        "status": "rendering",
    }))
    .with_artifact(ArtifactRecord::pending(
        AssetType::FinalVideo,
        task_id.clone(),
        json!({ "clips": clips.len(), "has_audio": audio_url.is_some() }),
    ))
    .awaiting_callback(task_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunConfig;
    use crate::provider::ProviderError;
    use crate::test_support::{reporter, Behavior, MockProvider};
    use uuid::Uuid;

    fn context() -> StepContext {
        StepContext::new(Uuid::new_v4(), Uuid::new_v4(), RunConfig::new("x"))
            .with_result(StepId::Theme, json!({"title": "Glass"}))
            .with_result(StepId::Music, json!({"audio_url": "mem://a.mp3"}))
            .with_result(
                StepId::Visuals,
                json!({"scenes": [
                    {"index": 0, "prompt": "a", "duration_secs": 12.0},
                    {"index": 1, "prompt": "b", "duration_secs": 18.0}
                ]}),
            )
            .with_result(
                StepId::Images,
                json!({"images": [{"scene": 0, "url": "mem://0.png"}, {"scene": 1, "url": "mem://1.png"}]}),
            )
    }

    #[tokio::test]
    async fn test_submits_without_polling() {
        let renderer = MockProvider::new("renderer", Behavior::NeverFinish);
        let ctx = context();

        let output = execute(
            &ctx,
            &renderer,
            Some("https://hooks/render".into()),
            &reporter(ctx.pipeline_id, StepId::Composition),
        )
        .await
        .unwrap();

        assert_eq!(output.result["status"], "rendering");
        assert_eq!(output.result["render_task_id"], "renderer-1");
        assert_eq!(output.awaiting.as_deref(), Some("renderer-1"));
        let artifact = &output.artifacts[0];
        assert_eq!(artifact.asset_type, AssetType::FinalVideo);
        assert_eq!(artifact.task_id.as_deref(), Some("renderer-1"));
        assert!(artifact.url.is_none());

        let request = &renderer.requests()[0];
        assert_eq!(request.callback_url.as_deref(), Some("https://hooks/render"));
        assert_eq!(request.input["clips"][1]["duration_secs"], 18.0);
        assert_eq!(request.input["audio_url"], "mem://a.mp3");
    }

    #[tokio::test]
    async fn test_rejected_render_is_permanent() {
        let renderer = MockProvider::new(
            "renderer",
            Behavior::SubmitError(ProviderError::Rejected {
                status: 400,
                message: "too many clips".into(),
            }),
        );
        let ctx = context();
        let err = execute(&ctx, &renderer, None, &reporter(ctx.pipeline_id, StepId::Composition))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Permanent(ref m) if m.contains("too many clips")));
    }
}
