//! Images agent: one generation task per planned scene

use crate::agent::visuals::scenes_from;
use crate::agent::{ArtifactRecord, ProviderHandle, StepError, StepOutput};
use crate::core::{AssetType, LogType, StepContext};
use crate::events::StepReporter;
use crate::provider::TaskRequest;
use crate::storage::{persist_remote, ObjectStore};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub async fn execute(
    context: &StepContext,
    image: &ProviderHandle,
    storage: &dyn ObjectStore,
    reporter: &StepReporter,
    cancel: &CancellationToken,
) -> Result<StepOutput, StepError> {
    let scenes = scenes_from(context)?;
    let total = scenes.len();
    let aspect = aspect_ratio(&context.run.platform);

    // Scenes stored by an interrupted attempt are not generated again
    let mut stored = checkpointed(context);
    if !stored.is_empty() {
        reporter
            .info(format!("Resuming with {}/{} images already stored", stored.len(), total))
            .await;
    }

    for scene in &scenes {
        if stored.iter().any(|s| s["scene"] == scene.index) {
            continue;
        }
        let request = TaskRequest::new(
            "generate_image",
            json!({
                "prompt": scene.prompt,
                "scene": scene.index,
                "aspect_ratio": aspect,
            }),
        );
        let (task_id, status) = image.run(&request, reporter, cancel).await?;

        let source_url = status
            .output_url()
            .ok_or_else(|| {
                StepError::permanent(format!("image provider returned no URL for scene {}", scene.index))
            })?
            .to_string();
        let url = persist_remote(storage, context.project_id, AssetType::Image, &source_url).await?;
        debug!(scene = scene.index, url = %url, "Scene image stored");

        stored.push(json!({
            "scene": scene.index,
            "url": url,
            "provider_task_id": task_id,
            "prompt": scene.prompt,
        }));
        reporter.checkpoint(&json!({ "images": stored })).await;

        let done = stored.len();
        reporter
            .progress(
                (done * 100 / total).min(99) as u8,
                format!("Image {}/{} ready", done, total),
            )
            .await;
    }

    stored.sort_by_key(|s| s["scene"].as_u64());
    let mut images = Vec::with_capacity(stored.len());
    let mut artifacts = Vec::with_capacity(stored.len());
    for entry in stored {
        let url = entry["url"].as_str().unwrap_or_default().to_string();
        images.push(json!({ "scene": entry["scene"], "url": url }));
        artifacts.push(ArtifactRecord::stored(
            AssetType::Image,
            url,
            json!({
                "scene": entry["scene"],
                "provider_task_id": entry["provider_task_id"],
                "prompt": entry["prompt"],
            }),
        ));
    }

    reporter
        .log(LogType::Result, format!("Generated {} images", total), None)
        .await;

    Ok(StepOutput {
        result: json!({ "images": images }),
        artifacts,
        awaiting: None,
    })
}

/// Scene images a previous attempt already stored
fn checkpointed(context: &StepContext) -> Vec<Value> {
    context
        .checkpoint
        .as_ref()
        .and_then(|c| c.get("images"))
        .and_then(Value::as_array)
        .map(|images| {
            images
                .iter()
                .filter(|i| i["scene"].is_u64() && i["url"].as_str().is_some_and(|u| !u.is_empty()))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn aspect_ratio(platform: &str) -> &'static str {
    match platform.to_ascii_lowercase().as_str() {
        "tiktok" | "reels" | "shorts" => "9:16",
        "instagram" => "1:1",
        _ => "16:9",
    }
}
