//! Object storage collaborator
//!
//! Generated artifacts are fetched from the provider's temporary URL and
//! copied into durable storage before anything refers to them.

pub mod local;

use crate::core::AssetType;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use local::LocalObjectStore;

/// Storage failure, classified at the point it happens
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct StorageError {
    pub retryable: bool,
    pub message: String,
}

impl StorageError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// Durable blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under `path` and return their permanent URL
    async fn upload(&self, bytes: Vec<u8>, path: &str, content_type: &str) -> Result<String, StorageError>;

    /// Fetch the bytes behind a URL
    async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError>;
}

fn extension_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\.([A-Za-z0-9]{2,5})(?:[?#].*)?$").ok())
        .as_ref()
}

/// File extension of a URL's path, lowercased
pub fn url_extension(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    // Only look past the host
    let path = without_scheme.split_once('/').map(|(_, p)| p)?;
    extension_pattern()?
        .captures(path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Content type for a file extension
pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Storage path of a new artifact: `{project}/{type}/{id}.{ext}`
pub fn artifact_path(project_id: Uuid, asset_type: AssetType, source_url: &str) -> String {
    let extension = url_extension(source_url).unwrap_or_else(|| asset_type.default_extension().to_string());
    format!(
        "{}/{}/{}.{}",
        project_id,
        asset_type.as_str(),
        Uuid::new_v4(),
        extension
    )
}

/// Copy a provider-hosted artifact into durable storage
///
/// Returns the permanent URL.
pub async fn persist_remote(
    store: &dyn ObjectStore,
    project_id: Uuid,
    asset_type: AssetType,
    source_url: &str,
) -> Result<String, StorageError> {
    let path = artifact_path(project_id, asset_type, source_url);
    let extension = path.rsplit('.').next().unwrap_or_default();
    let content_type = content_type_for(extension);

    let bytes = store.download(source_url).await?;
    debug!(source = source_url, path = %path, size = bytes.len(), "Persisting artifact");
    store.upload(bytes, &path, content_type).await
}
