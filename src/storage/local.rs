//! Filesystem-backed object store

use crate::core::config::StorageConfig;
use crate::storage::{ObjectStore, StorageError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Writes artifacts under a root directory
///
/// URLs are `{public_base_url}/{path}` when a public base URL is configured,
/// otherwise `file://` URLs of the written files.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: Option<String>,
    client: reqwest::Client,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.root.clone(), config.public_base_url.clone())
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !safe {
            return Err(StorageError::permanent(format!("invalid storage path '{}'", path)));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(context: &str, err: std::io::Error) -> StorageError {
    let message = format!("{}: {}", context, err);
    match err.kind() {
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::NotFound => {
            StorageError::permanent(message)
        }
        _ => StorageError::retryable(message),
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, bytes: Vec<u8>, path: &str, content_type: &str) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create directory", e))?;
        }
        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|e| io_error("write artifact", e))?;
        debug!(path, content_type, size = bytes.len(), "Artifact stored");

        match &self.public_base_url {
            Some(base) => Ok(format!("{}/{}", base, path)),
            None => {
                let absolute = tokio::fs::canonicalize(&target)
                    .await
                    .map_err(|e| io_error("resolve artifact path", e))?;
                Ok(format!("file://{}", absolute.display()))
            }
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read(path)
                .await
                .map_err(|e| io_error("read source file", e));
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(StorageError::permanent(format!("unsupported source URL '{}'", url)));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::retryable(format!("download failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "Artifact download rejected");
            let message = format!("download returned HTTP {}", status.as_u16());
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                StorageError::retryable(message)
            } else {
                StorageError::permanent(message)
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| StorageError::retryable(format!("download interrupted: {}", e)))
    }
}
