use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

use super::remote::ContentSource;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    Missing,
    /// Directory still has entries; left in place.
    NotEmpty,
}

/// Filesystem side effects of a pass: directory creation, atomic file
/// downloads and safe removal.
#[derive(Clone)]
pub struct LocalApplier {
    http: Client,
    download_limit: Arc<Semaphore>,
}

impl LocalApplier {
    pub fn new(download_concurrency: usize) -> Self {
        Self::with_http(Client::new(), download_concurrency)
    }

    pub fn with_http(http: Client, download_concurrency: usize) -> Self {
        Self {
            http,
            download_limit: Arc::new(Semaphore::new(download_concurrency.max(1))),
        }
    }

    pub async fn materialize_folder(&self, path: &Path) -> Result<(), ApplyError> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    /// Streams the content into a sibling `.partial` file and renames it
    /// over `path` once it is complete and synced. Returns bytes written.
    pub async fn materialize_file(
        &self,
        path: &Path,
        source: &ContentSource,
    ) -> Result<u64, ApplyError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ApplyError::ConcurrencyClosed)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(path);
        let result = self.download(&partial, source).await;
        match result {
            Ok(written) => {
                tokio::fs::rename(&partial, path).await?;
                Ok(written)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }

    async fn download(&self, partial: &Path, source: &ContentSource) -> Result<u64, ApplyError> {
        let response = self
            .http
            .get(source.url.clone())
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = response.bytes_stream();
        let mut hasher = source.sha256.as_ref().map(|_| Sha256::new());
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;

        if let (Some(expected), Some(hasher)) = (source.sha256.as_deref(), hasher) {
            let actual = format!("{:x}", hasher.finalize());
            let expected = expected.to_ascii_lowercase();
            if actual != expected {
                return Err(ApplyError::IntegrityMismatch { expected, actual });
            }
        }
        Ok(written)
    }

    /// Removes a file, or a directory only when it is empty.
    pub async fn remove_path(&self, path: &Path) -> Result<RemoveOutcome, ApplyError> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(RemoveOutcome::Missing),
            Err(err) => return Err(err.into()),
        };

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match removed {
            Ok(()) => Ok(RemoveOutcome::Removed),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(RemoveOutcome::Missing),
            Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => {
                Ok(RemoveOutcome::NotEmpty)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Whether `path` exists as the expected kind of artifact.
pub async fn is_present(path: &Path, is_folder: bool) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_dir() == is_folder,
        Err(_) => false,
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
