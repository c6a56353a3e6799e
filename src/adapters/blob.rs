//! Blob storage.
//!
//! Blobs live in named containers (`input`, `output`). The filesystem
//! store maps a container to a directory under its root and a blob to a
//! file inside it.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;

use crate::domain::ActivityError;

/// Container new documents arrive in
pub const INPUT_CONTAINER: &str = "input";

/// Container summaries are written to
pub const OUTPUT_CONTAINER: &str = "output";

/// Errors from blob storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Blob not found: {container}/{name}")]
    NotFound { container: String, name: String },

    #[error("Invalid blob name: '{0}'")]
    InvalidName(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for ActivityError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } | StorageError::InvalidName(_) => {
                ActivityError::permanent(err.to_string())
            }
            StorageError::Io(_) => ActivityError::transient(err.to_string()),
        }
    }
}

/// Named-container blob storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a whole blob
    async fn read(&self, container: &str, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Create or replace a blob. Readers never observe a partial write.
    async fn write(&self, container: &str, name: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Blob names in a container, sorted
    async fn list(&self, container: &str) -> Result<Vec<String>, StorageError>;
}

/// Blob store backed by a local directory tree
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf, StorageError> {
        validate_name(container)?;
        Ok(self.root.join(container))
    }

    fn blob_path(&self, container: &str, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        Ok(self.container_dir(container)?.join(name))
    }
}

/// Names are single path components
fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, container: &str, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.blob_path(container, name)?;

        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                container: container.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, container: &str, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let dir = self.container_dir(container)?;
        let path = self.blob_path(container, name)?;
        fs::create_dir_all(&dir).await?;

        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            // Write beside the target, then rename over it
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_data()?;
            tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    async fn list(&self, container: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.container_dir(container)?;
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // Skip in-flight temp files from concurrent writes
                if !name.starts_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        Ok(names)
    }
}
