//! `file://` storage: a bucket is a directory under the configured backup directory.

use super::{Backuper, RemoteObjectReference, Restorer, StorageBucket, StorageLocation};
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    location: StorageLocation,
    bucket_dir: PathBuf,
}

impl LocalFileStorage {
    pub fn new(location: StorageLocation) -> Result<Self> {
        let base = location.file_backup_directory.clone().ok_or_else(|| {
            BackupError::Config(format!("{} is not a file:// location", location))
        })?;
        Ok(Self {
            bucket_dir: base.join(&location.bucket),
            location,
        })
    }

    fn path_of(&self, object: &RemoteObjectReference) -> PathBuf {
        self.bucket_dir.join(&object.canonical_path)
    }

    fn node_dir(&self) -> PathBuf {
        self.bucket_dir.join(self.location.node_path())
    }
}

/// Copy `from` to `to` through a temporary sibling file, checking `cancel` between chunks.
async fn copy_cancellable(from: &Path, to: &Path, cancel: &CancellationToken) -> Result<u64> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = to
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = to.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = async {
        let mut source = tokio::fs::File::open(from).await?;
        let mut target = tokio::fs::File::create(&tmp).await?;
        let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
        let mut copied = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled(format!("copy of {}", from.display())));
            }
            let read = source.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            target.write_all(&buffer[..read]).await?;
            copied += read as u64;
        }
        target.flush().await?;
        target.sync_all().await?;
        tokio::fs::rename(&tmp, to).await?;
        Ok(copied)
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

#[async_trait]
impl StorageBucket for LocalFileStorage {
    fn storage_location(&self) -> &StorageLocation {
        &self.location
    }

    async fn bucket_exists(&self) -> Result<bool> {
        Ok(tokio::fs::metadata(&self.bucket_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn create_bucket(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.bucket_dir).await?;
        Ok(())
    }
}

#[async_trait]
impl Restorer for LocalFileStorage {
    async fn download_file(
        &self,
        local: &Path,
        object: &RemoteObjectReference,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = self.path_of(object);
        if !source.is_file() {
            return Err(BackupError::Storage(format!(
                "object {} does not exist",
                object.canonical_path
            )));
        }
        let bytes = copy_cancellable(&source, local, cancel).await?;
        debug!(object = %object.canonical_path, bytes, "Downloaded object");
        Ok(())
    }

    async fn download_file_to_string(&self, object: &RemoteObjectReference) -> Result<String> {
        tokio::fs::read_to_string(self.path_of(object))
            .await
            .map_err(|e| BackupError::Storage(format!("unable to read {}: {}", object.canonical_path, e)))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<RemoteObjectReference>> {
        let node_dir = self.node_dir();
        let location = self.location.clone();
        let prefix = prefix.trim_end_matches('/').to_string();

        let files = tokio::task::spawn_blocking(move || walk_directory(&node_dir, &WalkOptions::default()))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

        Ok(files
            .into_iter()
            .filter(|f| !f.relative_path.rsplit('/').next().unwrap_or("").ends_with(".tmp"))
            .filter(|f| {
                prefix.is_empty()
                    || f.relative_path == prefix
                    || f.relative_path.starts_with(&format!("{}/", prefix))
            })
            .map(|f| location.object(&f.relative_path))
            .collect())
    }

    async fn delete_object(&self, object: &RemoteObjectReference) -> Result<()> {
        match tokio::fs::remove_file(self.path_of(object)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Backuper for LocalFileStorage {
    async fn object_exists(&self, object: &RemoteObjectReference) -> Result<bool> {
        Ok(tokio::fs::metadata(self.path_of(object))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn upload_file(
        &self,
        local: &Path,
        object: &RemoteObjectReference,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let bytes = copy_cancellable(local, &self.path_of(object), cancel).await?;
        debug!(object = %object.canonical_path, bytes, "Uploaded object");
        Ok(())
    }

    async fn upload_text(&self, text: &str, object: &RemoteObjectReference) -> Result<()> {
        let target = self.path_of(object);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = target.with_extension("json.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}
