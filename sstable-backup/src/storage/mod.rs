//! Remote storage seam.
//!
//! Backup and restore only talk to storage through [`Restorer`] and
//! [`Backuper`]. Object keys are relative to the node prefix
//! `<cluster>/<datacenter>/<node>` inside the bucket.

pub mod local;
pub mod retry;

pub use local::LocalFileStorage;
pub use retry::{with_retry, RetrySpec, RetryStrategy};

use crate::manifest::{parse_latest_manifest, Manifest, ManifestEntry, ManifestEntryType, MANIFESTS_PREFIX};
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// `<provider>://<bucket>/<cluster>/<dc>/<node>` or
/// `file://<path>/<bucket>/<cluster>/<dc>/<node>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    pub raw: String,
    pub provider: String,
    pub bucket: String,
    pub cluster_id: String,
    pub datacenter: String,
    pub node_id: String,
    /// Directory holding the bucket, `file` provider only.
    pub file_backup_directory: Option<PathBuf>,
}

impl StorageLocation {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            BackupError::Validation(format!("invalid storage location '{}': {}", raw, reason))
        };

        let (provider, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("expected <provider>://<bucket>/<cluster>/<dc>/<node>"))?;
        if provider.is_empty() || !provider.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("provider must be alphanumeric"));
        }
        let provider = provider.to_ascii_lowercase();

        let trimmed = rest.trim_end_matches('/');
        let (file_backup_directory, segments) = if provider == "file" {
            let path = trimmed
                .strip_prefix('/')
                .ok_or_else(|| invalid("file locations need an absolute path"))?;
            let segments: Vec<&str> = path.split('/').collect();
            if segments.len() < 5 {
                return Err(invalid("expected file://<path>/<bucket>/<cluster>/<dc>/<node>"));
            }
            let (dir, tail) = segments.split_at(segments.len() - 4);
            (Some(PathBuf::from(format!("/{}", dir.join("/")))), tail.to_vec())
        } else {
            let segments: Vec<&str> = trimmed.split('/').collect();
            if segments.len() != 4 {
                return Err(invalid("expected exactly <bucket>/<cluster>/<dc>/<node>"));
            }
            (None, segments)
        };

        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty path segment"));
        }

        Ok(Self {
            raw: raw.to_string(),
            provider,
            bucket: segments[0].to_string(),
            cluster_id: segments[1].to_string(),
            datacenter: segments[2].to_string(),
            node_id: segments[3].to_string(),
            file_backup_directory,
        })
    }

    /// `<cluster>/<dc>/<node>`
    pub fn node_path(&self) -> String {
        format!("{}/{}/{}", self.cluster_id, self.datacenter, self.node_id)
    }

    pub fn object(&self, object_key: &str) -> RemoteObjectReference {
        RemoteObjectReference {
            object_key: object_key.to_string(),
            canonical_path: format!("{}/{}", self.node_path(), object_key),
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Object in the bucket, both relative to the node and from the bucket root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteObjectReference {
    pub object_key: String,
    pub canonical_path: String,
}

#[async_trait]
pub trait StorageBucket: Send + Sync {
    fn storage_location(&self) -> &StorageLocation;

    async fn bucket_exists(&self) -> Result<bool>;

    async fn create_bucket(&self) -> Result<()>;

    /// Fail unless the bucket exists, creating it first when allowed.
    async fn ensure_bucket(&self, create_missing: bool, skip_verification: bool) -> Result<()> {
        if skip_verification {
            return Ok(());
        }
        if self.bucket_exists().await? {
            return Ok(());
        }
        if create_missing {
            info!(bucket = %self.storage_location().bucket, "Creating missing bucket");
            return self.create_bucket().await;
        }
        Err(BackupError::Storage(format!(
            "bucket {} does not exist",
            self.storage_location().bucket
        )))
    }
}

#[async_trait]
pub trait Restorer: StorageBucket {
    /// Download to `local`, checking `cancel` between chunks.
    async fn download_file(
        &self,
        local: &Path,
        object: &RemoteObjectReference,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn download_file_to_string(&self, object: &RemoteObjectReference) -> Result<String>;

    /// Every object whose key starts with `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<RemoteObjectReference>>;

    async fn delete_object(&self, object: &RemoteObjectReference) -> Result<()>;

    async fn consume_files(
        &self,
        prefix: &str,
        visitor: &mut (dyn for<'r> FnMut(&'r RemoteObjectReference) + Send),
    ) -> Result<()> {
        for object in self.list_objects(prefix).await? {
            visitor(&object);
        }
        Ok(())
    }

    /// Download and parse the newest manifest of `snapshot_tag`.
    async fn download_manifest(
        &self,
        snapshot_tag: &str,
        schema_version: Option<&str>,
    ) -> Result<Manifest> {
        let mut keys = Vec::new();
        self.consume_files(MANIFESTS_PREFIX, &mut |object| keys.push(object.object_key.clone()))
            .await?;
        let key = parse_latest_manifest(&keys, snapshot_tag, schema_version)?;

        let object = self.storage_location().object(&key);
        let content = self.download_file_to_string(&object).await?;
        let mut manifest = Manifest::from_json(&content)?;
        manifest.manifest_entry = Some(ManifestEntry::new(
            key,
            ManifestEntryType::ManifestFile,
            content.len() as u64,
        ));
        info!(manifest = %object.canonical_path, "Downloaded manifest");
        Ok(manifest)
    }
}

#[async_trait]
pub trait Backuper: StorageBucket {
    async fn object_exists(&self, object: &RemoteObjectReference) -> Result<bool>;

    /// Upload `local`, checking `cancel` between chunks.
    async fn upload_file(
        &self,
        local: &Path,
        object: &RemoteObjectReference,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn upload_text(&self, text: &str, object: &RemoteObjectReference) -> Result<()>;
}

fn open_local(location: &StorageLocation) -> Result<Arc<LocalFileStorage>> {
    match location.provider.as_str() {
        "file" => Ok(Arc::new(LocalFileStorage::new(location.clone())?)),
        other => Err(BackupError::Config(format!(
            "storage provider '{}' is not available in this build, supported: file",
            other
        ))),
    }
}

pub fn open_restorer(location: &StorageLocation) -> Result<Arc<dyn Restorer>> {
    let restorer: Arc<dyn Restorer> = open_local(location)?;
    Ok(restorer)
}

pub fn open_backuper(location: &StorageLocation) -> Result<Arc<dyn Backuper>> {
    let backuper: Arc<dyn Backuper> = open_local(location)?;
    Ok(backuper)
}
