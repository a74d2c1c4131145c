//! Backup of a node's SSTables, schema and commit logs to remote storage.

pub mod catalog;
pub mod commitlog;

use crate::cassandra::CassandraInteraction;
use crate::entities::DatabaseEntities;
use crate::lock::GlobalLock;
use crate::manifest::builder::build_manifest;
use crate::manifest::{manifest_object_key, Manifest};
use crate::restore::StorageSettings;
use crate::storage::Backuper;
use crate::transfer::{Upload, UploadTracker};
use crate::{BackupError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub storage: StorageSettings,
    /// Cassandra home, holding `data/`.
    pub cassandra_dir: PathBuf,
    pub snapshot_tag: String,
    pub entities: DatabaseEntities,
    pub lock_file: PathBuf,
}

impl BackupRequest {
    pub fn data_dir(&self) -> PathBuf {
        self.cassandra_dir.join("data")
    }

    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.entities.validate()?;
        validate_snapshot_tag(&self.snapshot_tag)
    }
}

/// Tags end up in directory and object names.
pub fn validate_snapshot_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(BackupError::Validation("snapshot tag is empty".into()));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(BackupError::Validation(format!(
            "snapshot tag '{}' may only contain letters, digits, '-', '_' and '.'",
            tag
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub manifest_key: String,
    pub files: usize,
    pub bytes: u64,
}

/// Snapshot the requested entities, upload their files and then the manifest.
///
/// The snapshot is cleared whether or not the upload succeeded.
pub async fn backup(
    request: &BackupRequest,
    backuper: Arc<dyn Backuper>,
    cassandra: &dyn CassandraInteraction,
    tracker: &UploadTracker,
) -> Result<BackupOutcome> {
    request.validate()?;
    let _lock = GlobalLock::acquire(&request.lock_file)?;

    backuper
        .ensure_bucket(
            request.storage.create_missing_bucket,
            request.storage.skip_bucket_verification,
        )
        .await?;
    let schema_version = cassandra.get_schema_version().await?;
    let tokens = cassandra.get_local_tokens().await?;

    info!(snapshot_tag = %request.snapshot_tag, entities = %request.entities, "Taking snapshot");
    cassandra
        .take_snapshot(&request.entities, &request.snapshot_tag)
        .await?;

    let result = upload_snapshot(request, backuper, tracker, tokens, schema_version).await;

    if let Err(e) = cassandra.clear_snapshot(&request.snapshot_tag).await {
        warn!(snapshot_tag = %request.snapshot_tag, error = %e, "Unable to clear snapshot");
    }
    result
}

async fn upload_snapshot(
    request: &BackupRequest,
    backuper: Arc<dyn Backuper>,
    tracker: &UploadTracker,
    tokens: Vec<String>,
    schema_version: String,
) -> Result<BackupOutcome> {
    let manifest: Manifest = {
        let data_dir = request.data_dir();
        let tag = request.snapshot_tag.clone();
        let entities = request.entities.clone();
        let schema_version = schema_version.clone();
        tokio::task::spawn_blocking(move || {
            build_manifest(&data_dir, &tag, &entities, tokens, &schema_version)
        })
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??
    };

    let entries: Vec<_> = manifest.entries().cloned().collect();
    let outcome_files = entries.len();
    tracker
        .transfer(
            Arc::clone(&backuper),
            Upload::new(request.storage.retry.clone()),
            entries,
            &request.snapshot_tag,
            request.storage.concurrent_connections,
        )
        .await?;

    let manifest_key = manifest_object_key(
        &request.snapshot_tag,
        &schema_version,
        chrono::Utc::now().timestamp_millis(),
    );
    let object = backuper.storage_location().object(&manifest_key);
    backuper.upload_text(&manifest.to_json()?, &object).await?;
    info!(manifest = %object.canonical_path, files = outcome_files, "Uploaded manifest");

    Ok(BackupOutcome {
        manifest_key,
        files: outcome_files,
        bytes: manifest.total_size(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestEntryType, MANIFESTS_PREFIX};
    use crate::storage::{Restorer, StorageBucket};
    use crate::testing::{create_table, insert_rows, local_storage, FakeCassandra, SCHEMA_VERSION};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn request(root: &std::path::Path) -> BackupRequest {
        let storage = local_storage(root);
        let mut settings = StorageSettings::new(storage.storage_location().clone());
        settings.create_missing_bucket = true;
        BackupRequest {
            storage: settings,
            cassandra_dir: root.join("cassandra"),
            snapshot_tag: "snap".into(),
            entities: DatabaseEntities::parse("test").unwrap(),
            lock_file: root.join("backup.lock"),
        }
    }

    fn tracker() -> UploadTracker {
        UploadTracker::new(CancellationToken::new()).with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_snapshot_tag_validation() {
        validate_snapshot_tag("daily-2024.01_01").unwrap();
        assert!(validate_snapshot_tag("").is_err());
        assert!(validate_snapshot_tag("a/b").is_err());
        assert!(validate_snapshot_tag("a-b c").is_err());
    }

    #[tokio::test]
    async fn test_backup_uploads_files_then_manifest() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("cassandra/data");
        let table = create_table(&data, "test", "t1");
        insert_rows(&table, 1, 2);
        let other = create_table(&data, "other", "t2");
        insert_rows(&other, 1, 5);

        let storage = Arc::new(local_storage(dir.path()));
        let fake = FakeCassandra::new(&data);
        let outcome = backup(&request(dir.path()), storage.clone(), &fake, &tracker())
            .await
            .unwrap();

        assert_eq!(outcome.files, 3);
        assert!(outcome.manifest_key.starts_with(&format!("{}/snap-{}-", MANIFESTS_PREFIX, SCHEMA_VERSION)));

        let manifest = storage.download_manifest("snap", Some(SCHEMA_VERSION)).await.unwrap();
        assert_eq!(manifest.tokens, fake.tokens);
        assert!(manifest.snapshot.keyspaces.contains_key("test"));
        assert!(!manifest.snapshot.keyspaces.contains_key("other"));
        assert_eq!(
            manifest.entries().filter(|e| e.entry_type == ManifestEntryType::CqlSchema).count(),
            1
        );
        assert_eq!(storage.list_objects("data").await.unwrap().len(), 3);

        assert!(!table.join("snapshots/snap").exists());
        assert_eq!(fake.calls(), vec!["snapshot snap".to_string(), "clearsnapshot snap".to_string()]);
    }

    #[tokio::test]
    async fn test_backup_clears_snapshot_on_failure() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("cassandra/data");
        create_table(&data, "test", "t1");

        let mut req = request(dir.path());
        req.storage.create_missing_bucket = false;
        let storage = Arc::new(local_storage(dir.path()));
        let fake = FakeCassandra::new(&data);

        // No bucket and not allowed to create it.
        assert!(backup(&req, storage.clone(), &fake, &tracker()).await.is_err());
        assert!(fake.calls().is_empty());

        req.storage.create_missing_bucket = true;
        req.entities = DatabaseEntities::parse("missing").unwrap();
        assert!(backup(&req, storage, &fake, &tracker()).await.is_err());
        assert_eq!(fake.calls(), vec!["snapshot snap".to_string(), "clearsnapshot snap".to_string()]);
    }
}
