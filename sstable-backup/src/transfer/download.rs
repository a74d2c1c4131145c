//! Download direction of the tracker.

use super::tracker::{Tracker, Transfer};
use crate::hashing::matches_hash_async;
use crate::manifest::ManifestEntry;
use crate::storage::{with_retry, Restorer, RetrySpec};
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Downloads an entry to its enriched local file.
#[derive(Debug, Clone, Default)]
pub struct Download {
    pub retry: RetrySpec,
}

pub type DownloadTracker = Tracker<Download>;

impl Download {
    pub fn new(retry: RetrySpec) -> Self {
        Self { retry }
    }
}

/// A local copy counts as present when its hash matches, or its size when the entry has no hash.
async fn already_present(local: PathBuf, entry: &ManifestEntry) -> Result<bool> {
    let Ok(metadata) = tokio::fs::metadata(&local).await else {
        return Ok(false);
    };
    if !metadata.is_file() || metadata.len() != entry.size {
        return Ok(false);
    }
    let Some(expected) = entry.hash.clone() else {
        return Ok(true);
    };
    matches_hash_async(local, expected).await
}

#[async_trait]
impl Transfer for Download {
    type Interactor = dyn Restorer;
    const OPERATION: &'static str = "download";

    async fn perform(
        &self,
        restorer: &dyn Restorer,
        entry: &ManifestEntry,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let local = entry.local_path()?.to_path_buf();
        if already_present(local.clone(), entry).await? {
            debug!(object_key = %entry.object_key, "Local file up to date, skipping download");
            return Ok(());
        }

        let object = restorer.storage_location().object(&entry.object_key);
        with_retry(&self.retry, &entry.object_key, cancel, || {
            restorer.download_file(&local, &object, cancel)
        })
        .await?;

        if let Some(expected) = entry.hash.clone() {
            if !matches_hash_async(local.clone(), expected).await? {
                if let Err(e) = tokio::fs::remove_file(&local).await {
                    warn!(file = %local.display(), error = %e, "Unable to remove corrupt download");
                }
                return Err(BackupError::Verification(format!(
                    "downloaded {} does not match its manifest hash",
                    entry.object_key
                )));
            }
        }
        Ok(())
    }
}
