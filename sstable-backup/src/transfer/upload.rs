//! Upload direction of the tracker.

use super::tracker::{Tracker, Transfer};
use crate::manifest::{ManifestEntry, ManifestEntryType};
use crate::storage::{with_retry, Backuper, RetrySpec};
use crate::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Uploads an entry's local file. Data object keys carry the content hash, so
/// objects already in the bucket are not uploaded again; schemas always are.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub retry: RetrySpec,
}

pub type UploadTracker = Tracker<Upload>;

impl Upload {
    pub fn new(retry: RetrySpec) -> Self {
        Self { retry }
    }
}

#[async_trait]
impl Transfer for Upload {
    type Interactor = dyn Backuper;
    const OPERATION: &'static str = "upload";

    async fn perform(
        &self,
        backuper: &dyn Backuper,
        entry: &ManifestEntry,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let local = entry.local_path()?;
        let object = backuper.storage_location().object(&entry.object_key);

        if entry.entry_type != ManifestEntryType::CqlSchema && backuper.object_exists(&object).await? {
            debug!(object_key = %entry.object_key, "Object already uploaded, skipping");
            return Ok(());
        }

        with_retry(&self.retry, &entry.object_key, cancel, || {
            backuper.upload_file(local, &object, cancel)
        })
        .await
    }
}
