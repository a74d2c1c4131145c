//! Commit log segments: upload to `commitlog/<segment>` and restore for replay.

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::hashing::hash_file;
use crate::lock::GlobalLock;
use crate::manifest::{ManifestEntry, ManifestEntryType};
use crate::restore::StorageSettings;
use crate::storage::{Backuper, Restorer};
use crate::transfer::{Download, DownloadTracker, Upload, UploadTracker};
use crate::{BackupError, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const COMMITLOG_PREFIX: &str = "commitlog";
pub const ARCHIVING_PROPERTIES: &str = "commitlog_archiving.properties";

/// Session tag of commit log transfers.
const COMMITLOG_SESSION: &str = "commitlog";

/// Point-in-time format Cassandra accepts in `restore_point_in_time`.
const POINT_IN_TIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Segment names look like `CommitLog-<version>-<id>.log`, the id being
/// the creation time in epoch millis.
pub fn is_commitlog_segment(name: &str) -> bool {
    name.starts_with("CommitLog-") && name.ends_with(".log")
}

/// Creation time of a segment, from its name.
pub fn segment_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(".log")?;
    let millis = stem.rsplit('-').next()?.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

#[derive(Debug, Clone)]
pub struct CommitLogBackupRequest {
    pub storage: StorageSettings,
    pub commitlog_dir: PathBuf,
    pub lock_file: PathBuf,
}

/// Upload every segment of the commit log directory.
///
/// Segments already in the bucket are skipped, so only archived (closed)
/// segments should be passed through here.
pub async fn backup_commitlogs(
    request: &CommitLogBackupRequest,
    backuper: Arc<dyn Backuper>,
    tracker: &UploadTracker,
) -> Result<usize> {
    request.storage.validate()?;
    let _lock = GlobalLock::acquire(&request.lock_file)?;
    backuper
        .ensure_bucket(
            request.storage.create_missing_bucket,
            request.storage.skip_bucket_verification,
        )
        .await?;

    let dir = request.commitlog_dir.clone();
    let entries = tokio::task::spawn_blocking(move || segment_entries(&dir))
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
    if entries.is_empty() {
        info!(dir = %request.commitlog_dir.display(), "No commit log segments to back up");
        return Ok(0);
    }

    let count = entries.len();
    tracker
        .transfer(
            backuper,
            Upload::new(request.storage.retry.clone()),
            entries,
            COMMITLOG_SESSION,
            request.storage.concurrent_connections,
        )
        .await?;
    info!(segments = count, "Commit logs backed up");
    Ok(count)
}

fn segment_entries(dir: &Path) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for file in walk_directory(dir, &WalkOptions::flat())? {
        if !is_commitlog_segment(&file.relative_path) {
            continue;
        }
        entries.push(
            ManifestEntry::new(
                format!("{}/{}", COMMITLOG_PREFIX, file.relative_path),
                ManifestEntryType::CommitLog,
                file.size,
            )
            .with_hash(hash_file(&file.path)?)
            .with_local_file(&file.path),
        );
    }
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct CommitLogRestoreRequest {
    pub storage: StorageSettings,
    /// Where segments are downloaded to; Cassandra replays from here.
    pub restore_dir: PathBuf,
    /// Directory receiving `commitlog_archiving.properties`.
    pub cassandra_config_dir: PathBuf,
    /// Only segments created at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Only segments created at or before this instant.
    pub to: Option<DateTime<Utc>>,
    /// Replay stops at this instant.
    pub point_in_time: Option<DateTime<Utc>>,
}

impl CommitLogRestoreRequest {
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(BackupError::Validation(format!(
                    "commit log window starts after it ends: {} > {}",
                    from, to
                )));
            }
        }
        Ok(())
    }

    fn in_window(&self, name: &str) -> bool {
        if self.from.is_none() && self.to.is_none() {
            return true;
        }
        let Some(created) = segment_timestamp(name) else {
            return false;
        };
        self.from.map_or(true, |from| created >= from) && self.to.map_or(true, |to| created <= to)
    }
}

/// Download the selected segments and point Cassandra's archiver at them.
pub async fn restore_commitlogs(
    request: &CommitLogRestoreRequest,
    restorer: Arc<dyn Restorer>,
    tracker: &DownloadTracker,
) -> Result<usize> {
    request.validate()?;
    restorer
        .ensure_bucket(false, request.storage.skip_bucket_verification)
        .await?;

    let entries: Vec<ManifestEntry> = restorer
        .list_objects(COMMITLOG_PREFIX)
        .await?
        .into_iter()
        .filter_map(|object| {
            let name = object.object_key.rsplit('/').next()?.to_string();
            (is_commitlog_segment(&name) && request.in_window(&name)).then(|| {
                ManifestEntry::new(object.object_key.clone(), ManifestEntryType::CommitLog, 0)
                    .with_local_file(request.restore_dir.join(&name))
            })
        })
        .collect();

    tokio::fs::create_dir_all(&request.restore_dir).await?;
    let count = entries.len();
    tracker
        .transfer(
            restorer,
            Download::new(request.storage.retry.clone()),
            entries,
            COMMITLOG_SESSION,
            request.storage.concurrent_connections,
        )
        .await?;

    write_archiving_properties(
        &request.cassandra_config_dir,
        &request.restore_dir,
        request.point_in_time,
    )?;
    info!(segments = count, dir = %request.restore_dir.display(), "Commit logs restored");
    Ok(count)
}

pub fn write_archiving_properties(
    config_dir: &Path,
    restore_dir: &Path,
    point_in_time: Option<DateTime<Utc>>,
) -> Result<PathBuf> {
    let mut content = String::new();
    content.push_str("restore_command=cp -f %from %to\n");
    content.push_str(&format!("restore_directories={}\n", restore_dir.display()));
    if let Some(pit) = point_in_time {
        content.push_str(&format!(
            "restore_point_in_time={}\n",
            pit.format(POINT_IN_TIME_FORMAT)
        ));
    }

    std::fs::create_dir_all(config_dir)?;
    let path = config_dir.join(ARCHIVING_PROPERTIES);
    std::fs::write(&path, content)?;
    Ok(path)
}
