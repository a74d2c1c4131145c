//! Listing and removal of the backups stored for a node.

use crate::manifest::{Manifest, ManifestName, DATA_PREFIX, MANIFESTS_PREFIX};
use crate::storage::{RemoteObjectReference, Restorer};
use crate::{BackupError, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use tracing::{info, warn};

/// One manifest in the bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupListing {
    pub object_key: String,
    pub snapshot_tag: String,
    pub schema_version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub files: usize,
    pub size: u64,
}

/// Manifests of the node, oldest first.
pub async fn list_backups(restorer: &dyn Restorer) -> Result<Vec<BackupListing>> {
    let mut listings = Vec::new();
    for (name, manifest) in load_manifests(restorer).await? {
        let Some(timestamp) = Utc.timestamp_millis_opt(name.epoch_millis).single() else {
            warn!(object_key = %name.object_key, "Manifest timestamp out of range, skipping");
            continue;
        };
        listings.push(BackupListing {
            files: manifest.entries().count(),
            size: manifest.total_size(),
            object_key: name.object_key,
            snapshot_tag: name.snapshot_tag,
            schema_version: name.schema_version,
            timestamp,
        });
    }
    listings.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.object_key.cmp(&b.object_key)));
    Ok(listings)
}

async fn load_manifests(restorer: &dyn Restorer) -> Result<Vec<(ManifestName, Manifest)>> {
    let mut manifests = Vec::new();
    for object in restorer.list_objects(MANIFESTS_PREFIX).await? {
        let Some(name) = ManifestName::parse(&object.object_key) else {
            warn!(object_key = %object.object_key, "Unrecognized manifest name, skipping");
            continue;
        };
        let content = restorer.download_file_to_string(&object).await?;
        manifests.push((name, Manifest::from_json(&content)?));
    }
    Ok(manifests)
}

/// Which manifests to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSelector {
    /// Snapshot tags or manifest object keys.
    Names(Vec<String>),
    /// Manifests taken before this instant.
    OlderThan(DateTime<Utc>),
}

impl BackupSelector {
    fn matches(&self, name: &ManifestName) -> bool {
        match self {
            BackupSelector::Names(names) => names.iter().any(|n| {
                *n == name.snapshot_tag
                    || *n == name.object_key
                    || name.object_key.rsplit('/').next() == Some(n.as_str())
            }),
            BackupSelector::OlderThan(cutoff) => name.epoch_millis < cutoff.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub manifests: Vec<String>,
    pub data_objects: usize,
}

/// Delete the selected manifests, then every data object that no remaining
/// manifest references.
///
/// Callers hold the global lock so no backup uploads objects meanwhile.
pub async fn remove_backups(restorer: &dyn Restorer, selector: &BackupSelector) -> Result<RemovalOutcome> {
    if let BackupSelector::Names(names) = selector {
        if names.is_empty() {
            return Err(BackupError::Validation("no backup names given".into()));
        }
    }

    let manifests = load_manifests(restorer).await?;
    let (removed, kept): (Vec<_>, Vec<_>) = manifests
        .into_iter()
        .partition(|(name, _)| selector.matches(name));
    if removed.is_empty() {
        return Err(BackupError::ManifestNotFound(format!(
            "no manifest matches {:?}",
            selector
        )));
    }

    let referenced: HashSet<String> = kept
        .iter()
        .flat_map(|(_, manifest)| manifest.entries().map(|e| e.object_key.clone()))
        .collect();

    let mut outcome = RemovalOutcome::default();
    for (name, _) in &removed {
        let object = restorer.storage_location().object(&name.object_key);
        restorer.delete_object(&object).await?;
        info!(manifest = %object.canonical_path, "Removed manifest");
        outcome.manifests.push(name.object_key.clone());
    }

    let orphans: Vec<RemoteObjectReference> = restorer
        .list_objects(DATA_PREFIX)
        .await?
        .into_iter()
        .filter(|object| !referenced.contains(&object.object_key))
        .collect();
    for object in &orphans {
        restorer.delete_object(object).await?;
    }
    outcome.data_objects = orphans.len();
    info!(
        manifests = outcome.manifests.len(),
        data_objects = outcome.data_objects,
        "Removed backups"
    );
    Ok(outcome)
}
