//! Restore of a stopped node straight into its data directory.

use super::phase::{verify_tokens, RestorationContext};
use super::strategy::RestorationStrategy;
use super::RestorationStrategyType;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::manifest::ManifestEntry;
use crate::transfer::Download;
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const CASSANDRA_YAML: &str = "cassandra.yaml";

/// Directories holding node-local state that must not survive a restore.
const STALE_STATE_DIRS: &[&str] = &["hints", "saved_caches", "commitlog"];

/// Downloads missing or stale files, deletes extraneous ones and optionally
/// pins the node's tokens in `cassandra.yaml`, all in one call.
#[derive(Debug, Default)]
pub struct InPlaceRestorationStrategy;

#[async_trait]
impl RestorationStrategy for InPlaceRestorationStrategy {
    fn strategy_type(&self) -> RestorationStrategyType {
        RestorationStrategyType::InPlace
    }

    async fn restore(&self, ctx: &RestorationContext) -> Result<()> {
        let request = &ctx.request;
        let yaml = request.cassandra_config_dir.join(CASSANDRA_YAML);

        ctx.restorer
            .ensure_bucket(false, request.storage.skip_bucket_verification)
            .await?;
        let mut manifest = ctx
            .restorer
            .download_manifest(&request.snapshot_tag, None)
            .await?;

        if let Some(configured) = read_initial_tokens(&yaml)? {
            verify_tokens(&manifest.tokens, &configured)?;
        }

        let data_dir = request.data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;
        manifest.enrich_manifest_entries(&data_dir);
        let entries = manifest.get_manifest_files(
            &request.entities,
            request.restore_system_keyspace,
            request.new_cluster,
            false,
        )?;

        let table_dirs: Vec<PathBuf> = entries
            .iter()
            .filter_map(|e| e.local_path().ok()?.parent().map(Path::to_path_buf))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let expected = expected_files(&entries)?;
        let removed = tokio::task::spawn_blocking(move || remove_extraneous(&table_dirs, &expected))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
        info!(removed, "Removed files not in the backup");

        ctx.tracker
            .transfer(
                Arc::clone(&ctx.restorer),
                Download::new(request.storage.retry.clone()),
                entries,
                &request.snapshot_tag,
                request.storage.concurrent_connections,
            )
            .await?;

        for dir in STALE_STATE_DIRS {
            clear_directory(&request.cassandra_dir.join(dir)).await?;
        }

        if request.update_cassandra_yaml {
            patch_cassandra_yaml(&yaml, &manifest.tokens)?;
            info!(file = %yaml.display(), tokens = manifest.tokens.len(), "Updated cassandra.yaml");
        }
        info!(snapshot_tag = %request.snapshot_tag, "In-place restore finished");
        Ok(())
    }
}

fn expected_files(entries: &[ManifestEntry]) -> Result<HashSet<PathBuf>> {
    entries
        .iter()
        .map(|e| e.local_path().map(Path::to_path_buf))
        .collect()
}

/// Delete live files of the given table directories that are not expected.
fn remove_extraneous(table_dirs: &[PathBuf], expected: &HashSet<PathBuf>) -> Result<usize> {
    let mut removed = 0;
    for dir in table_dirs {
        for file in walk_directory(dir, &WalkOptions::table_directory())? {
            if !expected.contains(&file.path) {
                std::fs::remove_file(&file.path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Empty `dir`, keeping the directory itself.
async fn clear_directory(dir: &Path) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
        removed += 1;
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, "Cleared stale node state");
    }
    Ok(())
}

fn yaml_key(line: &str) -> Option<&str> {
    let line = line.trim_start();
    if line.starts_with('#') || line.starts_with('-') {
        return None;
    }
    line.split_once(':').map(|(key, _)| key.trim())
}

/// Tokens set as `initial_token` in `cassandra.yaml`, `None` when unset or the file is absent.
pub fn read_initial_tokens(yaml: &Path) -> Result<Option<Vec<String>>> {
    let content = match std::fs::read_to_string(yaml) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(file = %yaml.display(), "No cassandra.yaml, skipping token check");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    for line in content.lines() {
        if yaml_key(line) != Some("initial_token") {
            continue;
        }
        let value = line
            .split_once(':')
            .map(|(_, v)| v.trim().trim_matches(|c| c == '"' || c == '\''))
            .unwrap_or("");
        if value.is_empty() || value == "null" || value == "~" {
            return Ok(None);
        }
        return Ok(Some(
            value
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        ));
    }
    Ok(None)
}

/// Pin `initial_token` and turn off `auto_bootstrap`, keeping every other line.
pub fn patch_cassandra_yaml(yaml: &Path, tokens: &[String]) -> Result<()> {
    if tokens.is_empty() {
        return Err(BackupError::Validation(
            "manifest has no tokens to write to cassandra.yaml".into(),
        ));
    }
    let content = std::fs::read_to_string(yaml)?;
    let mut lines: Vec<String> = content
        .lines()
        .filter(|line| !matches!(yaml_key(line), Some("initial_token") | Some("auto_bootstrap")))
        .map(str::to_string)
        .collect();
    lines.push(format!("initial_token: {}", tokens.join(",")));
    lines.push("auto_bootstrap: false".to_string());

    let tmp = yaml.with_extension("yaml.tmp");
    std::fs::write(&tmp, lines.join("\n") + "\n")?;
    std::fs::rename(&tmp, yaml)?;
    Ok(())
}
