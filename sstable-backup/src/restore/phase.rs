//! Restoration phases.
//!
//! Each phase is run on its own invocation and must be safe to run again:
//! a repeated DOWNLOAD only fetches what is missing or stale, a repeated
//! CLEANUP finds nothing left to delete. Disk layout is parsed afresh on
//! every invocation.

use super::verification::DataVerification;
use super::{RestorationPhaseType, RestorationStrategyType, RestoreRequest};
use crate::cassandra::{CassandraInteraction, NORMAL_MODE};
use crate::entities::{CassandraData, DatabaseEntities, KeyspaceTable};
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::manifest::{Manifest, ManifestEntry};
use crate::storage::Restorer;
use crate::transfer::{Download, DownloadTracker};
use crate::{BackupError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Prefix of the snapshots Cassandra takes when truncating a table.
pub const TRUNCATED_SNAPSHOT_PREFIX: &str = "truncated-";

/// Everything a phase works with.
pub struct RestorationContext {
    pub request: RestoreRequest,
    pub restorer: Arc<dyn Restorer>,
    pub cassandra: Arc<dyn CassandraInteraction>,
    pub tracker: Arc<DownloadTracker>,
}

impl RestorationContext {
    pub fn new(
        request: RestoreRequest,
        restorer: Arc<dyn Restorer>,
        cassandra: Arc<dyn CassandraInteraction>,
        tracker: Arc<DownloadTracker>,
    ) -> Self {
        Self {
            request,
            restorer,
            cassandra,
            tracker,
        }
    }

    /// Manifest of the requested snapshot, restricted to the node's schema when asked to.
    async fn download_manifest(&self, node_schema_version: Option<&str>) -> Result<Manifest> {
        let schema = if self.request.exact_schema_version {
            node_schema_version
        } else {
            None
        };
        self.restorer
            .download_manifest(&self.request.snapshot_tag, schema)
            .await
    }

    /// Manifest enriched against the staging directory.
    async fn staged_manifest(&self) -> Result<Manifest> {
        let schema = if self.request.exact_schema_version {
            Some(self.cassandra.get_schema_version().await?)
        } else {
            None
        };
        let mut manifest = self.download_manifest(schema.as_deref()).await?;
        manifest.enrich_manifest_entries(&self.request.download_dir);
        Ok(manifest)
    }

    fn manifest_files(&self, manifest: &Manifest) -> Result<Vec<ManifestEntry>> {
        manifest.get_manifest_files(
            &self.request.entities,
            self.request.restore_system_keyspace,
            self.request.new_cluster,
            false,
        )
    }

    /// Tables on disk this restore writes to.
    fn tables_to_process(&self) -> Result<(CassandraData, DatabaseEntities)> {
        let data = CassandraData::parse(&self.request.data_dir())?;
        let tables = data.get_database_entities_to_process_for_restore(
            &self.request.entities,
            &self.request.renamed,
        )?;
        Ok((data, tables))
    }

    /// Staging directory holding the data of `target`, following renames.
    fn staged_table_dir(&self, manifest: &Manifest, target: &KeyspaceTable) -> Option<PathBuf> {
        let source = self.request.renamed.source_of(target).unwrap_or(target);
        let table = manifest.table(source)?;
        Some(
            self.request
                .download_dir
                .join(&source.keyspace)
                .join(table.dir_name(&source.table)),
        )
    }
}

/// Fail unless the manifest was taken on a node owning the same tokens.
pub fn verify_tokens(manifest_tokens: &[String], node_tokens: &[String]) -> Result<()> {
    if manifest_tokens.is_empty() {
        warn!("Manifest records no tokens, skipping token verification");
        return Ok(());
    }
    let normalize = |tokens: &[String]| {
        let mut tokens: Vec<String> = tokens.iter().map(|t| t.trim().to_string()).collect();
        tokens.sort();
        tokens
    };
    if normalize(manifest_tokens) != normalize(node_tokens) {
        return Err(BackupError::Validation(format!(
            "tokens of the backup ({} tokens) do not match the tokens of this node ({} tokens)",
            manifest_tokens.len(),
            node_tokens.len()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorationPhase {
    Init,
    ClusterHealthcheck,
    Download,
    Truncate,
    /// Native SSTable import.
    Import,
    /// Import by hardlinking staged files and refreshing tables.
    Hardlink,
    Cleanup,
}

impl RestorationPhase {
    /// The phase implementation a strategy runs for a requested phase type.
    pub fn resolve(strategy: RestorationStrategyType, phase: RestorationPhaseType) -> Result<Self> {
        match phase {
            RestorationPhaseType::Init => Ok(RestorationPhase::Init),
            RestorationPhaseType::ClusterHealthcheck => Ok(RestorationPhase::ClusterHealthcheck),
            RestorationPhaseType::Download => Ok(RestorationPhase::Download),
            RestorationPhaseType::Truncate => Ok(RestorationPhase::Truncate),
            RestorationPhaseType::Import => match strategy {
                RestorationStrategyType::Import => Ok(RestorationPhase::Import),
                RestorationStrategyType::Hardlinks => Ok(RestorationPhase::Hardlink),
                RestorationStrategyType::InPlace | RestorationStrategyType::Unknown => {
                    Err(BackupError::Strategy(format!(
                        "strategy {} has no {} phase",
                        strategy, phase
                    )))
                }
            },
            RestorationPhaseType::Cleanup => Ok(RestorationPhase::Cleanup),
            RestorationPhaseType::Unknown => Err(BackupError::Validation(
                "restoration phase is UNKNOWN".into(),
            )),
        }
    }

    pub fn phase_type(&self) -> RestorationPhaseType {
        match self {
            RestorationPhase::Init => RestorationPhaseType::Init,
            RestorationPhase::ClusterHealthcheck => RestorationPhaseType::ClusterHealthcheck,
            RestorationPhase::Download => RestorationPhaseType::Download,
            RestorationPhase::Truncate => RestorationPhaseType::Truncate,
            RestorationPhase::Import | RestorationPhase::Hardlink => RestorationPhaseType::Import,
            RestorationPhase::Cleanup => RestorationPhaseType::Cleanup,
        }
    }

    /// Run the phase; any error comes back wrapped with the phase type.
    pub async fn execute(&self, ctx: &RestorationContext) -> Result<()> {
        let phase = self.phase_type();
        info!(%phase, snapshot_tag = %ctx.request.snapshot_tag, "Starting restoration phase");

        let result = match self {
            RestorationPhase::Init => init(ctx).await,
            RestorationPhase::ClusterHealthcheck => cluster_healthcheck(ctx).await,
            RestorationPhase::Download => download(ctx).await,
            RestorationPhase::Truncate => truncate(ctx).await,
            RestorationPhase::Import => import(ctx).await,
            RestorationPhase::Hardlink => hardlink(ctx).await,
            RestorationPhase::Cleanup => cleanup(ctx).await,
        };

        match result {
            Ok(()) => {
                info!(%phase, "Restoration phase finished");
                Ok(())
            }
            Err(e) => {
                error!(%phase, error = %e, "Restoration phase failed");
                Err(e.in_phase(phase))
            }
        }
    }
}

async fn init(ctx: &RestorationContext) -> Result<()> {
    let storage = &ctx.request.storage;
    ctx.restorer
        .ensure_bucket(false, storage.skip_bucket_verification)
        .await?;
    let manifest = ctx.download_manifest(None).await?;
    info!(
        files = manifest.entries().count(),
        bytes = manifest.total_size(),
        "Manifest is retrievable"
    );
    Ok(())
}

async fn cluster_healthcheck(ctx: &RestorationContext) -> Result<()> {
    let cassandra = &ctx.cassandra;
    let mut problems = Vec::new();

    let mode = cassandra.get_operation_mode().await?;
    if mode != NORMAL_MODE {
        problems.push(format!("node is in {} mode, expected {}", mode, NORMAL_MODE));
    }

    let down = cassandra.get_failure_detector_down_count().await?;
    if down > 0 {
        problems.push(format!("{} node(s) reported down", down));
    }

    let changes = cassandra.get_topology_changes().await?;
    if !changes.is_empty() {
        problems.push(format!(
            "topology is changing: joining {:?}, leaving {:?}, moving {:?}",
            changes.joining, changes.leaving, changes.moving
        ));
    }

    let versions = cassandra.get_cluster_schema_versions().await?;
    if versions.len() != 1 {
        problems.push(format!(
            "schema versions disagree across the cluster: {:?}",
            versions
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(BackupError::ClusterHealth(problems.join("; ")))
    }
}

async fn download(ctx: &RestorationContext) -> Result<()> {
    let request = &ctx.request;
    if request.no_download_data {
        info!("Downloading of data is disabled, skipping");
        return Ok(());
    }

    ctx.restorer
        .ensure_bucket(false, request.storage.skip_bucket_verification)
        .await?;
    let schema_version = ctx.cassandra.get_schema_version().await?;
    let mut manifest = ctx.download_manifest(Some(schema_version.as_str())).await?;
    verify_tokens(&manifest.tokens, &ctx.cassandra.get_local_tokens().await?)?;

    tokio::fs::create_dir_all(&request.download_dir).await?;
    manifest.enrich_manifest_entries(&request.download_dir);
    let entries = ctx.manifest_files(&manifest)?;

    let expected: HashSet<PathBuf> = entries
        .iter()
        .map(|e| e.local_path().map(Path::to_path_buf))
        .collect::<Result<_>>()?;
    let staging = request.download_dir.clone();
    let removed = tokio::task::spawn_blocking(move || prune_directory(&staging, &expected))
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
    if removed > 0 {
        info!(removed, "Removed extraneous files from staging directory");
    }

    info!(files = entries.len(), "Downloading snapshot data");
    ctx.tracker
        .transfer(
            Arc::clone(&ctx.restorer),
            Download::new(request.storage.retry.clone()),
            entries,
            &request.snapshot_tag,
            request.storage.concurrent_connections,
        )
        .await
}

async fn truncate(ctx: &RestorationContext) -> Result<()> {
    let (_, tables) = ctx.tables_to_process()?;
    let mut failures = Vec::new();

    for kt in tables.tables() {
        match ctx.cassandra.truncate_table(&kt.keyspace, &kt.table).await {
            Ok(()) => info!(table = %kt, "Truncated table"),
            Err(e) => {
                warn!(table = %kt, error = %e, "Unable to truncate table");
                failures.push(format!("{}: {}", kt, e));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(BackupError::Cassandra(format!(
            "unable to truncate {} table(s): {}",
            failures.len(),
            failures.join("; ")
        )))
    }
}

/// Staged data must match the manifest before anything is loaded.
async fn verify_staged(ctx: &RestorationContext) -> Result<Manifest> {
    let manifest = ctx.staged_manifest().await?;
    DataVerification::new(ctx.manifest_files(&manifest)?)
        .verify()
        .await?;
    Ok(manifest)
}

async fn import(ctx: &RestorationContext) -> Result<()> {
    let manifest = verify_staged(ctx).await?;
    let (_, tables) = ctx.tables_to_process()?;

    for kt in tables.tables() {
        let Some(staged) = ctx.staged_table_dir(&manifest, &kt).filter(|d| d.is_dir()) else {
            debug!(table = %kt, "Nothing staged for table");
            continue;
        };
        ctx.cassandra
            .import_sstables(&kt.keyspace, &kt.table, &staged)
            .await?;
        info!(table = %kt, from = %staged.display(), "Imported SSTables");
    }
    Ok(())
}

async fn hardlink(ctx: &RestorationContext) -> Result<()> {
    let manifest = verify_staged(ctx).await?;
    let (data, tables) = ctx.tables_to_process()?;

    let mut plan = Vec::new();
    for kt in tables.tables() {
        let Some(staged) = ctx.staged_table_dir(&manifest, &kt).filter(|d| d.is_dir()) else {
            debug!(table = %kt, "Nothing staged for table");
            continue;
        };
        let live = data
            .table_path(&kt)
            .ok_or_else(|| BackupError::Validation(format!("table {} does not exist", kt)))?;
        for file in walk_directory(&staged, &WalkOptions::default())? {
            plan.push((file.path, file.relative_path.split('/').fold(live.to_path_buf(), |p, s| p.join(s))));
        }
    }

    let linked = tokio::task::spawn_blocking(move || link_all(&plan))
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
    info!(links = linked, "Hardlinked staged files into live tables");

    let mut failures = Vec::new();
    for kt in tables.tables() {
        if let Err(e) = ctx.cassandra.refresh_table(&kt.keyspace, &kt.table).await {
            warn!(table = %kt, error = %e, "Unable to refresh table");
            failures.push(format!("{}: {}", kt, e));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(BackupError::Cassandra(format!(
            "unable to refresh {} table(s): {}",
            failures.len(),
            failures.join("; ")
        )))
    }
}

/// Hardlink every `(source, target)` pair; on the first failure remove the links made so far.
///
/// A target that already is a link to its source counts as linked and is never rolled back.
pub fn link_all(plan: &[(PathBuf, PathBuf)]) -> Result<usize> {
    let mut created: Vec<&Path> = Vec::with_capacity(plan.len());
    let mut present = 0;

    for (source, target) in plan {
        match already_linked(source, target) {
            Ok(true) => {
                debug!(target = %target.display(), "Already linked");
                present += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => return Err(rollback(&created, source, target, e)),
        }

        let result = target
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::hard_link(source, target));

        if let Err(e) = result {
            return Err(rollback(&created, source, target, e));
        }
        created.push(target);
    }
    Ok(created.len() + present)
}

/// Whether `target` exists and is the same inode as `source`.
fn already_linked(source: &Path, target: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let target = match std::fs::symlink_metadata(target) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let source = std::fs::metadata(source)?;
    Ok(source.dev() == target.dev() && source.ino() == target.ino())
}

fn rollback(created: &[&Path], source: &Path, target: &Path, e: std::io::Error) -> BackupError {
    error!(
        source = %source.display(),
        target = %target.display(),
        error = %e,
        "Hardlinking failed, rolling back {} link(s)",
        created.len()
    );
    for link in created {
        if let Err(e) = std::fs::remove_file(link) {
            warn!(link = %link.display(), error = %e, "Unable to remove link during rollback");
        }
    }
    BackupError::Io(std::io::Error::new(
        e.kind(),
        format!(
            "unable to link {} to {}: {}",
            source.display(),
            target.display(),
            e
        ),
    ))
}

async fn cleanup(ctx: &RestorationContext) -> Result<()> {
    let request = &ctx.request;
    let mut failures = Vec::new();

    if request.no_delete_truncates {
        info!("Keeping truncated snapshots");
    } else {
        match remove_truncated_snapshots(&request.data_dir()) {
            Ok(removed) => info!(removed, "Removed truncated snapshots"),
            Err(e) => failures.push(format!("removing truncated snapshots: {}", e)),
        }
    }

    if request.no_delete_downloads {
        info!(dir = %request.download_dir.display(), "Keeping downloaded data");
    } else {
        match tokio::fs::remove_dir_all(&request.download_dir).await {
            Ok(()) => info!(dir = %request.download_dir.display(), "Removed downloaded data"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %request.download_dir.display(), "No downloaded data to remove");
            }
            Err(e) => failures.push(format!(
                "removing download directory {}: {}",
                request.download_dir.display(),
                e
            )),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(BackupError::Io(std::io::Error::other(failures.join("; "))))
    }
}

/// Delete `snapshots/truncated-*` of every table under `data_dir`.
fn remove_truncated_snapshots(data_dir: &Path) -> Result<usize> {
    if !data_dir.is_dir() {
        return Ok(0);
    }
    let data = CassandraData::parse(data_dir)?;
    let mut removed = 0;
    for kt in data.get_database_entities(true).tables() {
        let Some(snapshots) = data.table_path(&kt).map(|p| p.join("snapshots")) else {
            continue;
        };
        let Ok(entries) = std::fs::read_dir(&snapshots) else {
            continue;
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(TRUNCATED_SNAPSHOT_PREFIX)
            {
                std::fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Remove files under `dir` that are not in `keep`.
fn prune_directory(dir: &Path, keep: &HashSet<PathBuf>) -> Result<usize> {
    let mut removed = 0;
    for file in walk_directory(dir, &WalkOptions::default())? {
        if !keep.contains(&file.path) {
            std::fs::remove_file(&file.path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
