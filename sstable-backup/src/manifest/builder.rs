//! Builds a [`Manifest`] from the snapshot directories of a live data directory.

use super::{data_object_key, Keyspace, Manifest, ManifestEntry, ManifestEntryType, Snapshot, Table, SCHEMA_FILE_NAME};
use crate::entities::{CassandraData, DatabaseEntities};
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::hashing::hash_file;
use crate::Result;
use std::path::Path;
use tracing::{debug, info};

/// Cassandra writes its own listing next to the snapshot files; it is not backed up.
const SNAPSHOT_LISTING: &str = "manifest.json";

/// Walk `<data_dir>/<ks>/<table>-<id>/snapshots/<tag>/` of every table in scope.
///
/// Tables without a snapshot directory for `snapshot_tag` are left out.
pub fn build_manifest(
    data_dir: &Path,
    snapshot_tag: &str,
    entities: &DatabaseEntities,
    tokens: Vec<String>,
    schema_version: &str,
) -> Result<Manifest> {
    let data = CassandraData::parse(data_dir)?;
    data.validate_exist(entities)?;

    let in_scope = data.get_database_entities(true).filter(entities, true, false);
    let mut snapshot = Snapshot::default();

    for kt in in_scope.tables() {
        let Some(table_dir) = data.table(&kt) else {
            continue;
        };
        let snapshot_dir = table_dir.path.join("snapshots").join(snapshot_tag);
        if !snapshot_dir.is_dir() {
            debug!(table = %kt, "No snapshot directory, skipping table");
            continue;
        }

        let dir_name = format!("{}-{}", kt.table, table_dir.id);
        let mut table = Table {
            entries: Vec::new(),
            id: table_dir.id.clone(),
            schema_content: None,
        };

        for file in walk_directory(&snapshot_dir, &WalkOptions::default())? {
            if file.relative_path == SNAPSHOT_LISTING {
                continue;
            }
            let hash = hash_file(&file.path)?;
            let (entry_type, object_key) = if file.relative_path == SCHEMA_FILE_NAME {
                table.schema_content = Some(std::fs::read_to_string(&file.path)?);
                let key = data_object_key(&kt.keyspace, &dir_name, &file.relative_path, None);
                (ManifestEntryType::CqlSchema, key)
            } else {
                let key = data_object_key(&kt.keyspace, &dir_name, &file.relative_path, Some(&hash));
                (ManifestEntryType::File, key)
            };
            let mut entry = ManifestEntry::new(object_key, entry_type, file.size)
                .with_hash(hash)
                .with_local_file(&file.path);
            entry.keyspace_table = Some(kt.clone());
            table.entries.push(entry);
        }

        snapshot
            .keyspaces
            .entry(kt.keyspace.clone())
            .or_insert_with(Keyspace::default)
            .tables
            .insert(kt.table.clone(), table);
    }

    let manifest = Manifest::new(snapshot, tokens, schema_version);
    info!(
        snapshot_tag,
        files = manifest.entries().count(),
        bytes = manifest.total_size(),
        "Built manifest from snapshot"
    );
    Ok(manifest)
}
