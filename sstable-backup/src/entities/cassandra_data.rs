//! Snapshot of the keyspace/table layout found in a Cassandra data directory.
//!
//! Table directories are named `<table>-<32 hex table id>`. The layout is
//! parsed again for every phase because disk state changes between phases.

use super::{filter_system_keyspace, DatabaseEntities, KeyspaceTable, RenamedEntities};
use crate::{BackupError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TableDirectory {
    pub id: String,
    pub path: PathBuf,
    modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct CassandraData {
    data_dir: PathBuf,
    keyspaces: BTreeMap<String, BTreeMap<String, TableDirectory>>,
}

/// Split `<table>-<id>` into its parts, `None` when the suffix is not a table id.
pub fn split_table_dir_name(name: &str) -> Option<(&str, &str)> {
    let (table, id) = name.rsplit_once('-')?;
    let is_id = id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit());
    (is_id && !table.is_empty()).then_some((table, id))
}

impl CassandraData {
    /// Read the keyspace and table directories under `data_dir`.
    pub fn parse(data_dir: &Path) -> Result<Self> {
        if !data_dir.is_dir() {
            return Err(BackupError::Validation(format!(
                "Cassandra data directory {} does not exist",
                data_dir.display()
            )));
        }

        let mut keyspaces: BTreeMap<String, BTreeMap<String, TableDirectory>> = BTreeMap::new();

        for ks_entry in std::fs::read_dir(data_dir)? {
            let ks_entry = ks_entry?;
            if !ks_entry.file_type()?.is_dir() {
                continue;
            }
            let keyspace = ks_entry.file_name().to_string_lossy().to_string();
            let mut tables: BTreeMap<String, TableDirectory> = BTreeMap::new();

            for table_entry in std::fs::read_dir(ks_entry.path())? {
                let table_entry = table_entry?;
                if !table_entry.file_type()?.is_dir() {
                    continue;
                }
                let dir_name = table_entry.file_name().to_string_lossy().to_string();
                let Some((table, id)) = split_table_dir_name(&dir_name) else {
                    debug!(keyspace = %keyspace, directory = %dir_name, "Skipping non-table directory");
                    continue;
                };
                let modified = table_entry.metadata()?.modified()?;
                let candidate = TableDirectory {
                    id: id.to_string(),
                    path: table_entry.path(),
                    modified,
                };

                // A dropped and recreated table leaves the old directory behind; the newest one is live.
                match tables.get(table) {
                    Some(existing) if existing.modified >= candidate.modified => {
                        warn!(keyspace = %keyspace, table, stale_id = id, "Ignoring older table directory");
                    }
                    Some(existing) => {
                        warn!(keyspace = %keyspace, table, stale_id = %existing.id, "Ignoring older table directory");
                        tables.insert(table.to_string(), candidate);
                    }
                    None => {
                        tables.insert(table.to_string(), candidate);
                    }
                }
            }

            if !tables.is_empty() {
                keyspaces.insert(keyspace, tables);
            }
        }

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            keyspaces,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn table(&self, kt: &KeyspaceTable) -> Option<&TableDirectory> {
        self.keyspaces.get(&kt.keyspace)?.get(&kt.table)
    }

    pub fn table_path(&self, kt: &KeyspaceTable) -> Option<&Path> {
        self.table(kt).map(|t| t.path.as_path())
    }

    pub fn contains_table(&self, kt: &KeyspaceTable) -> bool {
        self.table(kt).is_some()
    }

    pub fn contains_keyspace(&self, keyspace: &str) -> bool {
        self.keyspaces.contains_key(keyspace)
    }

    pub fn keyspace_names(&self) -> impl Iterator<Item = &str> {
        self.keyspaces.keys().map(String::as_str)
    }

    /// Every table on disk, optionally including system keyspaces.
    pub fn get_database_entities(&self, include_system: bool) -> DatabaseEntities {
        DatabaseEntities::from_tables(
            self.keyspaces
                .iter()
                .filter(|(ks, _)| filter_system_keyspace(ks, include_system, false))
                .flat_map(|(ks, tables)| tables.keys().map(move |t| KeyspaceTable::new(ks.clone(), t.clone())))
                .collect::<Vec<_>>(),
        )
    }

    /// Fail naming the first keyspace or table of `entities` missing on disk.
    pub fn validate_exist(&self, entities: &DatabaseEntities) -> Result<()> {
        for keyspace in entities.keyspaces() {
            if !self.contains_keyspace(keyspace) {
                return Err(BackupError::Validation(format!(
                    "keyspace {} does not exist in {}",
                    keyspace,
                    self.data_dir.display()
                )));
            }
        }
        for kt in entities.tables() {
            if !self.contains_table(&kt) {
                return Err(BackupError::Validation(format!(
                    "table {} does not exist in {}",
                    kt,
                    self.data_dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Tables a restore touches: requested tables minus rename sources plus rename targets.
    ///
    /// Keyspace requests expand to their tables on disk; an empty request
    /// expands to every non-system table on disk.
    pub fn get_database_entities_to_process_for_restore(
        &self,
        requested: &DatabaseEntities,
        renamed: &RenamedEntities,
    ) -> Result<DatabaseEntities> {
        requested.validate()?;
        renamed.validate()?;

        if !renamed.is_empty() {
            if requested.is_empty() {
                return Err(BackupError::Validation(format!(
                    "renamed entities '{}' require explicit tables to restore, entities are empty",
                    renamed
                )));
            }
            if requested.keyspaces_only() {
                return Err(BackupError::Validation(format!(
                    "renamed entities '{}' can not be used with keyspace-only entities '{}'",
                    renamed, requested
                )));
            }
        }
        for from in renamed.froms() {
            if !requested.contains_table(from) {
                return Err(BackupError::Validation(format!(
                    "renamed table {} is not among entities to restore '{}'",
                    from, requested
                )));
            }
        }
        for to in renamed.tos() {
            if requested.contains_table(to) {
                return Err(BackupError::Validation(format!(
                    "rename target {} is also among entities to restore '{}'",
                    to, requested
                )));
            }
        }

        let mut to_process = if requested.is_empty() {
            self.get_database_entities(false)
        } else if requested.keyspaces_only() {
            self.validate_exist(requested)?;
            self.get_database_entities(true)
                .filter(requested, true, false)
        } else {
            requested.clone()
        };

        for from in renamed.froms() {
            to_process.remove_table(from);
        }
        for to in renamed.tos() {
            to_process.add_table(to.clone());
        }

        self.validate_exist(&to_process)?;
        Ok(to_process)
    }
}
