//! Test doubles: a Cassandra node modelled on a temporary data directory.
//!
//! SSTables are stubs: `<prefix>-Data.db` holds the number of rows as text.

use crate::cassandra::{CassandraInteraction, CassandraVersion, TopologyChanges, NORMAL_MODE};
use crate::entities::{CassandraData, DatabaseEntities, KeyspaceTable};
use crate::storage::{LocalFileStorage, StorageLocation};
use crate::{BackupError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SCHEMA_VERSION: &str = "e84b6a60-24cf-30ca-9b58-452d92911703";

/// Deterministic 32 hex table id.
pub fn table_id(keyspace: &str, table: &str) -> String {
    let digest = Sha256::digest(format!("{}.{}", keyspace, table).as_bytes());
    hex::encode(digest)[..32].to_string()
}

pub fn create_table(data_dir: &Path, keyspace: &str, table: &str) -> PathBuf {
    let dir = data_dir
        .join(keyspace)
        .join(format!("{}-{}", table, table_id(keyspace, table)));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write one SSTable generation holding `rows` rows.
pub fn insert_rows(table_dir: &Path, generation: u32, rows: u64) {
    std::fs::write(table_dir.join(format!("nb-{}-big-Data.db", generation)), rows.to_string()).unwrap();
    std::fs::write(table_dir.join(format!("nb-{}-big-Index.db", generation)), b"index").unwrap();
}

/// Rows of the live SSTables of a table directory.
pub fn count_rows(table_dir: &Path) -> u64 {
    std::fs::read_dir(table_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with("-Data.db"))
        .map(|e| std::fs::read_to_string(e.path()).unwrap().trim().parse::<u64>().unwrap())
        .sum()
}

/// Regular files directly inside `dir`.
fn files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

pub fn local_storage(root: &Path) -> LocalFileStorage {
    let raw = format!("file://{}/bucket/cluster/dc1/node1", root.display());
    LocalFileStorage::new(StorageLocation::parse(&raw).unwrap()).unwrap()
}

pub struct FakeCassandra {
    pub data_dir: PathBuf,
    pub running: bool,
    pub schema_version: String,
    pub release_version: CassandraVersion,
    pub tokens: Vec<String>,
    pub mode: String,
    pub down: usize,
    pub topology: TopologyChanges,
    pub cluster_schema_versions: BTreeMap<String, Vec<String>>,
    pub failing_tables: HashSet<KeyspaceTable>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeCassandra {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            running: true,
            schema_version: SCHEMA_VERSION.to_string(),
            release_version: CassandraVersion { major: 4, minor: 0, patch: 11 },
            tokens: vec!["-9223372036854775808".to_string(), "0".to_string()],
            mode: NORMAL_MODE.to_string(),
            down: 0,
            topology: TopologyChanges::default(),
            cluster_schema_versions: BTreeMap::from([(
                SCHEMA_VERSION.to_string(),
                vec!["10.0.0.1".to_string()],
            )]),
            failing_tables: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, keyspace: &str, table: &str) -> Result<PathBuf> {
        let kt = KeyspaceTable::new(keyspace, table);
        if self.failing_tables.contains(&kt) {
            return Err(BackupError::Cassandra(format!("{} is unavailable", kt)));
        }
        CassandraData::parse(&self.data_dir)?
            .table_path(&kt)
            .map(Path::to_path_buf)
            .ok_or_else(|| BackupError::Cassandra(format!("unknown table {}", kt)))
    }

    fn live(&self) -> Result<()> {
        if self.running {
            Ok(())
        } else {
            Err(BackupError::Cassandra("connection refused".into()))
        }
    }
}

#[async_trait]
impl CassandraInteraction for FakeCassandra {
    async fn get_schema_version(&self) -> Result<String> {
        self.live()?;
        Ok(self.schema_version.clone())
    }

    async fn get_release_version(&self) -> Result<CassandraVersion> {
        Ok(self.release_version)
    }

    async fn get_local_tokens(&self) -> Result<Vec<String>> {
        self.live()?;
        Ok(self.tokens.clone())
    }

    async fn get_operation_mode(&self) -> Result<String> {
        Ok(self.mode.clone())
    }

    async fn get_failure_detector_down_count(&self) -> Result<usize> {
        Ok(self.down)
    }

    async fn get_topology_changes(&self) -> Result<TopologyChanges> {
        Ok(self.topology.clone())
    }

    async fn get_cluster_schema_versions(&self) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self.cluster_schema_versions.clone())
    }

    /// Moves live SSTables into `snapshots/truncated-<millis>-<table>`, as auto_snapshot does.
    async fn truncate_table(&self, keyspace: &str, table: &str) -> Result<()> {
        self.record(format!("truncate {}.{}", keyspace, table));
        let dir = self.check(keyspace, table)?;
        let snapshot = dir.join("snapshots").join(format!(
            "truncated-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            table
        ));
        std::fs::create_dir_all(&snapshot)?;
        for file in files_in(&dir)? {
            if let Some(name) = file.file_name() {
                std::fs::rename(&file, snapshot.join(name))?;
            }
        }
        Ok(())
    }

    async fn import_sstables(&self, keyspace: &str, table: &str, directory: &Path) -> Result<()> {
        self.record(format!("import {}.{}", keyspace, table));
        let dir = self.check(keyspace, table)?;
        for file in files_in(directory)? {
            let Some(name) = file.file_name() else { continue };
            let target = dir.join(name);
            if target.exists() {
                return Err(BackupError::Cassandra(format!("{} already exists", target.display())));
            }
            std::fs::rename(&file, target)?;
        }
        Ok(())
    }

    async fn refresh_table(&self, keyspace: &str, table: &str) -> Result<()> {
        self.record(format!("refresh {}.{}", keyspace, table));
        self.check(keyspace, table).map(|_| ())
    }

    async fn take_snapshot(&self, entities: &DatabaseEntities, tag: &str) -> Result<()> {
        self.live()?;
        self.record(format!("snapshot {}", tag));
        let data = CassandraData::parse(&self.data_dir)?;
        for kt in data.get_database_entities(true).filter(entities, true, false).tables() {
            let Some(dir) = data.table_path(&kt) else { continue };
            let snapshot = dir.join("snapshots").join(tag);
            std::fs::create_dir_all(&snapshot)?;
            for file in files_in(dir)? {
                if let Some(name) = file.file_name() {
                    std::fs::hard_link(&file, snapshot.join(name))?;
                }
            }
            std::fs::write(
                snapshot.join("schema.cql"),
                format!("CREATE TABLE {}.{} (id int PRIMARY KEY);", kt.keyspace, kt.table),
            )?;
            std::fs::write(snapshot.join("manifest.json"), "{\"files\":[]}")?;
        }
        Ok(())
    }

    async fn clear_snapshot(&self, tag: &str) -> Result<()> {
        self.record(format!("clearsnapshot {}", tag));
        let data = CassandraData::parse(&self.data_dir)?;
        for kt in data.get_database_entities(true).tables() {
            if let Some(dir) = data.table_path(&kt) {
                let snapshot = dir.join("snapshots").join(tag);
                if snapshot.is_dir() {
                    std::fs::remove_dir_all(snapshot)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash_file;

    #[tokio::test]
    async fn test_fake_truncate_and_import() {
        let dir = tempfile::TempDir::new().unwrap();
        let table = create_table(dir.path(), "ks", "t");
        insert_rows(&table, 1, 2);
        assert_eq!(count_rows(&table), 2);
        assert_eq!(hash_file(&table.join("nb-1-big-Data.db")).unwrap().len(), 64);

        let fake = FakeCassandra::new(dir.path());
        fake.truncate_table("ks", "t").await.unwrap();
        assert_eq!(count_rows(&table), 0);

        let staged = dir.path().join("staged");
        std::fs::create_dir_all(&staged).unwrap();
        insert_rows(&staged, 7, 3);
        fake.import_sstables("ks", "t", &staged).await.unwrap();
        assert_eq!(count_rows(&table), 3);
        assert_eq!(fake.calls(), vec!["truncate ks.t".to_string(), "import ks.t".to_string()]);
    }
}
