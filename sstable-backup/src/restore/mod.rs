//! Restoration of a backed up snapshot onto a node.
//!
//! Hardlink and import restores are phase sequenced: an external
//! coordinator invokes one [`RestorationPhaseType`] per call on every node
//! of the cluster. In-place restore of a stopped node is a single call.

pub mod in_place;
pub mod phase;
pub mod strategy;
pub mod verification;

pub use phase::{RestorationContext, RestorationPhase};
pub use strategy::{resolve_strategy, RestorationStrategy};

use crate::entities::{DatabaseEntities, RenamedEntities};
use crate::storage::{RetrySpec, StorageLocation};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestorationPhaseType {
    Init,
    ClusterHealthcheck,
    Download,
    Truncate,
    Import,
    Cleanup,
    Unknown,
}

impl RestorationPhaseType {
    pub const ALL: [RestorationPhaseType; 6] = [
        RestorationPhaseType::Init,
        RestorationPhaseType::ClusterHealthcheck,
        RestorationPhaseType::Download,
        RestorationPhaseType::Truncate,
        RestorationPhaseType::Import,
        RestorationPhaseType::Cleanup,
    ];

    /// Phases that touch data and need a healthy cluster first.
    pub fn requires_healthy_cluster(self) -> bool {
        match self {
            RestorationPhaseType::Download
            | RestorationPhaseType::Truncate
            | RestorationPhaseType::Import => true,
            RestorationPhaseType::Init
            | RestorationPhaseType::ClusterHealthcheck
            | RestorationPhaseType::Cleanup
            | RestorationPhaseType::Unknown => false,
        }
    }
}

impl fmt::Display for RestorationPhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestorationPhaseType::Init => "INIT",
            RestorationPhaseType::ClusterHealthcheck => "CLUSTER_HEALTHCHECK",
            RestorationPhaseType::Download => "DOWNLOAD",
            RestorationPhaseType::Truncate => "TRUNCATE",
            RestorationPhaseType::Import => "IMPORT",
            RestorationPhaseType::Cleanup => "CLEANUP",
            RestorationPhaseType::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl FromStr for RestorationPhaseType {
    type Err = BackupError;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .chain([RestorationPhaseType::Unknown])
            .find(|p| p.to_string() == normalized)
            .ok_or_else(|| BackupError::Validation(format!("unknown restoration phase '{}'", value)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestorationStrategyType {
    InPlace,
    Hardlinks,
    Import,
    Unknown,
}

impl fmt::Display for RestorationStrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestorationStrategyType::InPlace => "IN_PLACE",
            RestorationStrategyType::Hardlinks => "HARDLINKS",
            RestorationStrategyType::Import => "IMPORT",
            RestorationStrategyType::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl FromStr for RestorationStrategyType {
    type Err = BackupError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "IN_PLACE" => Ok(RestorationStrategyType::InPlace),
            "HARDLINKS" => Ok(RestorationStrategyType::Hardlinks),
            "IMPORT" => Ok(RestorationStrategyType::Import),
            "UNKNOWN" => Ok(RestorationStrategyType::Unknown),
            _ => Err(BackupError::Validation(format!(
                "unknown restoration strategy '{}'",
                value
            ))),
        }
    }
}

/// Storage settings shared by every backup and restore request.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub location: StorageLocation,
    pub concurrent_connections: usize,
    pub retry: RetrySpec,
    pub skip_bucket_verification: bool,
    pub create_missing_bucket: bool,
}

impl StorageSettings {
    pub const DEFAULT_CONCURRENT_CONNECTIONS: usize = 10;

    pub fn new(location: StorageLocation) -> Self {
        Self {
            location,
            concurrent_connections: Self::DEFAULT_CONCURRENT_CONNECTIONS,
            retry: RetrySpec::default(),
            skip_bucket_verification: false,
            create_missing_bucket: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrent_connections == 0 {
            return Err(BackupError::Validation(
                "concurrent connections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub storage: StorageSettings,
    /// Cassandra home, holding `data/`, `hints/`, `saved_caches/` and `commitlog/`.
    pub cassandra_dir: PathBuf,
    /// Directory of `cassandra.yaml`.
    pub cassandra_config_dir: PathBuf,
    /// Staging directory for downloaded SSTables.
    pub download_dir: PathBuf,
    pub snapshot_tag: String,
    pub entities: DatabaseEntities,
    pub renamed: RenamedEntities,
    pub strategy: RestorationStrategyType,
    pub phase: RestorationPhaseType,
    pub no_download_data: bool,
    pub no_delete_truncates: bool,
    pub no_delete_downloads: bool,
    pub update_cassandra_yaml: bool,
    pub new_cluster: bool,
    pub restore_system_keyspace: bool,
    /// Only consider manifests taken with the node's current schema version.
    pub exact_schema_version: bool,
    pub lock_file: PathBuf,
}

impl RestoreRequest {
    pub fn new(storage: StorageSettings, cassandra_dir: impl Into<PathBuf>, snapshot_tag: impl Into<String>) -> Self {
        let cassandra_dir = cassandra_dir.into();
        Self {
            storage,
            cassandra_config_dir: cassandra_dir.join("conf"),
            download_dir: cassandra_dir.join("downloaded-sstables"),
            lock_file: std::env::temp_dir().join("sstable-backup.lock"),
            cassandra_dir,
            snapshot_tag: snapshot_tag.into(),
            entities: DatabaseEntities::empty(),
            renamed: RenamedEntities::empty(),
            strategy: RestorationStrategyType::Hardlinks,
            phase: RestorationPhaseType::Init,
            no_download_data: false,
            no_delete_truncates: false,
            no_delete_downloads: false,
            update_cassandra_yaml: false,
            new_cluster: false,
            restore_system_keyspace: false,
            exact_schema_version: false,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.cassandra_dir.join("data")
    }

    /// Reject malformed requests before any I/O.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        if self.snapshot_tag.trim().is_empty() {
            return Err(BackupError::Validation("snapshot tag is empty".into()));
        }
        self.entities.validate()?;
        self.renamed.validate()?;

        match self.strategy {
            RestorationStrategyType::Unknown => {
                return Err(BackupError::Validation(
                    "restoration strategy must be one of IN_PLACE, HARDLINKS, IMPORT".into(),
                ));
            }
            RestorationStrategyType::Hardlinks | RestorationStrategyType::Import => {
                if self.phase == RestorationPhaseType::Unknown {
                    return Err(BackupError::Validation(format!(
                        "restoration phase must be set for strategy {}",
                        self.strategy
                    )));
                }
            }
            RestorationStrategyType::InPlace => {}
        }

        if !self.renamed.is_empty() {
            if self.entities.is_empty() {
                return Err(BackupError::Validation(
                    "renamed entities require an explicit list of tables to restore".into(),
                ));
            }
            if self.entities.keyspaces_only() {
                return Err(BackupError::Validation(
                    "renamed entities can not be combined with whole keyspaces".into(),
                ));
            }
        }

        if self.download_dir == self.data_dir() {
            return Err(BackupError::Validation(
                "download directory must differ from the data directory".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RestoreRequest {
        let location = StorageLocation::parse("file:///tmp/backups/bucket/c/d/n").unwrap();
        RestoreRequest::new(StorageSettings::new(location), "/var/lib/cassandra", "snap")
    }

    #[test]
    fn test_phase_names_round_trip() {
        for phase in RestorationPhaseType::ALL {
            assert_eq!(phase.to_string().parse::<RestorationPhaseType>().unwrap(), phase);
        }
        assert_eq!(
            "cluster-healthcheck".parse::<RestorationPhaseType>().unwrap(),
            RestorationPhaseType::ClusterHealthcheck
        );
        assert!("rewind".parse::<RestorationPhaseType>().is_err());
        assert_eq!("in_place".parse::<RestorationStrategyType>().unwrap(), RestorationStrategyType::InPlace);
    }

    #[test]
    fn test_valid_request() {
        let mut req = request();
        req.entities = DatabaseEntities::parse("ks.a,ks.b").unwrap();
        req.renamed = RenamedEntities::parse("ks.a=ks.c").unwrap();
        req.validate().unwrap();
    }

    #[test]
    fn test_rename_without_entities_is_rejected() {
        let mut req = request();
        req.renamed = RenamedEntities::parse("ks.a=ks.c").unwrap();
        assert!(matches!(req.validate(), Err(BackupError::Validation(_))));
    }

    #[test]
    fn test_rename_with_keyspaces_is_rejected() {
        let mut req = request();
        req.entities = DatabaseEntities::parse("ks").unwrap();
        req.renamed = RenamedEntities::parse("ks.a=ks.c").unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_unknown_strategy_and_phase() {
        let mut req = request();
        req.strategy = RestorationStrategyType::Unknown;
        assert!(req.validate().is_err());

        req.strategy = RestorationStrategyType::Import;
        req.phase = RestorationPhaseType::Unknown;
        assert!(req.validate().is_err());

        req.strategy = RestorationStrategyType::InPlace;
        req.validate().unwrap();
    }

    #[test]
    fn test_download_dir_must_not_be_data_dir() {
        let mut req = request();
        req.download_dir = req.data_dir();
        assert!(req.validate().is_err());
    }
}
