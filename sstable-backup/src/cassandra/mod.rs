//! Narrow interface to the running Cassandra node.
//!
//! Every call is synchronous from the caller's point of view and may fail;
//! callers decide whether a failure is fatal.

pub mod nodetool;

pub use nodetool::NodetoolInteraction;

use crate::entities::DatabaseEntities;
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Operation mode of a node that serves requests.
pub const NORMAL_MODE: &str = "NORMAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CassandraVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl CassandraVersion {
    /// Parse `4.0.1`, `3.11` or `4.1-beta1`.
    pub fn parse(value: &str) -> Result<Self> {
        let core = value.trim().split(['-', ' ']).next().unwrap_or_default();
        let mut parts = core.split('.').map(|p| p.parse::<u32>());
        let invalid = || BackupError::Cassandra(format!("unparseable Cassandra version '{}'", value));
        let major = parts.next().ok_or_else(invalid)?.map_err(|_| invalid())?;
        let minor = parts.next().unwrap_or(Ok(0)).map_err(|_| invalid())?;
        let patch = parts.next().unwrap_or(Ok(0)).map_err(|_| invalid())?;
        Ok(Self { major, minor, patch })
    }

    /// Native SSTable import (`nodetool import`) exists since 4.0.
    pub fn supports_import(&self) -> bool {
        self.major >= 4
    }
}

impl fmt::Display for CassandraVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Endpoints currently changing the ring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyChanges {
    pub joining: Vec<String>,
    pub leaving: Vec<String>,
    pub moving: Vec<String>,
}

impl TopologyChanges {
    pub fn is_empty(&self) -> bool {
        self.joining.is_empty() && self.leaving.is_empty() && self.moving.is_empty()
    }
}

#[async_trait]
pub trait CassandraInteraction: Send + Sync {
    async fn get_schema_version(&self) -> Result<String>;

    async fn get_release_version(&self) -> Result<CassandraVersion>;

    async fn get_local_tokens(&self) -> Result<Vec<String>>;

    /// `NORMAL`, `JOINING`, `LEAVING`, `DECOMMISSIONED`, ...
    async fn get_operation_mode(&self) -> Result<String>;

    async fn get_failure_detector_down_count(&self) -> Result<usize>;

    async fn get_topology_changes(&self) -> Result<TopologyChanges>;

    /// Schema version → endpoints reporting it.
    async fn get_cluster_schema_versions(&self) -> Result<BTreeMap<String, Vec<String>>>;

    async fn truncate_table(&self, keyspace: &str, table: &str) -> Result<()>;

    /// Load the SSTables found in `directory` into the table.
    async fn import_sstables(&self, keyspace: &str, table: &str, directory: &Path) -> Result<()>;

    /// Pick up SSTables placed in the live table directory.
    async fn refresh_table(&self, keyspace: &str, table: &str) -> Result<()>;

    async fn take_snapshot(&self, entities: &DatabaseEntities, tag: &str) -> Result<()>;

    async fn clear_snapshot(&self, tag: &str) -> Result<()>;
}
