//! Cluster-aware backup and restore of Cassandra SSTables, commit logs and schema.
//!
//! A backup snapshots the node, uploads the snapshot files through the
//! transfer tracker and publishes a manifest. Restores are driven by a
//! strategy: in-place for a stopped node, or phase by phase (hardlinks or
//! native import) on a running cluster.

pub mod backup;
pub mod cassandra;
pub mod config;
pub mod daemon;
pub mod entities;
pub mod fs;
pub mod hashing;
pub mod lock;
pub mod manifest;
pub mod restore;
pub mod storage;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use utils::errors::{BackupError, Result};
