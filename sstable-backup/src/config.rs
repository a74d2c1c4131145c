//! Configuration of the backup tool.
//!
//! Loaded from an optional TOML file, then overridden from the environment
//! with `SSTABLE_BACKUP__<SECTION>__<KEY>` variables. Command line flags
//! override both.

use crate::restore::StorageSettings;
use crate::storage::{RetrySpec, StorageLocation};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "SSTABLE_BACKUP";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cassandra: CassandraConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier used in storage locations
    #[serde(default = "default_node_id")]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `<provider>://<bucket>/<cluster>/<dc>/<node>`
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default = "default_concurrent_connections")]
    pub concurrent_connections: usize,

    #[serde(default)]
    pub retry: RetrySpec,

    #[serde(default)]
    pub skip_bucket_verification: bool,

    #[serde(default)]
    pub create_missing_bucket: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CassandraConfig {
    /// Cassandra home holding `data/`, `commitlog/`, `hints/` and `saved_caches/`
    #[serde(default = "default_cassandra_dir")]
    pub cassandra_dir: PathBuf,

    /// Directory of `cassandra.yaml`, `<cassandra_dir>/conf` when unset
    #[serde(default)]
    pub config_dir: Option<PathBuf>,

    #[serde(default = "default_nodetool")]
    pub nodetool: String,

    #[serde(default = "default_cqlsh")]
    pub cqlsh: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_jmx_port")]
    pub jmx_port: u16,

    #[serde(default = "default_cql_port")]
    pub cql_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// How often waiting sessions re-check their units (seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_file")]
    pub file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "cassandra-node".to_string())
}

fn default_concurrent_connections() -> usize {
    StorageSettings::DEFAULT_CONCURRENT_CONNECTIONS
}

fn default_cassandra_dir() -> PathBuf {
    PathBuf::from("/var/lib/cassandra")
}

fn default_nodetool() -> String {
    "nodetool".to_string()
}

fn default_cqlsh() -> String {
    "cqlsh".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_jmx_port() -> u16 {
    7199
}

fn default_cql_port() -> u16 {
    9042
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_lock_file() -> PathBuf {
    std::env::temp_dir().join("sstable-backup.lock")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { id: default_node_id() }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            location: None,
            concurrent_connections: default_concurrent_connections(),
            retry: RetrySpec::default(),
            skip_bucket_verification: false,
            create_missing_bucket: false,
        }
    }
}

impl Default for CassandraConfig {
    fn default() -> Self {
        Self {
            cassandra_dir: default_cassandra_dir(),
            config_dir: None,
            nodetool: default_nodetool(),
            cqlsh: default_cqlsh(),
            host: default_host(),
            jmx_port: default_jmx_port(),
            cql_port: default_cql_port(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { file: default_lock_file() }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    /// Load `path` (when given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BackupError::Config(e.to_string()))
    }

    /// Storage settings for `location`, or the configured location when `None`.
    pub fn storage_settings(&self, location: Option<&str>) -> Result<StorageSettings> {
        let raw = location.or(self.storage.location.as_deref()).ok_or_else(|| {
            BackupError::Config("no storage location given on the command line or in the configuration".into())
        })?;
        let mut settings = StorageSettings::new(StorageLocation::parse(raw)?);
        settings.concurrent_connections = self.storage.concurrent_connections;
        settings.retry = self.storage.retry.clone();
        settings.skip_bucket_verification = self.storage.skip_bucket_verification;
        settings.create_missing_bucket = self.storage.create_missing_bucket;
        Ok(settings)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.transfer.poll_interval_secs.max(1))
    }
}

impl CassandraConfig {
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| self.cassandra_dir.join("conf"))
    }

    pub fn commitlog_dir(&self) -> PathBuf {
        self.cassandra_dir.join("commitlog")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.cassandra.jmx_port, 7199);
        assert_eq!(config.cassandra.config_dir(), PathBuf::from("/var/lib/cassandra/conf"));
        assert_eq!(config.storage.concurrent_connections, 10);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert!(!config.node.id.is_empty());
    }

    #[test]
    fn test_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sstable-backup.toml");
        std::fs::write(
            &path,
            r#"
[storage]
location = "file:///backups/bucket/cluster/dc1/node1"
concurrent_connections = 4

[storage.retry]
max_attempts = 5
strategy = "linear"

[cassandra]
cassandra_dir = "/opt/cassandra"
host = "10.0.0.5"

[log]
level = "debug"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.cassandra.host, "10.0.0.5");
        assert_eq!(config.cassandra.commitlog_dir(), PathBuf::from("/opt/cassandra/commitlog"));
        assert_eq!(config.log.level, "debug");

        let settings = config.storage_settings(None).unwrap();
        assert_eq!(settings.concurrent_connections, 4);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.location.bucket, "bucket");

        let overridden = config
            .storage_settings(Some("file:///other/b2/c/d/n"))
            .unwrap();
        assert_eq!(overridden.location.bucket, "b2");
    }

    #[test]
    fn test_missing_location_and_file() {
        assert!(matches!(
            Config::default().storage_settings(None),
            Err(BackupError::Config(_))
        ));
        assert!(matches!(
            Config::load(Some(Path::new("/nonexistent/sstable-backup.toml"))),
            Err(BackupError::Config(_))
        ));
    }
}
