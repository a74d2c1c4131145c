//! sstable-backup - command line entry point.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use sstable_backup::backup::catalog::{list_backups, remove_backups, BackupSelector};
use sstable_backup::backup::commitlog::{
    backup_commitlogs, restore_commitlogs, CommitLogBackupRequest, CommitLogRestoreRequest,
};
use sstable_backup::backup::{backup, BackupRequest};
use sstable_backup::cassandra::{CassandraInteraction, NodetoolInteraction};
use sstable_backup::daemon::ShutdownCoordinator;
use sstable_backup::entities::{DatabaseEntities, RenamedEntities};
use sstable_backup::lock::GlobalLock;
use sstable_backup::restore::strategy::restore;
use sstable_backup::restore::{
    RestorationContext, RestorationPhaseType, RestorationStrategyType, RestoreRequest, StorageSettings,
};
use sstable_backup::storage::{open_backuper, open_restorer};
use sstable_backup::transfer::{DownloadTracker, UploadTracker};
use sstable_backup::{utils, Config};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct StorageArgs {
    /// `<provider>://<bucket>/<cluster>/<dc>/<node>` (overrides config)
    #[arg(long)]
    storage_location: Option<String>,

    /// Parallel transfers (overrides config)
    #[arg(long)]
    concurrent_connections: Option<usize>,

    #[arg(long)]
    create_missing_bucket: bool,

    #[arg(long)]
    skip_bucket_verification: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot the node and upload the snapshot
    Backup {
        #[command(flatten)]
        storage: StorageArgs,

        #[arg(long, short = 's')]
        snapshot_tag: String,

        /// Comma separated keyspaces or keyspace.table names, all when empty
        #[arg(long, default_value = "")]
        entities: String,
    },

    /// Restore a snapshot, one phase per call for HARDLINKS and IMPORT
    Restore {
        #[command(flatten)]
        storage: StorageArgs,

        #[arg(long, short = 's')]
        snapshot_tag: String,

        #[arg(long, default_value = "")]
        entities: String,

        /// Comma separated `ks.from=ks.to` renames
        #[arg(long, default_value = "")]
        rename: String,

        #[arg(long, default_value = "HARDLINKS")]
        strategy: RestorationStrategyType,

        #[arg(long, default_value = "INIT")]
        phase: RestorationPhaseType,

        #[arg(long)]
        download_dir: Option<PathBuf>,

        #[arg(long)]
        no_download_data: bool,

        #[arg(long)]
        no_delete_truncates: bool,

        #[arg(long)]
        no_delete_downloads: bool,

        #[arg(long)]
        update_cassandra_yaml: bool,

        #[arg(long)]
        new_cluster: bool,

        #[arg(long)]
        restore_system_keyspace: bool,

        #[arg(long)]
        exact_schema_version: bool,
    },

    /// Upload commit log segments
    CommitlogBackup {
        #[command(flatten)]
        storage: StorageArgs,

        /// Defaults to `<cassandra_dir>/commitlog`
        #[arg(long)]
        commitlog_dir: Option<PathBuf>,
    },

    /// Download commit log segments and configure their replay
    CommitlogRestore {
        #[command(flatten)]
        storage: StorageArgs,

        #[arg(long)]
        restore_dir: PathBuf,

        /// RFC 3339 lower bound of segment creation time
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// RFC 3339 upper bound of segment creation time
        #[arg(long)]
        to: Option<DateTime<Utc>>,

        /// RFC 3339 instant replay stops at
        #[arg(long)]
        point_in_time: Option<DateTime<Utc>>,
    },

    /// List the backups of this node
    List {
        #[command(flatten)]
        storage: StorageArgs,
    },

    /// Remove backups and the data only they reference
    RemoveBackup {
        #[command(flatten)]
        storage: StorageArgs,

        /// Snapshot tags or manifest names
        #[arg(long, value_delimiter = ',', required_unless_present = "older_than")]
        names: Vec<String>,

        /// Remove every backup taken before this RFC 3339 instant
        #[arg(long, conflicts_with = "names")]
        older_than: Option<DateTime<Utc>>,
    },
}

fn storage_settings(config: &Config, args: &StorageArgs) -> Result<StorageSettings> {
    let mut settings = config.storage_settings(args.storage_location.as_deref())?;
    if let Some(n) = args.concurrent_connections {
        settings.concurrent_connections = n;
    }
    settings.create_missing_bucket |= args.create_missing_bucket;
    settings.skip_bucket_verification |= args.skip_bucket_verification;
    Ok(settings)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting sstable-backup v{} (node: {})",
        env!("CARGO_PKG_VERSION"),
        config.node.id
    );

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.spawn_signal_listener();
    let result = execute(cli.command, &config, &shutdown).await;
    listener.abort();

    if shutdown.is_shutting_down() {
        tracing::warn!("Interrupted by signal");
    }
    result
}

async fn execute(command: Command, config: &Config, shutdown: &ShutdownCoordinator) -> Result<()> {
    let cassandra_config = &config.cassandra;
    let upload_tracker =
        || UploadTracker::new(shutdown.token()).with_poll_interval(config.poll_interval());
    let download_tracker =
        || DownloadTracker::new(shutdown.token()).with_poll_interval(config.poll_interval());

    match command {
        Command::Backup {
            storage,
            snapshot_tag,
            entities,
        } => {
            let request = BackupRequest {
                storage: storage_settings(config, &storage)?,
                cassandra_dir: cassandra_config.cassandra_dir.clone(),
                snapshot_tag,
                entities: DatabaseEntities::parse(&entities)?,
                lock_file: config.lock.file.clone(),
            };
            let backuper = open_backuper(&request.storage.location)?;
            let cassandra = NodetoolInteraction::new(cassandra_config.clone());
            let outcome = backup(&request, backuper, &cassandra, &upload_tracker()).await?;
            tracing::info!(
                manifest = %outcome.manifest_key,
                files = outcome.files,
                bytes = outcome.bytes,
                "Backup complete"
            );
        }

        Command::Restore {
            storage,
            snapshot_tag,
            entities,
            rename,
            strategy,
            phase,
            download_dir,
            no_download_data,
            no_delete_truncates,
            no_delete_downloads,
            update_cassandra_yaml,
            new_cluster,
            restore_system_keyspace,
            exact_schema_version,
        } => {
            let mut request = RestoreRequest::new(
                storage_settings(config, &storage)?,
                cassandra_config.cassandra_dir.clone(),
                snapshot_tag,
            );
            request.cassandra_config_dir = cassandra_config.config_dir();
            if let Some(dir) = download_dir {
                request.download_dir = dir;
            }
            request.entities = DatabaseEntities::parse(&entities)?;
            request.renamed = RenamedEntities::parse(&rename)?;
            request.strategy = strategy;
            request.phase = phase;
            request.no_download_data = no_download_data;
            request.no_delete_truncates = no_delete_truncates;
            request.no_delete_downloads = no_delete_downloads;
            request.update_cassandra_yaml = update_cassandra_yaml;
            request.new_cluster = new_cluster;
            request.restore_system_keyspace = restore_system_keyspace;
            request.exact_schema_version = exact_schema_version;
            request.lock_file = config.lock.file.clone();

            let restorer = open_restorer(&request.storage.location)?;
            let cassandra: Arc<dyn CassandraInteraction> =
                Arc::new(NodetoolInteraction::new(cassandra_config.clone()));
            let ctx = RestorationContext::new(request, restorer, cassandra, Arc::new(download_tracker()));
            restore(&ctx).await?;
            tracing::info!("Restore complete");
        }

        Command::CommitlogBackup {
            storage,
            commitlog_dir,
        } => {
            let request = CommitLogBackupRequest {
                storage: storage_settings(config, &storage)?,
                commitlog_dir: commitlog_dir.unwrap_or_else(|| cassandra_config.commitlog_dir()),
                lock_file: config.lock.file.clone(),
            };
            let backuper = open_backuper(&request.storage.location)?;
            let segments = backup_commitlogs(&request, backuper, &upload_tracker()).await?;
            tracing::info!(segments, "Commit log backup complete");
        }

        Command::CommitlogRestore {
            storage,
            restore_dir,
            from,
            to,
            point_in_time,
        } => {
            let request = CommitLogRestoreRequest {
                storage: storage_settings(config, &storage)?,
                restore_dir,
                cassandra_config_dir: cassandra_config.config_dir(),
                from,
                to,
                point_in_time,
            };
            let restorer = open_restorer(&request.storage.location)?;
            let segments = restore_commitlogs(&request, restorer, &download_tracker()).await?;
            tracing::info!(segments, "Commit log restore complete");
        }

        Command::List { storage } => {
            let settings = storage_settings(config, &storage)?;
            let restorer = open_restorer(&settings.location)?;
            for listing in list_backups(restorer.as_ref()).await? {
                println!(
                    "{}\t{}\t{}\t{} files\t{} bytes",
                    listing.timestamp.to_rfc3339(),
                    listing.snapshot_tag,
                    listing.schema_version.as_deref().unwrap_or("-"),
                    listing.files,
                    listing.size
                );
            }
        }

        Command::RemoveBackup {
            storage,
            names,
            older_than,
        } => {
            let settings = storage_settings(config, &storage)?;
            let selector = match older_than {
                Some(cutoff) => BackupSelector::OlderThan(cutoff),
                None => BackupSelector::Names(names),
            };
            let _lock = GlobalLock::acquire(&config.lock.file)?;
            let restorer = open_restorer(&settings.location)?;
            let outcome = remove_backups(restorer.as_ref(), &selector).await?;
            tracing::info!(
                manifests = outcome.manifests.len(),
                data_objects = outcome.data_objects,
                "Backups removed"
            );
        }
    }
    Ok(())
}
