//! Strategy selection and the phased strategies.

use super::in_place::InPlaceRestorationStrategy;
use super::phase::{RestorationContext, RestorationPhase};
use super::{RestorationStrategyType, RestoreRequest};
use crate::cassandra::CassandraInteraction;
use crate::lock::GlobalLock;
use crate::{BackupError, Result};
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait RestorationStrategy: Send + Sync {
    fn strategy_type(&self) -> RestorationStrategyType;

    async fn restore(&self, ctx: &RestorationContext) -> Result<()>;
}

/// Hardlinks and import restores: one phase per invocation, under the global lock.
#[derive(Debug)]
pub struct PhasedRestorationStrategy {
    strategy_type: RestorationStrategyType,
}

impl PhasedRestorationStrategy {
    pub fn new(strategy_type: RestorationStrategyType) -> Self {
        Self { strategy_type }
    }
}

#[async_trait]
impl RestorationStrategy for PhasedRestorationStrategy {
    fn strategy_type(&self) -> RestorationStrategyType {
        self.strategy_type
    }

    async fn restore(&self, ctx: &RestorationContext) -> Result<()> {
        let _lock = GlobalLock::acquire(&ctx.request.lock_file)?;
        let phase = RestorationPhase::resolve(self.strategy_type, ctx.request.phase)?;

        if phase.phase_type().requires_healthy_cluster() {
            RestorationPhase::ClusterHealthcheck.execute(ctx).await?;
        }
        phase.execute(ctx).await
    }
}

/// Pick the strategy the request asks for among those this node supports.
///
/// IMPORT needs a Cassandra release with native import. IN_PLACE needs the
/// node to be down, which shows as an unreachable schema version.
pub async fn resolve_strategy(
    request: &RestoreRequest,
    cassandra: &dyn CassandraInteraction,
) -> Result<Box<dyn RestorationStrategy>> {
    let mut available = vec![
        RestorationStrategyType::InPlace,
        RestorationStrategyType::Hardlinks,
    ];
    if request.strategy == RestorationStrategyType::Import {
        let version = cassandra.get_release_version().await?;
        if version.supports_import() {
            available.push(RestorationStrategyType::Import);
        } else {
            info!(%version, "Cassandra release has no native import");
        }
    }

    if !available.contains(&request.strategy) {
        let names: Vec<String> = available.iter().map(ToString::to_string).collect();
        return Err(BackupError::Strategy(format!(
            "no restoration strategy for {}, available: {}",
            request.strategy,
            names.join(", ")
        )));
    }

    match request.strategy {
        RestorationStrategyType::InPlace => {
            if cassandra.get_schema_version().await.is_ok() {
                return Err(BackupError::Strategy(
                    "IN_PLACE restore requires Cassandra to be stopped".into(),
                ));
            }
            Ok(Box::new(InPlaceRestorationStrategy))
        }
        RestorationStrategyType::Hardlinks | RestorationStrategyType::Import => {
            Ok(Box::new(PhasedRestorationStrategy::new(request.strategy)))
        }
        RestorationStrategyType::Unknown => Err(BackupError::Strategy(
            "restoration strategy is UNKNOWN".into(),
        )),
    }
}

/// Validate the request, resolve its strategy and run it.
pub async fn restore(ctx: &RestorationContext) -> Result<()> {
    ctx.request.validate()?;
    let strategy = resolve_strategy(&ctx.request, ctx.cassandra.as_ref()).await?;
    info!(
        strategy = %strategy.strategy_type(),
        phase = %ctx.request.phase,
        snapshot_tag = %ctx.request.snapshot_tag,
        "Restoring snapshot"
    );
    strategy.restore(ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{backup, BackupRequest};
    use crate::cassandra::CassandraVersion;
    use crate::entities::{DatabaseEntities, RenamedEntities};
    use crate::restore::{RestorationPhaseType, StorageSettings};
    use crate::storage::{LocalFileStorage, StorageBucket};
    use crate::testing::{count_rows, create_table, insert_rows, local_storage, FakeCassandra};
    use crate::transfer::{DownloadTracker, UploadTracker};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn storage_settings(storage: &LocalFileStorage) -> StorageSettings {
        let mut settings = StorageSettings::new(storage.storage_location().clone());
        settings.create_missing_bucket = true;
        settings
    }

    fn restore_request(root: &Path, strategy: RestorationStrategyType) -> RestoreRequest {
        let storage = local_storage(root);
        let mut request = RestoreRequest::new(storage_settings(&storage), root.join("cassandra"), "snap");
        request.strategy = strategy;
        request.lock_file = root.join("sstable-backup.lock");
        request.entities = DatabaseEntities::parse("test.t1").unwrap();
        request
    }

    fn context(root: &Path, request: RestoreRequest, fake: FakeCassandra) -> RestorationContext {
        RestorationContext::new(
            request,
            Arc::new(local_storage(root)),
            Arc::new(fake),
            Arc::new(DownloadTracker::new(CancellationToken::new()).with_poll_interval(Duration::from_millis(10))),
        )
    }

    async fn back_up(root: &Path, fake: &FakeCassandra, snapshot_tag: &str) {
        let storage = local_storage(root);
        let request = BackupRequest {
            storage: storage_settings(&storage),
            cassandra_dir: root.join("cassandra"),
            snapshot_tag: snapshot_tag.into(),
            entities: DatabaseEntities::parse("test").unwrap(),
            lock_file: root.join("sstable-backup.lock"),
        };
        let tracker = UploadTracker::new(CancellationToken::new()).with_poll_interval(Duration::from_millis(10));
        backup(&request, Arc::new(storage), fake, &tracker).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_strategy() {
        let dir = TempDir::new().unwrap();
        let mut fake = FakeCassandra::new(&dir.path().join("cassandra/data"));

        let hardlinks = restore_request(dir.path(), RestorationStrategyType::Hardlinks);
        let strategy = resolve_strategy(&hardlinks, &fake).await.unwrap();
        assert_eq!(strategy.strategy_type(), RestorationStrategyType::Hardlinks);

        let import = restore_request(dir.path(), RestorationStrategyType::Import);
        assert_eq!(
            resolve_strategy(&import, &fake).await.unwrap().strategy_type(),
            RestorationStrategyType::Import
        );

        let in_place = restore_request(dir.path(), RestorationStrategyType::InPlace);
        assert!(matches!(
            resolve_strategy(&in_place, &fake).await,
            Err(BackupError::Strategy(_))
        ));

        fake.release_version = CassandraVersion { major: 3, minor: 11, patch: 4 };
        let err = resolve_strategy(&import, &fake).await.err().unwrap();
        assert!(err.to_string().contains("available: IN_PLACE, HARDLINKS"));

        fake.running = false;
        assert_eq!(
            resolve_strategy(&in_place, &fake).await.unwrap().strategy_type(),
            RestorationStrategyType::InPlace
        );
    }

    #[tokio::test]
    async fn test_import_restore_brings_back_backed_up_rows() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("cassandra/data");
        let table = create_table(&data, "test", "t1");
        insert_rows(&table, 1, 2);

        back_up(dir.path(), &FakeCassandra::new(&data), "snap").await;
        insert_rows(&table, 2, 3);
        assert_eq!(count_rows(&table), 5);

        let fake = FakeCassandra::new(&data);
        let mut ctx = context(
            dir.path(),
            restore_request(dir.path(), RestorationStrategyType::Import),
            fake,
        );
        for phase in [
            RestorationPhaseType::Download,
            RestorationPhaseType::Truncate,
            RestorationPhaseType::Import,
            RestorationPhaseType::Cleanup,
        ] {
            ctx.request.phase = phase;
            restore(&ctx).await.unwrap();
        }

        assert_eq!(count_rows(&table), 2);
        assert!(!ctx.request.download_dir.exists());
        assert!(!table.join("snapshots").read_dir().unwrap().any(|e| e
            .unwrap()
            .file_name()
            .to_string_lossy()
            .starts_with("truncated-")));
    }

    #[tokio::test]
    async fn test_restore_of_reused_sstable_name_gets_latest_content() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("cassandra/data");
        let table = create_table(&data, "test", "t1");
        insert_rows(&table, 1, 2);
        back_up(dir.path(), &FakeCassandra::new(&data), "first").await;

        // Same generation, new content of the same size.
        insert_rows(&table, 1, 7);
        back_up(dir.path(), &FakeCassandra::new(&data), "second").await;

        let mut request = restore_request(dir.path(), RestorationStrategyType::Import);
        request.snapshot_tag = "second".into();
        let mut ctx = context(dir.path(), request, FakeCassandra::new(&data));
        for phase in [
            RestorationPhaseType::Download,
            RestorationPhaseType::Truncate,
            RestorationPhaseType::Import,
        ] {
            ctx.request.phase = phase;
            restore(&ctx).await.unwrap();
        }
        assert_eq!(count_rows(&table), 7);
    }

    #[tokio::test]
    async fn test_hardlink_restore_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("cassandra/data");
        let table = create_table(&data, "test", "t1");
        insert_rows(&table, 1, 4);
        back_up(dir.path(), &FakeCassandra::new(&data), "snap").await;

        let mut ctx = context(
            dir.path(),
            restore_request(dir.path(), RestorationStrategyType::Hardlinks),
            FakeCassandra::new(&data),
        );
        for phase in [
            RestorationPhaseType::Init,
            RestorationPhaseType::Download,
            RestorationPhaseType::Download,
            RestorationPhaseType::Truncate,
            RestorationPhaseType::Import,
            RestorationPhaseType::Import,
            RestorationPhaseType::Cleanup,
            RestorationPhaseType::Cleanup,
        ] {
            ctx.request.phase = phase;
            restore(&ctx).await.unwrap();
        }
        assert_eq!(count_rows(&table), 4);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_any_phase() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("cassandra/data");
        let table = create_table(&data, "test", "t1");
        insert_rows(&table, 1, 1);

        let mut request = restore_request(dir.path(), RestorationStrategyType::Hardlinks);
        request.entities = DatabaseEntities::empty();
        request.renamed = RenamedEntities::parse("test.t1=test.t2").unwrap();
        request.phase = RestorationPhaseType::Truncate;
        let ctx = context(dir.path(), request, FakeCassandra::new(&data));

        assert!(matches!(restore(&ctx).await, Err(BackupError::Validation(_))));
        assert_eq!(count_rows(&table), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_cluster_aborts_before_data_phase() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("cassandra/data");
        let table = create_table(&data, "test", "t1");
        insert_rows(&table, 1, 1);

        let mut fake = FakeCassandra::new(&data);
        fake.down = 2;
        let mut request = restore_request(dir.path(), RestorationStrategyType::Hardlinks);
        request.phase = RestorationPhaseType::Truncate;
        let ctx = context(dir.path(), request, fake);

        let err = restore(&ctx).await.unwrap_err();
        assert_eq!(err.phase(), Some(RestorationPhaseType::ClusterHealthcheck));
        assert_eq!(count_rows(&table), 1);
    }

    #[tokio::test]
    async fn test_in_place_restore_of_stopped_node() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("cassandra/data");
        let table = create_table(&data, "test", "t1");
        insert_rows(&table, 1, 2);
        back_up(dir.path(), &FakeCassandra::new(&data), "snap").await;

        insert_rows(&table, 2, 3);
        std::fs::remove_file(table.join("nb-1-big-Index.db")).unwrap();
        let hints = dir.path().join("cassandra/hints");
        std::fs::create_dir_all(&hints).unwrap();
        std::fs::write(hints.join("stale.hints"), "x").unwrap();
        let conf = dir.path().join("cassandra/conf");
        std::fs::create_dir_all(&conf).unwrap();
        std::fs::write(conf.join("cassandra.yaml"), "num_tokens: 2\n").unwrap();

        let mut fake = FakeCassandra::new(&data);
        fake.running = false;
        let mut request = restore_request(dir.path(), RestorationStrategyType::InPlace);
        request.update_cassandra_yaml = true;
        let ctx = context(dir.path(), request, fake);
        restore(&ctx).await.unwrap();

        assert_eq!(count_rows(&table), 2);
        assert!(table.join("nb-1-big-Index.db").is_file());
        assert!(!table.join("nb-2-big-Index.db").exists());
        assert_eq!(std::fs::read_dir(&hints).unwrap().count(), 0);
        let yaml = std::fs::read_to_string(conf.join("cassandra.yaml")).unwrap();
        assert!(yaml.contains("initial_token: -9223372036854775808,0"));
        assert!(yaml.contains("auto_bootstrap: false"));
    }
}
