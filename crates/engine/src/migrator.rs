//! Migrator - Entry point tying discovery, the runners and the run lock together
//!
//! Every mutating operation takes the backend's run lock before it discovers
//! anything and releases it on every exit path. Migrations are rediscovered
//! from disk on each call.

use std::future::Future;
use std::sync::Arc;

use migrator_core::{ConfigError, MigratorConfig};

use crate::backends::{DatabasePoolConfig, MigrationBackend, PostgresBackend};
use crate::definitions::{MigrationConfig, MigrationRunResult, RollbackResult, StatusReport};
use crate::discovery::{discover_migrations, MigrationUnit};
use crate::error::{MigrationError, MigrationResult, RollbackOutcome};
use crate::runner::MigrationRunner;
use crate::scaffold::{create_migration, ScaffoldedMigration};

pub struct Migrator {
    config: MigrationConfig,
    backend: Arc<dyn MigrationBackend>,
    runner: MigrationRunner,
}

impl Migrator {
    pub fn new(config: MigrationConfig, backend: Arc<dyn MigrationBackend>) -> Self {
        let runner = MigrationRunner::new(Arc::clone(&backend));
        Self {
            config,
            backend,
            runner,
        }
    }

    /// Connect to PostgreSQL with a loaded configuration
    pub async fn connect(config: &MigratorConfig) -> MigrationResult<Self> {
        let backend = PostgresBackend::connect(
            &config.database,
            config.table.clone(),
            DatabasePoolConfig::default(),
        )
        .await?;
        Ok(Self::new(MigrationConfig::from(config), Arc::new(backend)))
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn runner(&self) -> &MigrationRunner {
        &self.runner
    }

    /// Discover the migrations on disk
    pub fn discover(&self) -> MigrationResult<Vec<MigrationUnit>> {
        discover_migrations(&self.config.migrations_dir)
    }

    /// Apply all pending migrations, or list them when `dry_run` is set
    pub async fn up(&self, dry_run: bool) -> MigrationResult<MigrationRunResult> {
        self.locked(async {
            let units = self.discover()?;
            let mut result = MigrationRunResult::new(dry_run);
            match self.runner.run_migrations(&units, dry_run, &mut result).await {
                Ok(()) => Ok(result),
                Err(cause) if result.applied_count() > 0 => Err(MigrationError::Interrupted {
                    cause: Box::new(cause),
                    applied: result.applied_migrations,
                    total: result.total_count,
                }),
                Err(cause) => Err(cause),
            }
        })
        .await
    }

    /// Revert up to `steps` migrations of the latest batch
    pub async fn down(&self, steps: usize) -> MigrationResult<RollbackResult> {
        if steps == 0 {
            return Err(ConfigError::invalid_value("steps", "0", "at least 1").into());
        }

        self.locked(async {
            let units = self.discover()?;
            let mut result = RollbackResult::default();
            self.runner
                .rollback_last_batch(&units, steps, &mut result)
                .await?;
            Ok::<_, MigrationError>(result)
        })
        .await
    }

    /// Applied and pending migrations; takes no lock and writes nothing
    pub async fn status(&self) -> MigrationResult<StatusReport> {
        let units = self.discover()?;
        self.runner.status(&units).await
    }

    /// Apply all pending migrations and revert this run's batch if one fails.
    ///
    /// Only the migrations committed by the failed run are reverted, so a run
    /// that failed on its first migration leaves earlier batches untouched.
    pub async fn auto_migrate(&self) -> MigrationResult<MigrationRunResult> {
        self.locked(async {
            let units = self.discover()?;
            let mut result = MigrationRunResult::new(false);

            let cause = match self.runner.run_migrations(&units, false, &mut result).await {
                Ok(()) => return Ok(result),
                Err(cause) => cause,
            };

            let committed = result.applied_count();
            let rollback = if committed == 0 {
                RollbackOutcome::NothingCommitted
            } else {
                tracing::warn!(
                    batch = result.batch,
                    committed,
                    "rolling back migrations committed before the failure"
                );
                let mut reverted = RollbackResult::default();
                match self
                    .runner
                    .rollback_last_batch(&units, committed, &mut reverted)
                    .await
                {
                    Ok(()) => RollbackOutcome::RolledBack {
                        count: reverted.rolled_back_count(),
                        batch: reverted.batch,
                    },
                    Err(err) => RollbackOutcome::Failed(Box::new(err)),
                }
            };

            tracing::error!(error = %cause, rollback = %rollback, "automatic migration failed");
            Err(MigrationError::AutoMigrate {
                cause: Box::new(cause),
                applied: result.applied_migrations,
                rollback,
            })
        })
        .await
    }

    /// Scaffold a new migration pair in the migrations directory
    pub fn create(&self, name: &str) -> MigrationResult<ScaffoldedMigration> {
        create_migration(&self.config.migrations_dir, name)
    }

    /// Run `operation` while holding the run lock
    async fn locked<T, F>(&self, operation: F) -> MigrationResult<T>
    where
        F: Future<Output = MigrationResult<T>>,
    {
        let lock = self.backend.lock().await?;
        let result = operation.await;

        if let Err(err) = lock.release().await {
            tracing::warn!(error = %err, "failed to release migration lock");
            if result.is_ok() {
                return Err(err);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::error::ErrorKind;
    use crate::runner::tests::{three_migrations, write_pair, IDS};
    use std::fs;
    use tempfile::TempDir;

    fn migrator(dir: &TempDir, backend: &MemoryBackend) -> Migrator {
        let config = MigrationConfig {
            migrations_dir: dir.path().to_path_buf(),
            ..MigrationConfig::default()
        };
        Migrator::new(config, Arc::new(backend.clone()))
    }

    #[tokio::test]
    async fn test_up_then_down_round_trip() {
        let dir = three_migrations();
        let backend = MemoryBackend::new();
        let migrator = migrator(&dir, &backend);

        let up = migrator.up(false).await.unwrap();
        assert_eq!(up.summary(), "applied 3/3 migrations (batch 1)");
        assert!(!backend.is_locked());

        let down = migrator.down(3).await.unwrap();
        assert_eq!(down.rolled_back_count(), 3);
        assert!(backend.entries().is_empty());
        assert!(!backend.is_locked());
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_blocks_mutations() {
        let dir = three_migrations();
        let backend = MemoryBackend::new();
        let migrator = migrator(&dir, &backend);
        backend.hold_lock();

        let err = migrator.up(false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lock);
        assert!(matches!(migrator.down(1).await, Err(MigrationError::Locked { .. })));
        assert!(matches!(migrator.auto_migrate().await, Err(MigrationError::Locked { .. })));
        assert!(backend.entries().is_empty());

        // Status is read-only and does not need the lock
        assert_eq!(migrator.status().await.unwrap().pending.len(), 3);

        backend.release_held_lock();
        migrator.up(false).await.unwrap();
        assert_eq!(backend.entries().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_up_reports_what_it_committed() {
        let dir = three_migrations();
        let backend = MemoryBackend::new();
        backend.fail_on("TABLE comments");
        let migrator = migrator(&dir, &backend);

        let err = migrator.up(false).await.unwrap_err();
        match &err {
            MigrationError::Interrupted { applied, total, .. } => {
                assert_eq!(
                    applied,
                    &vec![format!("{}_users", IDS[0]), format!("{}_posts", IDS[1])]
                );
                assert_eq!(*total, 3);
            }
            other => panic!("expected interrupted run, got {:?}", other),
        }
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(err.migration(), Some(format!("{}_comments", IDS[2]).as_str()));
    }

    #[tokio::test]
    async fn test_failure_on_first_migration_is_not_wrapped() {
        let dir = three_migrations();
        let backend = MemoryBackend::new();
        backend.fail_on("TABLE users");

        let err = migrator(&dir, &backend).up(false).await.unwrap_err();
        assert!(matches!(err, MigrationError::Step { .. }));
        assert!(err.applied().is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_after_failure() {
        let dir = three_migrations();
        let backend = MemoryBackend::new();
        backend.fail_on("TABLE posts");
        let migrator = migrator(&dir, &backend);

        assert!(migrator.up(false).await.is_err());
        assert!(!backend.is_locked());
    }

    #[tokio::test]
    async fn test_discovery_failure_releases_lock_and_touches_nothing() {
        let dir = three_migrations();
        let orphan = dir
            .path()
            .join(format!("{}_orphan.up.sql", "01HQ0000000000000000000004"));
        fs::write(orphan, "").unwrap();
        let backend = MemoryBackend::new();
        let migrator = migrator(&dir, &backend);

        let err = migrator.up(false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Discovery);
        assert!(!backend.schema_created());
        assert!(!backend.is_locked());
    }

    #[tokio::test]
    async fn test_down_rejects_zero_steps() {
        let dir = three_migrations();
        let backend = MemoryBackend::new();

        let err = migrator(&dir, &backend).down(0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_auto_migrate_reverts_the_failed_batch() {
        let dir = TempDir::new().unwrap();
        write_pair(&dir, IDS[0], "users");
        let backend = MemoryBackend::new();
        let migrator = migrator(&dir, &backend);
        migrator.auto_migrate().await.unwrap();

        write_pair(&dir, IDS[1], "posts");
        write_pair(&dir, IDS[2], "comments");
        backend.fail_on("TABLE comments");

        let err = migrator.auto_migrate().await.unwrap_err();
        match &err {
            MigrationError::AutoMigrate {
                cause,
                applied,
                rollback,
            } => {
                assert_eq!(cause.migration(), Some(format!("{}_comments", IDS[2]).as_str()));
                assert_eq!(applied, &vec![format!("{}_posts", IDS[1])]);
                assert!(matches!(rollback, RollbackOutcome::RolledBack { count: 1, batch: 2 }));
            }
            other => panic!("expected auto-migrate error, got {:?}", other),
        }
        assert!(err.to_string().contains("rollback successful"));

        // Batch 1 is untouched, batch 2 is gone
        let ids: Vec<String> = backend.entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![IDS[0].to_string()]);
        assert!(!backend.is_locked());
    }

    #[tokio::test]
    async fn test_auto_migrate_skips_rollback_when_nothing_committed() {
        let dir = TempDir::new().unwrap();
        write_pair(&dir, IDS[0], "users");
        let backend = MemoryBackend::new();
        let migrator = migrator(&dir, &backend);
        migrator.up(false).await.unwrap();

        write_pair(&dir, IDS[1], "posts");
        backend.fail_on("TABLE posts");

        match migrator.auto_migrate().await {
            Err(MigrationError::AutoMigrate { rollback, .. }) => {
                assert!(matches!(rollback, RollbackOutcome::NothingCommitted))
            }
            other => panic!("expected auto-migrate error, got {:?}", other),
        }
        assert_eq!(backend.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_migrate_reports_a_failing_rollback() {
        let dir = three_migrations();
        let backend = MemoryBackend::new();
        backend.fail_on("CREATE TABLE comments");
        backend.fail_on("DROP TABLE posts");
        let migrator = migrator(&dir, &backend);

        let err = migrator.auto_migrate().await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("migration failed: failed to execute migration"));
        assert!(message.contains("rollback also failed"));
        assert_eq!(err.kind(), ErrorKind::Execution);
    }

    #[tokio::test]
    async fn test_ledger_table_comes_from_the_backend() {
        let dir = three_migrations();
        let backend = MemoryBackend::with_table("ops_ledger");
        let migrator = migrator(&dir, &backend);

        assert_eq!(migrator.runner().ledger().table(), "ops_ledger");
        backend.hold_lock();
        let err = migrator.up(false).await.unwrap_err();
        assert_eq!(err.to_string(), "another migration run holds the lock on 'ops_ledger'");
    }

    #[tokio::test]
    async fn test_create_scaffolds_into_migrations_dir() {
        let dir = TempDir::new().unwrap();
        let backend = MemoryBackend::new();
        let migrator = migrator(&dir, &backend);

        let created = migrator.create("add index").unwrap();
        assert!(created.up_path.starts_with(dir.path()));

        let status = migrator.status().await.unwrap();
        assert_eq!(status.pending.len(), 1);
        assert_eq!(status.pending[0].name, "add_index");
    }
}
