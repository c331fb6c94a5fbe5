//! Migration Runner - Executes migrations against the database
//!
//! Each migration runs in its own transaction together with its ledger
//! change, so a migration is either fully applied and recorded or not at all.
//! A failure stops the run; migrations committed earlier in the same run stay.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::backends::{MigrationBackend, MigrationTransaction};
use crate::definitions::{MigrationDirection, MigrationRunResult};
use crate::discovery::MigrationUnit;
use crate::error::{MigrationError, MigrationPhase, MigrationResult};
use crate::ledger::{checksum, LedgerEntry, LedgerStore};

/// Ledger change made in the same transaction as a script
pub(crate) enum LedgerChange<'a> {
    Insert(&'a LedgerEntry),
    Delete(&'a str),
}

/// Migration runner that executes migrations against a backend
pub struct MigrationRunner {
    backend: Arc<dyn MigrationBackend>,
    ledger: LedgerStore,
}

impl MigrationRunner {
    pub fn new(backend: Arc<dyn MigrationBackend>) -> Self {
        let ledger = LedgerStore::new(Arc::clone(&backend));
        Self { backend, ledger }
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    /// Apply every unit that has no ledger entry, ascending by id.
    ///
    /// Progress is written to `result` as it happens, so after an error it
    /// still lists the migrations this run committed.
    pub async fn run_migrations(
        &self,
        units: &[MigrationUnit],
        dry_run: bool,
        result: &mut MigrationRunResult,
    ) -> MigrationResult<()> {
        let start_time = Instant::now();
        result.dry_run = dry_run;
        result.total_count = units.len();

        self.ledger.ensure_schema().await?;
        let next_batch = self.ledger.max_batch().await? + 1;
        let applied_ids = self.ledger.applied_ids().await?;

        let pending: Vec<&MigrationUnit> = units
            .iter()
            .filter(|unit| !applied_ids.contains(&unit.id))
            .collect();
        result.skipped_count = units.len() - pending.len();

        if pending.is_empty() {
            tracing::info!(total = units.len(), "nothing to migrate");
            result.execution_time_ms = start_time.elapsed().as_millis();
            return Ok(());
        }
        result.batch = next_batch;

        for unit in pending {
            if dry_run {
                tracing::info!(
                    migration = %unit.key(),
                    batch = next_batch,
                    dry_run,
                    "would apply migration"
                );
                result.pending_migrations.push(unit.key());
                continue;
            }

            if let Err(err) = self.apply_migration(unit, next_batch).await {
                result.execution_time_ms = start_time.elapsed().as_millis();
                tracing::error!(
                    migration = %unit.key(),
                    batch = next_batch,
                    applied = result.applied_count(),
                    error = %err,
                    "migration failed, stopping run"
                );
                return Err(err);
            }
            result.applied_migrations.push(unit.key());
        }

        result.execution_time_ms = start_time.elapsed().as_millis();
        tracing::info!(
            applied = result.applied_count(),
            total = result.total_count,
            batch = next_batch,
            dry_run,
            "migration run finished"
        );
        Ok(())
    }

    /// Apply a single migration
    async fn apply_migration(&self, unit: &MigrationUnit, batch: i32) -> MigrationResult<()> {
        let key = unit.key();
        let path = unit.script_path(MigrationDirection::Up);
        tracing::debug!(migration = %key, batch, "applying migration");

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| MigrationError::step(&key, path, MigrationPhase::Read, e))?;
        let entry = LedgerEntry::applied(unit, batch, checksum(&bytes));
        let script = String::from_utf8(bytes)
            .map_err(|e| MigrationError::step(&key, path, MigrationPhase::Read, e))?;

        self.run_in_transaction(&key, path, &script, LedgerChange::Insert(&entry))
            .await?;

        tracing::info!(migration = %key, batch, "applied migration");
        Ok(())
    }

    /// Run `script` and the ledger change in one transaction, rolling it back on failure
    pub(crate) async fn run_in_transaction(
        &self,
        key: &str,
        path: &Path,
        script: &str,
        change: LedgerChange<'_>,
    ) -> MigrationResult<()> {
        let mut tx = self
            .backend
            .begin()
            .await
            .map_err(|e| MigrationError::step(key, path, MigrationPhase::Begin, e))?;

        match stage(tx.as_mut(), script, change).await {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| MigrationError::step(key, path, MigrationPhase::Commit, e)),
            Err((phase, err)) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        migration = %key,
                        error = %rollback_err,
                        "failed to roll back transaction"
                    );
                }
                Err(MigrationError::step(key, path, phase, err))
            }
        }
    }
}

async fn stage(
    tx: &mut dyn MigrationTransaction,
    script: &str,
    change: LedgerChange<'_>,
) -> Result<(), (MigrationPhase, MigrationError)> {
    if script.trim().is_empty() {
        tracing::debug!("empty script, recording without executing");
    } else {
        tx.execute_script(script)
            .await
            .map_err(|e| (MigrationPhase::Execute, e))?;
    }

    match change {
        LedgerChange::Insert(entry) => tx
            .insert_entry(entry)
            .await
            .map_err(|e| (MigrationPhase::Record, e)),
        LedgerChange::Delete(id) => tx
            .delete_entry(id)
            .await
            .map_err(|e| (MigrationPhase::Delete, e)),
    }
}
