//! Migration Rollback - Reverts migrations of the most recent batch
//!
//! Rollback never crosses a batch boundary: `steps` counts migrations within
//! the latest batch, newest id first. Each revert runs the down script and
//! deletes the ledger entry in one transaction.

use std::collections::HashSet;
use std::time::Instant;

use crate::definitions::{MigrationDirection, RollbackResult};
use crate::discovery::MigrationUnit;
use crate::error::{MigrationError, MigrationPhase, MigrationResult};
use crate::runner::{LedgerChange, MigrationRunner};

impl MigrationRunner {
    /// Revert up to `steps` migrations of the latest batch.
    ///
    /// Like [`MigrationRunner::run_migrations`], `result` holds what was
    /// reverted even when an error is returned.
    pub async fn rollback_last_batch(
        &self,
        units: &[MigrationUnit],
        steps: usize,
        result: &mut RollbackResult,
    ) -> MigrationResult<()> {
        let start_time = Instant::now();

        self.ledger().ensure_schema().await?;
        let last_batch = self.ledger().max_batch().await?;
        if last_batch == 0 {
            tracing::info!("nothing to roll back");
            return Ok(());
        }
        result.batch = last_batch;

        let candidates = self.ledger().entries_in_batch(last_batch).await?;
        if candidates.is_empty() {
            tracing::info!(batch = last_batch, "nothing to roll back in last batch");
            return Ok(());
        }

        let on_disk: HashSet<&str> = units.iter().map(|unit| unit.id.as_str()).collect();
        for entry in candidates.iter().filter(|e| !on_disk.contains(e.id.as_str())) {
            tracing::warn!(
                migration = %entry.key(),
                batch = last_batch,
                "applied migration has no files on disk, leaving it in place"
            );
        }

        let candidate_ids: HashSet<&str> = candidates.iter().map(|e| e.id.as_str()).collect();
        for unit in units.iter().rev() {
            if result.rolled_back_count() >= steps {
                break;
            }
            if !candidate_ids.contains(unit.id.as_str()) {
                continue;
            }

            if let Err(err) = self.revert_migration(unit).await {
                result.execution_time_ms = start_time.elapsed().as_millis();
                tracing::error!(
                    migration = %unit.key(),
                    batch = last_batch,
                    reverted = result.rolled_back_count(),
                    error = %err,
                    "rollback failed, stopping"
                );
                return Err(err);
            }
            result.rolled_back_migrations.push(unit.key());
        }

        result.execution_time_ms = start_time.elapsed().as_millis();
        tracing::info!(
            reverted = result.rolled_back_count(),
            batch = last_batch,
            "rollback finished"
        );
        Ok(())
    }

    /// Revert a single migration
    async fn revert_migration(&self, unit: &MigrationUnit) -> MigrationResult<()> {
        let key = unit.key();
        let path = unit.script_path(MigrationDirection::Down);
        tracing::debug!(migration = %key, "rolling back migration");

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| MigrationError::step(&key, path, MigrationPhase::Read, e))?;
        let script = String::from_utf8(bytes)
            .map_err(|e| MigrationError::step(&key, path, MigrationPhase::Read, e))?;

        self.run_in_transaction(&key, path, &script, LedgerChange::Delete(&unit.id))
            .await?;

        tracing::info!(migration = %key, "rolled back migration");
        Ok(())
    }
}
