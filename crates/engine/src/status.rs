//! Migration status: which migrations are applied and which are pending.
//! Reading status never creates the ledger table or opens a transaction.

use std::collections::HashSet;

use crate::definitions::{PendingMigration, StatusReport};
use crate::discovery::MigrationUnit;
use crate::error::MigrationResult;
use crate::runner::MigrationRunner;

impl MigrationRunner {
    /// Compare discovered migrations with the ledger
    pub async fn status(&self, units: &[MigrationUnit]) -> MigrationResult<StatusReport> {
        let applied = if self.ledger().schema_exists().await? {
            self.ledger().all_entries().await?
        } else {
            tracing::debug!(table = %self.ledger().table(), "ledger table does not exist yet");
            Vec::new()
        };

        let applied_ids: HashSet<&str> = applied.iter().map(|e| e.id.as_str()).collect();
        let pending = units
            .iter()
            .filter(|unit| !applied_ids.contains(unit.id.as_str()))
            .map(|unit| PendingMigration {
                id: unit.id.clone(),
                name: unit.name.clone(),
            })
            .collect();

        Ok(StatusReport { applied, pending })
    }
}
