//! Migration Definitions - Core types shared by the runners and the facade
//!
//! Defines the configuration for a migration run and the result structures
//! returned by apply, rollback and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use migrator_core::MigratorConfig;

use crate::ledger::LedgerEntry;

/// Configuration for the migration system.
///
/// The ledger table name belongs to the backend, see [`crate::MigrationBackend::table`].
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory where migration files are stored
    pub migrations_dir: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
        }
    }
}

impl From<&MigratorConfig> for MigrationConfig {
    fn from(config: &MigratorConfig) -> Self {
        Self {
            migrations_dir: config.migrations_path.clone(),
        }
    }
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Apply the migration (run the up script)
    Up,
    /// Rollback the migration (run the down script)
    Down,
}

impl MigrationDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationDirection::Up => "up",
            MigrationDirection::Down => "down",
        }
    }
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(MigrationDirection::Up),
            "down" => Ok(MigrationDirection::Down),
            other => Err(format!("unknown migration direction '{}'", other)),
        }
    }
}

/// Result of running migrations
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationRunResult {
    /// `id_name` of each migration committed by this run, in order
    pub applied_migrations: Vec<String>,
    /// `id_name` of each migration a dry run would have applied
    pub pending_migrations: Vec<String>,
    /// Number of migrations that were skipped (already applied)
    pub skipped_count: usize,
    /// Number of migrations found on disk
    pub total_count: usize,
    /// Batch assigned to this run, 0 when nothing was pending
    pub batch: i32,
    pub dry_run: bool,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl MigrationRunResult {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Number of migrations that were applied
    pub fn applied_count(&self) -> usize {
        self.applied_migrations.len()
    }

    /// One-line summary, e.g. `applied 2/5 migrations (batch 3)`
    pub fn summary(&self) -> String {
        if self.dry_run {
            return format!(
                "dry run: {}/{} migrations would be applied",
                self.pending_migrations.len(),
                self.total_count
            );
        }
        if self.applied_migrations.is_empty() {
            return format!("nothing to migrate ({} already applied)", self.skipped_count);
        }
        format!(
            "applied {}/{} migrations (batch {})",
            self.applied_count(),
            self.total_count,
            self.batch
        )
    }
}

/// Result of rolling back migrations
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackResult {
    /// `id_name` of each migration that was rolled back, newest first
    pub rolled_back_migrations: Vec<String>,
    /// Batch that was acted on, 0 when the ledger was empty
    pub batch: i32,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl RollbackResult {
    /// Number of migrations that were rolled back
    pub fn rolled_back_count(&self) -> usize {
        self.rolled_back_migrations.len()
    }

    pub fn summary(&self) -> String {
        if self.batch == 0 {
            return "nothing to roll back".to_string();
        }
        if self.rolled_back_migrations.is_empty() {
            return "nothing to roll back in last batch".to_string();
        }
        format!(
            "rolled back {} migration(s) from batch {}",
            self.rolled_back_count(),
            self.batch
        )
    }
}

/// Migration status in the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Migration is pending (not yet applied)
    Pending,
    /// Migration has been applied
    Applied {
        /// When it was applied
        applied_at: DateTime<Utc>,
        /// Batch number
        batch: i32,
    },
}

/// A migration on disk with no ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub id: String,
    pub name: String,
}

/// Applied and pending migrations at a point in time
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    /// Every ledger entry, oldest first
    pub applied: Vec<LedgerEntry>,
    /// Every discovered migration without a ledger entry, ascending by id
    pub pending: Vec<PendingMigration>,
}

impl StatusReport {
    pub fn status_of(&self, id: &str) -> MigrationStatus {
        self.applied
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| MigrationStatus::Applied {
                applied_at: entry.applied_at,
                batch: entry.batch,
            })
            .unwrap_or(MigrationStatus::Pending)
    }
}
