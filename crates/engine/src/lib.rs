//! # migrator-engine
//!
//! Applies and reverts versioned SQL migrations against PostgreSQL, keeping a
//! ledger of what has been applied so repeated runs are safe.
//!
//! Migrations live in one directory as `<id>_<name>.up.sql` and
//! `<id>_<name>.down.sql` pairs. Each call to [`Migrator::up`] applies the
//! pending ones in id order under a new batch number; [`Migrator::down`]
//! reverts migrations of the latest batch.

pub mod backends;
pub mod definitions;
pub mod discovery;
pub mod error;
pub mod id;
pub mod ledger;
pub mod migrator;
mod rollback;
pub mod runner;
pub mod scaffold;
mod status;

pub use backends::{MemoryBackend, MigrationBackend, PostgresBackend};
pub use definitions::*;
pub use discovery::{discover_migrations, MigrationUnit};
pub use error::{ErrorKind, MigrationError, MigrationPhase, MigrationResult, RollbackOutcome};
pub use id::MigrationId;
pub use ledger::{checksum, LedgerEntry, LedgerStore};
pub use migrator::Migrator;
pub use runner::MigrationRunner;
pub use scaffold::{create_migration, ScaffoldedMigration};
