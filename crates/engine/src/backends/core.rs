//! Core Migration Backend Traits
//!
//! The engine never talks to a database driver directly. Everything it needs
//! from persistence goes through these traits: ledger schema management,
//! ledger reads, one transaction per migration, and the run lock.

use async_trait::async_trait;

use crate::error::MigrationResult;
use crate::ledger::LedgerEntry;

/// Predicate for reading ledger entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerQuery<'a> {
    /// Every entry ordered by `applied_at`, then id
    All,
    /// Entries of one batch with direction `up`, ordered by id descending
    Batch(i32),
    /// The entry with this id, if any
    Id(&'a str),
}

/// Persistence used by the migration engine
#[async_trait]
pub trait MigrationBackend: Send + Sync {
    /// Ledger table name, possibly schema-qualified
    fn table(&self) -> &str;

    /// Create the ledger table if it does not already exist
    async fn ensure_schema(&self) -> MigrationResult<()>;

    /// Whether the ledger table exists, without creating it
    async fn schema_exists(&self) -> MigrationResult<bool>;

    /// Highest batch in the ledger, 0 when empty
    async fn max_batch(&self) -> MigrationResult<i32>;

    /// Read ledger entries matching a predicate
    async fn query(&self, query: LedgerQuery<'_>) -> MigrationResult<Vec<LedgerEntry>>;

    /// Begin the transaction a single migration runs in
    async fn begin(&self) -> MigrationResult<Box<dyn MigrationTransaction>>;

    /// Try to take the run lock, failing immediately if another run holds it
    async fn lock(&self) -> MigrationResult<Box<dyn MigrationLock>>;
}

/// A transaction wrapping one migration's script and its ledger change
#[async_trait]
pub trait MigrationTransaction: Send {
    /// Run a script verbatim; it may contain several statements
    async fn execute_script(&mut self, script: &str) -> MigrationResult<()>;

    /// Record a migration as applied
    async fn insert_entry(&mut self, entry: &LedgerEntry) -> MigrationResult<()>;

    /// Remove a migration's ledger entry
    async fn delete_entry(&mut self, id: &str) -> MigrationResult<()>;

    async fn commit(self: Box<Self>) -> MigrationResult<()>;

    async fn rollback(self: Box<Self>) -> MigrationResult<()>;
}

/// A held run lock
#[async_trait]
pub trait MigrationLock: Send {
    async fn release(self: Box<Self>) -> MigrationResult<()>;
}

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct DatabasePoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: Option<u64>,
    pub test_before_acquire: bool,
}

impl Default for DatabasePoolConfig {
    fn default() -> Self {
        // One connection runs migrations, a second may hold the advisory lock
        Self {
            max_connections: 2,
            min_connections: 1,
            acquire_timeout_seconds: 30,
            idle_timeout_seconds: Some(600),
            test_before_acquire: true,
        }
    }
}
