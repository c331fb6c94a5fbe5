//! Error types for the migration engine
//!
//! Every failure that happens while a specific migration is being applied or
//! reverted is wrapped in [`MigrationError::Step`], which carries the migration
//! identity, the script path and the phase that failed.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use migrator_core::ConfigError;

/// Result type alias for engine operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Coarse classification of a [`MigrationError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Discovery,
    Connection,
    Execution,
    Ledger,
    Lock,
    Config,
    Scaffold,
}

/// Step of a single migration's transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Reading the script from disk
    Read,
    /// Opening the transaction
    Begin,
    /// Running the script
    Execute,
    /// Inserting the ledger entry
    Record,
    /// Deleting the ledger entry
    Delete,
    /// Committing the transaction
    Commit,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Read => "read",
            MigrationPhase::Begin => "begin transaction for",
            MigrationPhase::Execute => "execute",
            MigrationPhase::Record => "record",
            MigrationPhase::Delete => "delete ledger entry of",
            MigrationPhase::Commit => "commit",
        }
    }

    /// Phases that touch the ledger table rather than the user's script
    pub fn is_ledger(&self) -> bool {
        matches!(self, MigrationPhase::Record | MigrationPhase::Delete)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator's compensating rollback did after a failed apply
#[derive(Debug)]
pub enum RollbackOutcome {
    /// The failed run committed nothing, so there was nothing to revert
    NothingCommitted,
    /// Committed migrations of the failed batch were reverted
    RolledBack { count: usize, batch: i32 },
    /// The compensating rollback failed as well
    Failed(Box<MigrationError>),
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::NothingCommitted => {
                write!(f, "nothing was committed, rollback skipped")
            }
            RollbackOutcome::RolledBack { count, batch } => {
                write!(f, "rollback successful ({} reverted from batch {})", count, batch)
            }
            RollbackOutcome::Failed(err) => write!(f, "rollback also failed: {}", err),
        }
    }
}

/// Errors raised by discovery, the ledger, the backends and the runners
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to read migrations directory '{}': {source}", .path.display())]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("migration pair missing for: {key}")]
    IncompletePair { key: String },

    #[error("migration id {id} is used by both '{first}' and '{second}'")]
    DuplicateId {
        id: String,
        first: String,
        second: String,
    },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("database error: {message}")]
    Database { message: String },

    #[error("ledger error: {message}")]
    Ledger { message: String },

    #[error("failed to {phase} migration {migration} ({}): {message}", .path.display())]
    Step {
        migration: String,
        path: PathBuf,
        phase: MigrationPhase,
        message: String,
    },

    #[error("another migration run holds the lock on '{table}'")]
    Locked { table: String },

    #[error("lock error: {message}")]
    Lock { message: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid migration name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("migration file already exists: {}", .path.display())]
    FileExists { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{cause} ({} of {total} applied before the failure)", .applied.len())]
    Interrupted {
        cause: Box<MigrationError>,
        /// Keys (`id_name`) of the migrations committed before the failure
        applied: Vec<String>,
        total: usize,
    },

    #[error("migration failed: {cause}; {rollback}")]
    AutoMigrate {
        cause: Box<MigrationError>,
        /// Keys of the migrations the failed run committed
        applied: Vec<String>,
        rollback: RollbackOutcome,
    },
}

impl MigrationError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a ledger error
    pub fn ledger(message: impl Into<String>) -> Self {
        Self::Ledger {
            message: message.into(),
        }
    }

    /// Wrap a failure with the identity of the migration being processed
    pub fn step(
        migration: impl Into<String>,
        path: impl Into<PathBuf>,
        phase: MigrationPhase,
        source: impl fmt::Display,
    ) -> Self {
        Self::Step {
            migration: migration.into(),
            path: path.into(),
            phase,
            message: source.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::DirectoryUnreadable { .. }
            | MigrationError::IncompletePair { .. }
            | MigrationError::DuplicateId { .. } => ErrorKind::Discovery,
            MigrationError::Connection { .. } => ErrorKind::Connection,
            MigrationError::Database { .. } => ErrorKind::Execution,
            MigrationError::Ledger { .. } => ErrorKind::Ledger,
            MigrationError::Step { phase, .. } if phase.is_ledger() => ErrorKind::Ledger,
            MigrationError::Step { .. } => ErrorKind::Execution,
            MigrationError::Locked { .. } | MigrationError::Lock { .. } => ErrorKind::Lock,
            MigrationError::Config(_) => ErrorKind::Config,
            MigrationError::InvalidName { .. }
            | MigrationError::FileExists { .. }
            | MigrationError::Io(_) => ErrorKind::Scaffold,
            MigrationError::Interrupted { cause, .. }
            | MigrationError::AutoMigrate { cause, .. } => cause.kind(),
        }
    }

    /// Migrations committed by the run before it failed
    pub fn applied(&self) -> &[String] {
        match self {
            MigrationError::Interrupted { applied, .. }
            | MigrationError::AutoMigrate { applied, .. } => applied,
            _ => &[],
        }
    }

    /// Migration (`id_name`) the error is attributed to, if any
    pub fn migration(&self) -> Option<&str> {
        match self {
            MigrationError::Step { migration, .. } => Some(migration),
            MigrationError::IncompletePair { key } => Some(key),
            MigrationError::Interrupted { cause, .. }
            | MigrationError::AutoMigrate { cause, .. } => cause.migration(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_carries_identity_and_phase() {
        let err = MigrationError::step(
            "01HZX3D4K7Q8R9S0T1V2W3X4Y5_add_users",
            "migrations/01HZX3D4K7Q8R9S0T1V2W3X4Y5_add_users.up.sql",
            MigrationPhase::Execute,
            "syntax error at or near \"CREAT\"",
        );

        let message = err.to_string();
        assert!(
            message.starts_with("failed to execute migration 01HZX3D4K7Q8R9S0T1V2W3X4Y5_add_users")
        );
        assert!(message.contains(".up.sql"));
        assert!(message.contains("syntax error"));
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(err.migration(), Some("01HZX3D4K7Q8R9S0T1V2W3X4Y5_add_users"));
    }

    #[test]
    fn test_ledger_phases_classify_as_ledger_errors() {
        let record = MigrationError::step("a_b", "a_b.up.sql", MigrationPhase::Record, "dup");
        let delete = MigrationError::step("a_b", "a_b.down.sql", MigrationPhase::Delete, "gone");
        let commit = MigrationError::step("a_b", "a_b.up.sql", MigrationPhase::Commit, "io");

        assert_eq!(record.kind(), ErrorKind::Ledger);
        assert_eq!(delete.kind(), ErrorKind::Ledger);
        assert_eq!(commit.kind(), ErrorKind::Execution);
    }

    #[test]
    fn test_auto_migrate_error_composes_both_outcomes() {
        let cause = MigrationError::step("x_y", "x_y.up.sql", MigrationPhase::Execute, "boom");
        let second = MigrationError::step("w_v", "w_v.down.sql", MigrationPhase::Execute, "bang");
        let err = MigrationError::AutoMigrate {
            cause: Box::new(cause),
            applied: vec!["a_b".to_string()],
            rollback: RollbackOutcome::Failed(Box::new(second)),
        };

        let message = err.to_string();
        assert!(message.starts_with("migration failed: failed to execute migration x_y"));
        assert!(message.contains("rollback also failed: failed to execute migration w_v"));
        assert_eq!(err.migration(), Some("x_y"));
        assert_eq!(err.applied(), ["a_b".to_string()]);
    }

    #[test]
    fn test_interrupted_run_keeps_committed_keys() {
        let cause =
            MigrationError::step("c_posts", "c_posts.up.sql", MigrationPhase::Execute, "boom");
        let err = MigrationError::Interrupted {
            cause: Box::new(cause),
            applied: vec!["b_users".to_string()],
            total: 3,
        };

        assert!(err.to_string().ends_with("(1 of 3 applied before the failure)"));
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(err.migration(), Some("c_posts"));
        assert_eq!(err.applied(), ["b_users".to_string()]);
        assert!(MigrationError::connection("refused").applied().is_empty());
    }

    #[test]
    fn test_discovery_errors() {
        let err = MigrationError::IncompletePair {
            key: "01HZX3D4K7Q8R9S0T1V2W3X4Y5_foo".to_string(),
        };
        assert_eq!(err.to_string(), "migration pair missing for: 01HZX3D4K7Q8R9S0T1V2W3X4Y5_foo");
        assert_eq!(err.kind(), ErrorKind::Discovery);
    }
}
