//! # migrator-core
//!
//! Configuration for the migrator: connection descriptor, migrations directory,
//! ledger table name and `SECRET:` environment references.

pub mod config;

pub use config::{
    ConfigError, ConfigSource, DatabaseConfig, MigratorConfig, Secret, DEFAULT_CONFIG_FILE,
    DEFAULT_MIGRATIONS_TABLE,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
