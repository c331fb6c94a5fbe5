//! Migration Backends
//!
//! A PostgreSQL backend built on sqlx and an in-process memory backend that
//! behaves the same way for tests and dry experiments.

pub mod core;
pub mod memory;
pub mod postgres;

pub use self::core::*;
pub use memory::MemoryBackend;
pub use postgres::{LedgerSql, PostgresBackend};
