//! Ledger Store - The persisted record of applied migrations
//!
//! An entry exists exactly while its migration is applied: apply inserts it
//! and rollback deletes it, each inside the migration's own transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

use crate::backends::{LedgerQuery, MigrationBackend};
use crate::definitions::MigrationDirection;
use crate::discovery::MigrationUnit;
use crate::error::MigrationResult;

/// One row of the ledger table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    pub batch: i32,
    pub direction: MigrationDirection,
    /// Hex SHA-256 of the up script at apply time
    pub checksum: String,
}

impl LedgerEntry {
    /// Entry recording that `unit` was applied now in `batch`
    pub fn applied(unit: &MigrationUnit, batch: i32, checksum: String) -> Self {
        Self {
            id: unit.id.clone(),
            name: unit.name.clone(),
            applied_at: Utc::now(),
            batch,
            direction: MigrationDirection::Up,
            checksum,
        }
    }

    pub fn key(&self) -> String {
        format!("{}_{}", self.id, self.name)
    }
}

/// Hex-encoded SHA-256 of a script's bytes
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Read access to the ledger through a backend
#[derive(Clone)]
pub struct LedgerStore {
    backend: Arc<dyn MigrationBackend>,
}

impl LedgerStore {
    pub fn new(backend: Arc<dyn MigrationBackend>) -> Self {
        Self { backend }
    }

    pub fn table(&self) -> &str {
        self.backend.table()
    }

    /// Create the ledger table if it does not exist
    pub async fn ensure_schema(&self) -> MigrationResult<()> {
        self.backend.ensure_schema().await
    }

    pub async fn schema_exists(&self) -> MigrationResult<bool> {
        self.backend.schema_exists().await
    }

    /// Highest batch number recorded, 0 for an empty ledger
    pub async fn max_batch(&self) -> MigrationResult<i32> {
        self.backend.max_batch().await
    }

    pub async fn is_applied(&self, id: &str) -> MigrationResult<bool> {
        Ok(!self.backend.query(LedgerQuery::Id(id)).await?.is_empty())
    }

    /// Ids of every applied migration
    pub async fn applied_ids(&self) -> MigrationResult<HashSet<String>> {
        Ok(self
            .all_entries()
            .await?
            .into_iter()
            .map(|entry| entry.id)
            .collect())
    }

    /// Every entry ordered by `applied_at`, ties broken by id
    pub async fn all_entries(&self) -> MigrationResult<Vec<LedgerEntry>> {
        self.backend.query(LedgerQuery::All).await
    }

    /// Applied entries of one batch, highest id first
    pub async fn entries_in_batch(&self, batch: i32) -> MigrationResult<Vec<LedgerEntry>> {
        self.backend.query(LedgerQuery::Batch(batch)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use std::path::PathBuf;

    fn unit(id: &str, name: &str) -> MigrationUnit {
        MigrationUnit {
            id: id.to_string(),
            name: name.to_string(),
            up_path: PathBuf::from(format!("{}_{}.up.sql", id, name)),
            down_path: PathBuf::from(format!("{}_{}.down.sql", id, name)),
        }
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(checksum(b"CREATE TABLE t (id INT);").len(), 64);
    }

    #[tokio::test]
    async fn test_store_reads_through_backend() {
        let backend = MemoryBackend::new();
        let store = LedgerStore::new(Arc::new(backend.clone()));

        assert!(!store.schema_exists().await.unwrap());
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        assert!(store.schema_exists().await.unwrap());
        assert_eq!(store.max_batch().await.unwrap(), 0);

        let a = unit("01HQ0000000000000000000001", "a");
        backend.seed_entry(LedgerEntry::applied(&a, 1, checksum(b"a")));
        let b = unit("01HQ0000000000000000000002", "b");
        backend.seed_entry(LedgerEntry::applied(&b, 2, checksum(b"b")));
        let c = unit("01HQ0000000000000000000003", "c");
        backend.seed_entry(LedgerEntry::applied(&c, 2, checksum(b"c")));

        assert_eq!(store.max_batch().await.unwrap(), 2);
        assert!(store.is_applied("01HQ0000000000000000000002").await.unwrap());
        assert!(!store.is_applied("01HQ0000000000000000000009").await.unwrap());
        assert_eq!(store.applied_ids().await.unwrap().len(), 3);

        let batch: Vec<String> = store
            .entries_in_batch(2)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        assert_eq!(
            batch,
            vec!["01HQ0000000000000000000003", "01HQ0000000000000000000002"]
        );

        let all = store.all_entries().await.unwrap();
        assert_eq!(all.first().unwrap().key(), "01HQ0000000000000000000001_a");
    }
}
