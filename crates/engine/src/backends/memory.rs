//! In-process migration backend
//!
//! Keeps the ledger in memory and stages every transaction until commit, so
//! a failed or rolled-back migration leaves no trace. Scripts are not parsed;
//! they are recorded when their transaction commits. Failures can be injected
//! into script execution, `begin`, `commit` and ledger deletes to exercise the
//! engine's error paths.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

use migrator_core::DEFAULT_MIGRATIONS_TABLE;

use super::core::*;
use crate::definitions::MigrationDirection;
use crate::error::{MigrationError, MigrationResult};
use crate::ledger::LedgerEntry;

#[derive(Debug, Default)]
struct MemoryState {
    schema_created: bool,
    entries: Vec<LedgerEntry>,
    executed: Vec<String>,
    failing_scripts: Vec<String>,
    failing_commits: Vec<String>,
    failing_deletes: Vec<String>,
    begin_limit: Option<usize>,
    locked: bool,
    begun: usize,
    committed: usize,
    rolled_back: usize,
}

impl MemoryState {
    fn require_schema(&self, table: &str) -> MigrationResult<()> {
        if self.schema_created {
            Ok(())
        } else {
            Err(MigrationError::ledger(format!(
                "relation \"{}\" does not exist",
                table
            )))
        }
    }
}

/// Transaction counters of a [`MemoryBackend`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionCounts {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
}

/// Ledger and scripts held in process memory. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    table: String,
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_table(DEFAULT_MIGRATIONS_TABLE)
    }

    pub fn with_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make any script containing `needle` fail when executed
    pub fn fail_on(&self, needle: impl Into<String>) {
        self.state().failing_scripts.push(needle.into());
    }

    /// Make `commit` fail for a transaction that staged a script containing `needle`
    pub fn fail_commit_on(&self, needle: impl Into<String>) {
        self.state().failing_commits.push(needle.into());
    }

    /// Make deleting the ledger entry `id` fail
    pub fn fail_delete_of(&self, id: impl Into<String>) {
        self.state().failing_deletes.push(id.into());
    }

    /// Let `count` more transactions begin, then fail every `begin`
    pub fn fail_begin_after(&self, count: usize) {
        let mut state = self.state();
        state.begin_limit = Some(state.begun + count);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_scripts.clear();
        state.failing_commits.clear();
        state.failing_deletes.clear();
        state.begin_limit = None;
    }

    /// Insert an entry outside any transaction, creating the schema if needed
    pub fn seed_entry(&self, entry: LedgerEntry) {
        let mut state = self.state();
        state.schema_created = true;
        state.entries.push(entry);
    }

    /// Committed ledger entries in insertion order
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.state().entries.clone()
    }

    /// Scripts whose transactions committed, in commit order
    pub fn executed_scripts(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    pub fn schema_created(&self) -> bool {
        self.state().schema_created
    }

    pub fn transaction_counts(&self) -> TransactionCounts {
        let state = self.state();
        TransactionCounts {
            begun: state.begun,
            committed: state.committed,
            rolled_back: state.rolled_back,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Take the lock on behalf of some other run
    pub fn hold_lock(&self) {
        self.state().locked = true;
    }

    pub fn release_held_lock(&self) {
        self.state().locked = false;
    }
}

#[async_trait]
impl MigrationBackend for MemoryBackend {
    fn table(&self) -> &str {
        &self.table
    }

    async fn ensure_schema(&self) -> MigrationResult<()> {
        self.state().schema_created = true;
        Ok(())
    }

    async fn schema_exists(&self) -> MigrationResult<bool> {
        Ok(self.state().schema_created)
    }

    async fn max_batch(&self) -> MigrationResult<i32> {
        let state = self.state();
        state.require_schema(&self.table)?;
        Ok(state.entries.iter().map(|e| e.batch).max().unwrap_or(0))
    }

    async fn query(&self, query: LedgerQuery<'_>) -> MigrationResult<Vec<LedgerEntry>> {
        let state = self.state();
        state.require_schema(&self.table)?;

        let mut entries: Vec<LedgerEntry> = match query {
            LedgerQuery::All => state.entries.clone(),
            LedgerQuery::Batch(batch) => state
                .entries
                .iter()
                .filter(|e| e.batch == batch && e.direction == MigrationDirection::Up)
                .cloned()
                .collect(),
            LedgerQuery::Id(id) => state
                .entries
                .iter()
                .filter(|e| e.id == id)
                .cloned()
                .collect(),
        };

        match query {
            LedgerQuery::Batch(_) => entries.sort_by(|a, b| b.id.cmp(&a.id)),
            _ => entries.sort_by(|a, b| {
                a.applied_at
                    .cmp(&b.applied_at)
                    .then_with(|| a.id.cmp(&b.id))
            }),
        }
        Ok(entries)
    }

    async fn begin(&self) -> MigrationResult<Box<dyn MigrationTransaction>> {
        let mut state = self.state();
        if matches!(state.begin_limit, Some(limit) if state.begun >= limit) {
            return Err(MigrationError::connection("connection reset by peer"));
        }
        state.begun += 1;
        drop(state);

        Ok(Box::new(MemoryTransaction {
            table: self.table.clone(),
            state: Arc::clone(&self.state),
            scripts: Vec::new(),
            inserts: Vec::new(),
            deletes: Vec::new(),
        }))
    }

    async fn lock(&self) -> MigrationResult<Box<dyn MigrationLock>> {
        let mut state = self.state();
        if state.locked {
            return Err(MigrationError::Locked {
                table: self.table.clone(),
            });
        }
        state.locked = true;
        Ok(Box::new(MemoryLock {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Staged changes of one migration
struct MemoryTransaction {
    table: String,
    state: Arc<Mutex<MemoryState>>,
    scripts: Vec<String>,
    inserts: Vec<LedgerEntry>,
    deletes: Vec<String>,
}

impl MemoryTransaction {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MigrationTransaction for MemoryTransaction {
    async fn execute_script(&mut self, script: &str) -> MigrationResult<()> {
        let failing = self
            .state()
            .failing_scripts
            .iter()
            .find(|needle| script.contains(needle.as_str()))
            .cloned();

        if let Some(needle) = failing {
            return Err(MigrationError::database(format!(
                "syntax error at or near \"{}\"",
                needle
            )));
        }
        self.scripts.push(script.to_string());
        Ok(())
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> MigrationResult<()> {
        let duplicate = {
            let state = self.state();
            state.require_schema(&self.table)?;
            state.entries.iter().any(|e| e.id == entry.id)
                && !self.deletes.contains(&entry.id)
        } || self.inserts.iter().any(|e| e.id == entry.id);

        if duplicate {
            return Err(MigrationError::ledger(format!(
                "duplicate key value violates unique constraint \"{}_pkey\"",
                self.table
            )));
        }
        self.inserts.push(entry.clone());
        Ok(())
    }

    async fn delete_entry(&mut self, id: &str) -> MigrationResult<()> {
        {
            let state = self.state();
            state.require_schema(&self.table)?;
            if state.failing_deletes.iter().any(|failing| failing == id) {
                return Err(MigrationError::ledger(format!(
                    "permission denied for table {}",
                    self.table
                )));
            }
        }
        self.inserts.retain(|e| e.id != id);
        self.deletes.push(id.to_string());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> MigrationResult<()> {
        let tx = *self;
        let mut state = tx
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let failing = state
            .failing_commits
            .iter()
            .any(|needle| tx.scripts.iter().any(|script| script.contains(needle.as_str())));
        if failing {
            return Err(MigrationError::database(
                "could not serialize access due to concurrent update",
            ));
        }

        state.entries.retain(|e| !tx.deletes.contains(&e.id));
        state.entries.extend(tx.inserts);
        state.executed.extend(tx.scripts);
        state.committed += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MigrationResult<()> {
        self.state().rolled_back += 1;
        Ok(())
    }
}

struct MemoryLock {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl MigrationLock for MemoryLock {
    async fn release(self: Box<Self>) -> MigrationResult<()> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .locked = false;
        Ok(())
    }
}
