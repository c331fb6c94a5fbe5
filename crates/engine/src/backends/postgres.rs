//! PostgreSQL Backend Implementation
//!
//! Implements the migration backend traits with sqlx. Scripts are sent through
//! the simple query protocol so a file may hold any number of statements, and
//! the run lock is a session-level advisory lock on a dedicated connection.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Executor, Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;

use migrator_core::{ConfigError, DatabaseConfig};

use super::core::*;
use crate::error::{MigrationError, MigrationResult};
use crate::ledger::LedgerEntry;

/// SQL statements for one ledger table
#[derive(Debug, Clone)]
pub struct LedgerSql {
    table: String,
}

impl LedgerSql {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// SQL to create the ledger table
    pub fn create_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id TEXT PRIMARY KEY,\n    \
                name TEXT NOT NULL,\n    \
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n    \
                batch INTEGER NOT NULL,\n    \
                direction TEXT NOT NULL DEFAULT 'up',\n    \
                checksum TEXT NOT NULL\n\
            )",
            self.table
        )
    }

    /// SQL to check the table exists; binds the table name as `$1`
    pub fn table_exists(&self) -> &'static str {
        "SELECT to_regclass($1) IS NOT NULL"
    }

    /// SQL to get the latest batch number
    pub fn max_batch(&self) -> String {
        format!("SELECT COALESCE(MAX(batch), 0) FROM {}", self.table)
    }

    /// SQL to read entries matching a predicate
    pub fn select(&self, query: &LedgerQuery<'_>) -> String {
        let columns = "id, name, applied_at, batch, direction, checksum";
        match query {
            LedgerQuery::All => format!(
                "SELECT {} FROM {} ORDER BY applied_at ASC, id ASC",
                columns, self.table
            ),
            LedgerQuery::Batch(_) => format!(
                "SELECT {} FROM {} WHERE batch = $1 AND direction = 'up' ORDER BY id DESC",
                columns, self.table
            ),
            LedgerQuery::Id(_) => {
                format!("SELECT {} FROM {} WHERE id = $1", columns, self.table)
            }
        }
    }

    /// SQL to record a migration as applied
    pub fn insert(&self) -> String {
        format!(
            "INSERT INTO {} (id, name, applied_at, batch, direction, checksum) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table
        )
    }

    /// SQL to remove a migration record
    pub fn delete(&self) -> String {
        format!("DELETE FROM {} WHERE id = $1", self.table)
    }

    /// Advisory lock key for this table, stable across processes
    pub fn lock_key(&self) -> i64 {
        let digest = Sha256::digest(format!("migrator:{}", self.table).as_bytes());
        let mut key = [0u8; 8];
        key.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(key)
    }
}

/// PostgreSQL migration backend
pub struct PostgresBackend {
    pool: PgPool,
    sql: LedgerSql,
}

impl PostgresBackend {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            sql: LedgerSql::new(table),
        }
    }

    /// Open a pool from a resolved connection descriptor
    pub async fn connect(
        database: &DatabaseConfig,
        table: impl Into<String>,
        config: DatabasePoolConfig,
    ) -> MigrationResult<Self> {
        let options = connect_options(database)?;

        let mut pool_options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .test_before_acquire(config.test_before_acquire);

        if let Some(idle_timeout) = config.idle_timeout_seconds {
            pool_options = pool_options.idle_timeout(Duration::from_secs(idle_timeout));
        }

        let pool = pool_options.connect_with(options).await.map_err(|e| {
            MigrationError::connection(format!(
                "failed to connect to {}: {}",
                database.display_url(),
                e
            ))
        })?;

        tracing::debug!(url = %database.display_url(), "connected to database");
        Ok(Self::new(pool, table))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn sql(&self) -> &LedgerSql {
        &self.sql
    }
}

/// Build connect options, resolving secrets at the point of use
pub fn connect_options(database: &DatabaseConfig) -> MigrationResult<PgConnectOptions> {
    let mut options = PgConnectOptions::new()
        .host(&database.host.value())
        .port(database.port_number()?)
        .username(&database.user.value())
        .database(&database.dbname.value());

    let password = database.password.value();
    if !password.is_empty() {
        options = options.password(&password);
    }

    if !database.sslmode.is_empty() {
        let mode = PgSslMode::from_str(&database.sslmode).map_err(|_| {
            ConfigError::invalid_value(
                "sslmode",
                database.sslmode.clone(),
                "disable, allow, prefer, require, verify-ca or verify-full",
            )
        })?;
        options = options.ssl_mode(mode);
    }

    Ok(options)
}

fn entry_from_row(row: &PgRow) -> MigrationResult<LedgerEntry> {
    let column = |name: &str, e: sqlx::Error| {
        MigrationError::ledger(format!("failed to read column '{}': {}", name, e))
    };

    let direction: String = row.try_get("direction").map_err(|e| column("direction", e))?;
    Ok(LedgerEntry {
        id: row.try_get("id").map_err(|e| column("id", e))?,
        name: row.try_get("name").map_err(|e| column("name", e))?,
        applied_at: row.try_get("applied_at").map_err(|e| column("applied_at", e))?,
        batch: row.try_get("batch").map_err(|e| column("batch", e))?,
        direction: direction.parse().map_err(MigrationError::ledger)?,
        checksum: row.try_get("checksum").map_err(|e| column("checksum", e))?,
    })
}

#[async_trait]
impl MigrationBackend for PostgresBackend {
    fn table(&self) -> &str {
        self.sql.table()
    }

    async fn ensure_schema(&self) -> MigrationResult<()> {
        self.pool
            .execute(self.sql.create_table().as_str())
            .await
            .map_err(|e| MigrationError::ledger(format!("failed to create ledger table: {}", e)))?;
        Ok(())
    }

    async fn schema_exists(&self) -> MigrationResult<bool> {
        sqlx::query_scalar::<_, bool>(self.sql.table_exists())
            .bind(self.sql.table())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MigrationError::ledger(format!("failed to look up ledger table: {}", e)))
    }

    async fn max_batch(&self) -> MigrationResult<i32> {
        sqlx::query_scalar::<_, i32>(&self.sql.max_batch())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MigrationError::ledger(format!("failed to get latest batch: {}", e)))
    }

    async fn query(&self, query: LedgerQuery<'_>) -> MigrationResult<Vec<LedgerEntry>> {
        let sql = self.sql.select(&query);
        let statement = sqlx::query(&sql);
        let statement = match query {
            LedgerQuery::All => statement,
            LedgerQuery::Batch(batch) => statement.bind(batch),
            LedgerQuery::Id(id) => statement.bind(id),
        };

        let rows = statement
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrationError::ledger(format!("failed to query ledger: {}", e)))?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn begin(&self) -> MigrationResult<Box<dyn MigrationTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrationError::database(e.to_string()))?;
        Ok(Box::new(PostgresTransaction {
            tx,
            sql: self.sql.clone(),
        }))
    }

    async fn lock(&self) -> MigrationResult<Box<dyn MigrationLock>> {
        let key = self.sql.lock_key();
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| MigrationError::connection(e.to_string()))?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| MigrationError::Lock {
                message: format!("failed to request advisory lock: {}", e),
            })?;

        if !acquired {
            return Err(MigrationError::Locked {
                table: self.sql.table().to_string(),
            });
        }

        tracing::debug!(table = %self.sql.table(), key, "acquired advisory lock");
        Ok(Box::new(PostgresLock {
            conn: Some(conn),
            key,
        }))
    }
}

/// PostgreSQL transaction for a single migration
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    sql: LedgerSql,
}

#[async_trait]
impl MigrationTransaction for PostgresTransaction {
    async fn execute_script(&mut self, script: &str) -> MigrationResult<()> {
        // A bare &str carries no arguments, so sqlx uses the simple protocol
        (&mut *self.tx)
            .execute(script)
            .await
            .map_err(|e| MigrationError::database(e.to_string()))?;
        Ok(())
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> MigrationResult<()> {
        sqlx::query(&self.sql.insert())
            .bind(&entry.id)
            .bind(&entry.name)
            .bind(entry.applied_at)
            .bind(entry.batch)
            .bind(entry.direction.as_str())
            .bind(&entry.checksum)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| MigrationError::ledger(e.to_string()))?;
        Ok(())
    }

    async fn delete_entry(&mut self, id: &str) -> MigrationResult<()> {
        sqlx::query(&self.sql.delete())
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| MigrationError::ledger(e.to_string()))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> MigrationResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| MigrationError::database(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> MigrationResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| MigrationError::database(e.to_string()))
    }
}

/// Session advisory lock held on a pooled connection
pub struct PostgresLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

#[async_trait]
impl MigrationLock for PostgresLock {
    async fn release(self: Box<Self>) -> MigrationResult<()> {
        let mut lock = self;
        let Some(mut conn) = lock.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(lock.key)
            .fetch_one(&mut *conn)
            .await;

        let released = match unlocked {
            Ok(released) => released,
            Err(e) => {
                // The session may still hold the lock, so it must not go back to the pool
                drop(conn.detach());
                return Err(MigrationError::Lock {
                    message: format!("failed to release advisory lock: {}", e),
                });
            }
        };

        if !released {
            tracing::warn!(key = lock.key, "advisory lock was not held at release");
        }
        Ok(())
    }
}

impl Drop for PostgresLock {
    fn drop(&mut self) {
        // Closing the session is the only synchronous way to drop a session lock
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}
