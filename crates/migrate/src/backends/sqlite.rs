//! SQLite Backend Implementation
//!
//! sqlx-backed SQLite gateway. SQLite has no advisory locks, so a run lock is
//! an open `BEGIN EXCLUSIVE` on a sidecar lock file next to the database,
//! held by a dedicated connection. SQLite file locks belong to the connection,
//! so the lock ends with the session: on release, when the pool closes, or
//! when the holding process dies.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, ConnectOptions, Connection, Pool, Row, Sqlite, TypeInfo, ValueRef};

use super::core::*;
use crate::error::{DatabaseError, DatabaseResult};

type SqliteQuery<'a> = sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>>;

/// Text layout used for timestamps; sorts lexically in time order
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// SQLite database backend implementation
#[derive(Debug, Default)]
pub struct SqliteBackend;

impl SqliteBackend {
    /// Create a new SQLite backend instance
    pub fn new() -> Self {
        Self
    }
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Sidecar file guarding run lock `key` for the database at `database`
pub fn lock_file_path(database: &Path, key: i64) -> PathBuf {
    let mut name = OsString::from(database.as_os_str());
    name.push(format!(".lock-{:016x}", key as u64));
    PathBuf::from(name)
}

/// Run locks held through one pool: the session connection per key, or `None`
/// for in-memory databases, which no other process can reach.
type HeldLocks = Arc<Mutex<HashMap<i64, Option<SqliteConnection>>>>;

fn held_locks_poisoned<T>(_: T) -> DatabaseError {
    DatabaseError::Connection("Run lock registry poisoned".to_string())
}

/// `SQLITE_BUSY` or `SQLITE_LOCKED`, including their extended codes
fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map_or(false, |code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    }
}

/// Open a session on `path` and take its exclusive lock without waiting.
///
/// Returns `None` when another session holds it.
async fn open_lock_session(path: &Path) -> DatabaseResult<Option<SqliteConnection>> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(Duration::ZERO);

    let mut conn = match options.connect().await {
        Ok(conn) => conn,
        Err(e) if is_busy(&e) => return Ok(None),
        Err(e) => {
            return Err(DatabaseError::Connection(format!(
                "Failed to open lock file {}: {}",
                path.display(),
                e
            )))
        }
    };

    match sqlx::query("BEGIN EXCLUSIVE").execute(&mut conn).await {
        Ok(_) => Ok(Some(conn)),
        Err(e) if is_busy(&e) => {
            let _ = conn.close().await;
            Ok(None)
        }
        Err(e) => Err(DatabaseError::Query(format!("Lock acquisition failed: {}", e))),
    }
}

async fn end_lock_session(mut conn: SqliteConnection) -> DatabaseResult<()> {
    sqlx::query("ROLLBACK")
        .execute(&mut conn)
        .await
        .map_err(|e| DatabaseError::Query(format!("Lock release failed: {}", e)))?;
    conn.close()
        .await
        .map_err(|e| DatabaseError::Connection(format!("Failed to close lock session: {}", e)))
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn create_pool(
        &self,
        database_url: &str,
        config: DatabasePoolConfig,
    ) -> DatabaseResult<Arc<dyn DatabasePool>> {
        let connect_options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DatabaseError::Connection(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.acquire_timeout_seconds));
        let database_file = if is_in_memory(database_url) {
            None
        } else {
            Some(connect_options.clone().get_filename().into_owned())
        };

        // Every connection to an in-memory database sees its own database, so
        // the pool must hold exactly one connection and never recycle it.
        let options = if is_in_memory(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .idle_timeout(config.idle_timeout_seconds.map(Duration::from_secs))
                .max_lifetime(config.max_lifetime_seconds.map(Duration::from_secs))
        };
        let options = options
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .test_before_acquire(config.test_before_acquire);

        let pool = options.connect_with(connect_options).await.map_err(|e| {
            DatabaseError::Connection(format!("Failed to create SQLite pool: {}", e))
        })?;

        let pool = SqlitePool::new(pool);
        Ok(Arc::new(match database_file {
            Some(file) => pool.with_database_file(file),
            None => pool,
        }))
    }

    fn sql_dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }

    fn validate_database_url(&self, url: &str) -> DatabaseResult<()> {
        if !url.starts_with("sqlite:") {
            return Err(DatabaseError::Connection(
                "Invalid SQLite URL scheme".to_string(),
            ));
        }
        Ok(())
    }
}

/// SQLite connection pool implementation
#[derive(Clone)]
pub struct SqlitePool {
    pool: Pool<Sqlite>,
    /// Backing file; `None` keeps run locks inside this process
    database_file: Option<PathBuf>,
    held_locks: HeldLocks,
}

impl SqlitePool {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            database_file: None,
            held_locks: HeldLocks::default(),
        }
    }

    /// Guard run locks with sidecar files next to `file`
    pub fn with_database_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.database_file = Some(file.into());
        self
    }
}

#[async_trait]
impl DatabasePool for SqlitePool {
    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> DatabaseResult<u64> {
        let result = bind_all(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Query(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DatabaseResult<Vec<Box<dyn DatabaseRow>>> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(into_rows(rows))
    }

    async fn begin_transaction(&self) -> DatabaseResult<Box<dyn DatabaseTransaction>> {
        let tx = self.pool.begin().await.map_err(|e| {
            DatabaseError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        Ok(Box::new(SqliteTransaction { tx: Some(tx) }))
    }

    async fn try_lock(&self, key: i64) -> DatabaseResult<Option<Box<dyn LockHandle>>> {
        if self
            .held_locks
            .lock()
            .map_err(held_locks_poisoned)?
            .contains_key(&key)
        {
            return Ok(None);
        }

        let session = match &self.database_file {
            Some(file) => match open_lock_session(&lock_file_path(file, key)).await? {
                Some(conn) => Some(conn),
                None => return Ok(None),
            },
            None => None,
        };

        let mut held = self.held_locks.lock().map_err(held_locks_poisoned)?;
        if held.contains_key(&key) {
            return Ok(None);
        }
        held.insert(key, session);

        Ok(Some(Box::new(SqliteLock {
            held_locks: Some(self.held_locks.clone()),
            key,
        })))
    }

    fn sql_dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }

    async fn close(&self) -> DatabaseResult<()> {
        self.pool.close().await;

        // Ends the sessions of locks whose handles were never released
        let sessions: Vec<(i64, SqliteConnection)> = self
            .held_locks
            .lock()
            .map_err(held_locks_poisoned)?
            .drain()
            .filter_map(|(key, session)| session.map(|conn| (key, conn)))
            .collect();
        for (key, conn) in sessions {
            tracing::warn!(target: "keel::migrate", lock_key = key, "Releasing run lock held at pool close");
            end_lock_session(conn).await?;
        }
        Ok(())
    }
}

/// SQLite transaction implementation
pub struct SqliteTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl SqliteTransaction {
    fn active(&mut self) -> DatabaseResult<&mut sqlx::Transaction<'static, Sqlite>> {
        self.tx
            .as_mut()
            .ok_or_else(|| DatabaseError::Transaction("Transaction already completed".to_string()))
    }
}

#[async_trait]
impl DatabaseTransaction for SqliteTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DatabaseResult<u64> {
        let query = bind_all(sqlx::query(sql), params);
        let tx = self.active()?;

        let result = query
            .execute(&mut **tx)
            .await
            .map_err(|e| DatabaseError::Query(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DatabaseResult<Vec<Box<dyn DatabaseRow>>> {
        let query = bind_all(sqlx::query(sql), params);
        let tx = self.active()?;

        let rows = query
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| DatabaseError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(into_rows(rows))
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }

    async fn commit(mut self: Box<Self>) -> DatabaseResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| DatabaseError::Transaction("Transaction already completed".to_string()))?;

        tx.commit().await.map_err(|e| {
            DatabaseError::Transaction(format!("Transaction commit failed: {}", e))
        })
    }

    async fn rollback(mut self: Box<Self>) -> DatabaseResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| DatabaseError::Transaction("Transaction already completed".to_string()))?;

        tx.rollback().await.map_err(|e| {
            DatabaseError::Transaction(format!("Transaction rollback failed: {}", e))
        })
    }
}

/// Run lock held through a `SqlitePool`
struct SqliteLock {
    held_locks: Option<HeldLocks>,
    key: i64,
}

impl SqliteLock {
    fn take_session(&mut self) -> DatabaseResult<Option<Option<SqliteConnection>>> {
        let Some(held_locks) = self.held_locks.take() else {
            return Ok(None);
        };
        let session = held_locks
            .lock()
            .map_err(held_locks_poisoned)?
            .remove(&self.key);
        Ok(session)
    }
}

#[async_trait]
impl LockHandle for SqliteLock {
    fn key(&self) -> i64 {
        self.key
    }

    async fn release(mut self: Box<Self>) -> DatabaseResult<()> {
        match self.take_session()? {
            Some(Some(conn)) => end_lock_session(conn).await,
            Some(None) => Ok(()),
            None => {
                tracing::warn!(
                    target: "keel::migrate",
                    lock_key = self.key,
                    "Run lock was already released by pool close"
                );
                Ok(())
            }
        }
    }
}

impl Drop for SqliteLock {
    fn drop(&mut self) {
        // Dropping the session connection closes it, which ends its lock
        if let Err(e) = self.take_session() {
            tracing::error!(target: "keel::migrate", lock_key = self.key, error = %e, "Failed to release dropped lock");
        }
    }
}

/// SQLite row implementation
pub struct SqliteRowValue {
    row: SqliteRow,
}

impl DatabaseRow for SqliteRowValue {
    fn get_by_index(&self, index: usize) -> DatabaseResult<DatabaseValue> {
        sqlite_value_to_database_value(&self.row, index)
    }

    fn get_by_name(&self, name: &str) -> DatabaseResult<DatabaseValue> {
        let index = self
            .row
            .columns()
            .iter()
            .position(|col| col.name() == name)
            .ok_or_else(|| DatabaseError::Query(format!("Column '{}' not found", name)))?;

        sqlite_value_to_database_value(&self.row, index)
    }

    fn column_count(&self) -> usize {
        self.row.len()
    }
}

fn into_rows(rows: Vec<SqliteRow>) -> Vec<Box<dyn DatabaseRow>> {
    rows.into_iter()
        .map(|row| Box::new(SqliteRowValue { row }) as Box<dyn DatabaseRow>)
        .collect()
}

fn bind_all<'a>(mut query: SqliteQuery<'a>, params: &[DatabaseValue]) -> SqliteQuery<'a> {
    for param in params {
        query = bind_database_value(query, param);
    }
    query
}

/// Bind a DatabaseValue to a sqlx query. Uuids and timestamps are stored as text.
fn bind_database_value<'a>(query: SqliteQuery<'a>, value: &DatabaseValue) -> SqliteQuery<'a> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Uuid(u) => query.bind(u.to_string()),
        DatabaseValue::DateTime(dt) => query.bind(dt.format(TIMESTAMP_FORMAT).to_string()),
    }
}

/// Convert a SQLite column value to DatabaseValue by its storage class
fn sqlite_value_to_database_value(row: &SqliteRow, index: usize) -> DatabaseResult<DatabaseValue> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| DatabaseError::Query(format!("Failed to read column {}: {}", index, e)))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = raw.type_info().name().to_string();
    let decode_err = |e: sqlx::Error| {
        DatabaseError::Query(format!("Failed to decode {} column {}: {}", type_name, index, e))
    };

    let value = match type_name.as_str() {
        "BOOLEAN" => DatabaseValue::Bool(row.try_get_unchecked(index).map_err(decode_err)?),
        "INTEGER" => DatabaseValue::Int64(row.try_get_unchecked(index).map_err(decode_err)?),
        "REAL" | "NUMERIC" => DatabaseValue::Float64(row.try_get_unchecked(index).map_err(decode_err)?),
        _ => DatabaseValue::String(row.try_get_unchecked(index).map_err(decode_err)?),
    };
    Ok(value)
}
