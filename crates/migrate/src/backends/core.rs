//! Core Database Backend Traits
//!
//! The connection gateway the migration engine is written against. The engine
//! never touches a driver directly: it executes statements, opens one
//! transaction per step, and takes the run lock through these traits.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{DatabaseError, DatabaseResult};

/// Abstract database connection pool trait
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Execute a statement outside any transaction and return affected rows
    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> DatabaseResult<u64>;

    /// Execute a query and return the result rows
    async fn fetch_all(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DatabaseResult<Vec<Box<dyn DatabaseRow>>>;

    /// Begin a transaction on a pooled connection
    async fn begin_transaction(&self) -> DatabaseResult<Box<dyn DatabaseTransaction>>;

    /// Try to take the exclusive lock identified by `key` without blocking.
    ///
    /// Returns `None` when another session holds it.
    async fn try_lock(&self, key: i64) -> DatabaseResult<Option<Box<dyn LockHandle>>>;

    /// Get the SQL dialect spoken by this pool
    fn sql_dialect(&self) -> SqlDialect;

    /// Close the pool
    async fn close(&self) -> DatabaseResult<()>;
}

/// Abstract database transaction trait
///
/// A transaction dropped without `commit` is rolled back by the driver.
#[async_trait]
pub trait DatabaseTransaction: Send {
    /// Execute a statement within the transaction
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DatabaseResult<u64>;

    /// Execute a query and return result rows within the transaction
    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DatabaseResult<Vec<Box<dyn DatabaseRow>>>;

    /// Get the SQL dialect of the underlying connection
    fn dialect(&self) -> SqlDialect;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> DatabaseResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> DatabaseResult<()>;
}

/// An acquired run lock. Must be released explicitly.
#[async_trait]
pub trait LockHandle: Send {
    /// The key this handle holds
    fn key(&self) -> i64;

    /// Release the lock
    async fn release(self: Box<Self>) -> DatabaseResult<()>;
}

/// Abstract database row trait
pub trait DatabaseRow: Send + Sync {
    /// Get a column value by index
    fn get_by_index(&self, index: usize) -> DatabaseResult<DatabaseValue>;

    /// Get a column value by name
    fn get_by_name(&self, name: &str) -> DatabaseResult<DatabaseValue>;

    /// Get column count
    fn column_count(&self) -> usize;
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Uuid(uuid::Uuid),
    DateTime(DateTime<Utc>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Read the value as a 64-bit integer
    pub fn as_i64(&self) -> DatabaseResult<i64> {
        match self {
            DatabaseValue::Int32(i) => Ok(i64::from(*i)),
            DatabaseValue::Int64(i) => Ok(*i),
            DatabaseValue::String(s) => s
                .trim()
                .parse()
                .map_err(|_| DatabaseError::Query(format!("Expected integer, got '{}'", s))),
            other => Err(DatabaseError::Query(format!(
                "Expected integer, got {:?}",
                other
            ))),
        }
    }

    /// Read the value as text
    pub fn as_string(&self) -> DatabaseResult<String> {
        match self {
            DatabaseValue::String(s) => Ok(s.clone()),
            DatabaseValue::Uuid(u) => Ok(u.to_string()),
            other => Err(DatabaseError::Query(format!("Expected text, got {:?}", other))),
        }
    }

    /// Read the value as a UTC timestamp.
    ///
    /// Backends without a native timestamp type hand back text; both RFC 3339
    /// and `YYYY-MM-DD HH:MM:SS[.ffffff]` are accepted.
    pub fn as_datetime(&self) -> DatabaseResult<DateTime<Utc>> {
        match self {
            DatabaseValue::DateTime(dt) => Ok(*dt),
            DatabaseValue::String(s) => parse_timestamp(s),
            other => Err(DatabaseError::Query(format!(
                "Expected timestamp, got {:?}",
                other
            ))),
        }
    }
}

fn parse_timestamp(raw: &str) -> DatabaseResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| DatabaseError::Query(format!("Invalid timestamp '{}': {}", raw, e)))
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<uuid::Uuid> for DatabaseValue {
    fn from(value: uuid::Uuid) -> Self {
        DatabaseValue::Uuid(value)
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(value: DateTime<Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// SQL dialect enumeration for generating database-specific SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    PostgreSQL,
    SQLite,
}

impl SqlDialect {
    /// Get the parameter placeholder style for this dialect
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Get the current timestamp expression for this dialect
    pub fn current_timestamp(&self) -> &'static str {
        match self {
            SqlDialect::PostgreSQL => "NOW()",
            SqlDialect::SQLite => "CURRENT_TIMESTAMP",
        }
    }

    /// Column type used for UTC timestamps
    pub fn timestamp_type(&self) -> &'static str {
        match self {
            SqlDialect::PostgreSQL => "TIMESTAMPTZ",
            SqlDialect::SQLite => "TEXT",
        }
    }
}

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct DatabasePoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: Option<u64>,
    pub max_lifetime_seconds: Option<u64>,
    pub test_before_acquire: bool,
}

impl Default for DatabasePoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 0,
            acquire_timeout_seconds: 30,
            idle_timeout_seconds: Some(600),  // 10 minutes
            max_lifetime_seconds: Some(1800), // 30 minutes
            test_before_acquire: true,
        }
    }
}

/// Database backend trait that provides database-specific implementations
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Create a connection pool from a database URL
    async fn create_pool(
        &self,
        database_url: &str,
        config: DatabasePoolConfig,
    ) -> DatabaseResult<std::sync::Arc<dyn DatabasePool>>;

    /// Get the SQL dialect used by this backend
    fn sql_dialect(&self) -> SqlDialect;

    /// Validate a database URL for this backend
    fn validate_database_url(&self, url: &str) -> DatabaseResult<()>;
}
