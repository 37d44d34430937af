//! PostgreSQL Backend Implementation
//!
//! This module provides the PostgreSQL-specific implementation of the database
//! backend traits using sqlx as the underlying database driver. The run lock
//! maps to a session-level advisory lock held on a dedicated connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, Pool, Postgres, Row, TypeInfo, ValueRef};

use super::core::*;
use crate::error::{DatabaseError, DatabaseResult};

type PgQuery<'a> = sqlx::query::Query<'a, Postgres, PgArguments>;

/// PostgreSQL database backend implementation
#[derive(Debug, Default)]
pub struct PostgresBackend;

impl PostgresBackend {
    /// Create a new PostgreSQL backend instance
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    async fn create_pool(
        &self,
        database_url: &str,
        config: DatabasePoolConfig,
    ) -> DatabaseResult<Arc<dyn DatabasePool>> {
        let options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .idle_timeout(config.idle_timeout_seconds.map(Duration::from_secs))
            .max_lifetime(config.max_lifetime_seconds.map(Duration::from_secs))
            .test_before_acquire(config.test_before_acquire);

        let pool = options.connect(database_url).await.map_err(|e| {
            DatabaseError::Connection(format!("Failed to create PostgreSQL pool: {}", e))
        })?;

        Ok(Arc::new(PostgresPool::new(pool)))
    }

    fn sql_dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }

    fn validate_database_url(&self, url: &str) -> DatabaseResult<()> {
        let parsed = url::Url::parse(url)
            .map_err(|e| DatabaseError::Connection(format!("Invalid database URL: {}", e)))?;

        if parsed.scheme() != "postgres" && parsed.scheme() != "postgresql" {
            return Err(DatabaseError::Connection(
                "Invalid PostgreSQL URL scheme".to_string(),
            ));
        }
        if parsed.host_str().is_none() {
            return Err(DatabaseError::Connection(
                "Missing host in database URL".to_string(),
            ));
        }
        if parsed.path().trim_start_matches('/').is_empty() {
            return Err(DatabaseError::Connection(
                "Missing database name in URL".to_string(),
            ));
        }
        Ok(())
    }
}

/// PostgreSQL connection pool implementation
pub struct PostgresPool {
    pool: Pool<Postgres>,
}

impl PostgresPool {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> DatabaseResult<u64> {
        let result = bind_all(sqlx::query(sql), params)?
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
        let rows = bind_all(sqlx::query(sql), params)?
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(into_rows(rows))
    }

    async fn begin_transaction(&self) -> DatabaseResult<Box<dyn DatabaseTransaction>> {
        let tx = self.pool.begin().await.map_err(|e| {
            DatabaseError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        Ok(Box::new(PostgresTransaction::new(tx)))
    }

    async fn try_lock(&self, key: i64) -> DatabaseResult<Option<Box<dyn LockHandle>>> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            DatabaseError::Connection(format!("Failed to acquire connection: {}", e))
        })?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| DatabaseError::Query(format!("Advisory lock query failed: {}", e)))?;

        if acquired {
            Ok(Some(Box::new(PostgresLock {
                conn: Some(conn),
                key,
            })))
        } else {
            Ok(None)
        }
    }

    fn sql_dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }

    async fn close(&self) -> DatabaseResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// PostgreSQL transaction implementation
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    pub fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self { tx: Some(tx) }
    }

    fn active(&mut self) -> DatabaseResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| DatabaseError::Transaction("Transaction already completed".to_string()))
    }
}

#[async_trait]
impl DatabaseTransaction for PostgresTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DatabaseResult<u64> {
        let query = bind_all(sqlx::query(sql), params)?;
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
        let query = bind_all(sqlx::query(sql), params)?;
        let tx = self.active()?;

        let rows = query
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| DatabaseError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(into_rows(rows))
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
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

/// Session-level advisory lock pinned to one pooled connection
struct PostgresLock {
    conn: Option<sqlx::pool::PoolConnection<Postgres>>,
    key: i64,
}

#[async_trait]
impl LockHandle for PostgresLock {
    fn key(&self) -> i64 {
        self.key
    }

    async fn release(mut self: Box<Self>) -> DatabaseResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| DatabaseError::Query(format!("Advisory unlock failed: {}", e)))?;

        if !released {
            tracing::warn!(
                target: "keel::migrate",
                lock_key = self.key,
                "Advisory lock was not held at release"
            );
        }
        Ok(())
    }
}

impl Drop for PostgresLock {
    fn drop(&mut self) {
        // Closing the session is the only way to drop a session lock without
        // a round trip; never hand a locked connection back to the pool.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// PostgreSQL row implementation
pub struct PostgresRow {
    row: PgRow,
}

impl PostgresRow {
    pub fn new(row: PgRow) -> Self {
        Self { row }
    }
}

impl DatabaseRow for PostgresRow {
    fn get_by_index(&self, index: usize) -> DatabaseResult<DatabaseValue> {
        postgres_value_to_database_value(&self.row, index)
    }

    fn get_by_name(&self, name: &str) -> DatabaseResult<DatabaseValue> {
        let index = self
            .row
            .columns()
            .iter()
            .position(|col| col.name() == name)
            .ok_or_else(|| DatabaseError::Query(format!("Column '{}' not found", name)))?;

        postgres_value_to_database_value(&self.row, index)
    }

    fn column_count(&self) -> usize {
        self.row.len()
    }
}

fn into_rows(rows: Vec<PgRow>) -> Vec<Box<dyn DatabaseRow>> {
    rows.into_iter()
        .map(|row| Box::new(PostgresRow::new(row)) as Box<dyn DatabaseRow>)
        .collect()
}

fn bind_all<'a>(mut query: PgQuery<'a>, params: &[DatabaseValue]) -> DatabaseResult<PgQuery<'a>> {
    for param in params {
        query = bind_database_value(query, param);
    }
    Ok(query)
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'a>(query: PgQuery<'a>, value: &DatabaseValue) -> PgQuery<'a> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Uuid(u) => query.bind(*u),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
    }
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> DatabaseResult<DatabaseValue> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| DatabaseError::Query(format!("Failed to read column {}: {}", index, e)))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name().to_string();
    let decode_err = |e: sqlx::Error| {
        DatabaseError::Query(format!("Failed to decode {} column {}: {}", type_name, index, e))
    };

    let value = match type_name.as_str() {
        "BOOL" => DatabaseValue::Bool(row.try_get(index).map_err(decode_err)?),
        "INT2" => DatabaseValue::Int32(i32::from(row.try_get::<i16, _>(index).map_err(decode_err)?)),
        "INT4" => DatabaseValue::Int32(row.try_get(index).map_err(decode_err)?),
        "INT8" => DatabaseValue::Int64(row.try_get(index).map_err(decode_err)?),
        "FLOAT4" => DatabaseValue::Float64(f64::from(row.try_get::<f32, _>(index).map_err(decode_err)?)),
        "FLOAT8" => DatabaseValue::Float64(row.try_get(index).map_err(decode_err)?),
        "UUID" => DatabaseValue::Uuid(row.try_get(index).map_err(decode_err)?),
        "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index).map_err(decode_err)?),
        "TIMESTAMP" => {
            let naive: chrono::NaiveDateTime = row.try_get(index).map_err(decode_err)?;
            DatabaseValue::DateTime(naive.and_utc())
        }
        _ => DatabaseValue::String(row.try_get_unchecked(index).map_err(decode_err)?),
    };
    Ok(value)
}
