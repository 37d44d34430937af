//! Database Backend Abstractions
//!
//! This module provides the connection gateway used by the migration engine
//! and its sqlx-backed PostgreSQL and SQLite implementations.

pub mod core;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use crate::error::{DatabaseError, DatabaseResult};

// Re-export core traits and types
pub use self::core::*;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

/// Database backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    PostgreSQL,
    SQLite,
}

impl std::fmt::Display for DatabaseBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseBackendType::PostgreSQL => write!(f, "postgresql"),
            DatabaseBackendType::SQLite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for DatabaseBackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseBackendType::PostgreSQL),
            "sqlite" => Ok(DatabaseBackendType::SQLite),
            _ => Err(format!("Unsupported database backend: {}", s)),
        }
    }
}

impl DatabaseBackendType {
    /// Detect database backend type from URL
    pub fn from_url(url: &str) -> DatabaseResult<Self> {
        if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            Ok(DatabaseBackendType::PostgreSQL)
        } else if url.starts_with("sqlite:") {
            Ok(DatabaseBackendType::SQLite)
        } else {
            Err(DatabaseError::UnsupportedUrl(mask_password(url)))
        }
    }

    fn backend(&self) -> Box<dyn DatabaseBackend> {
        match self {
            DatabaseBackendType::PostgreSQL => Box::new(PostgresBackend::new()),
            DatabaseBackendType::SQLite => Box::new(SqliteBackend::new()),
        }
    }
}

/// Open a connection pool for `database_url`, picking the backend by scheme
pub async fn connect(
    database_url: &str,
    config: DatabasePoolConfig,
) -> DatabaseResult<Arc<dyn DatabasePool>> {
    let backend_type = DatabaseBackendType::from_url(database_url)?;
    let backend = backend_type.backend();
    backend.validate_database_url(database_url)?;

    tracing::debug!(
        target: "keel::migrate",
        backend = %backend_type,
        url = %mask_password(database_url),
        "Opening database pool"
    );

    backend.create_pool(database_url, config).await
}

/// Replace the password in a database URL for display
pub fn mask_password(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => database_url.to_string(),
    }
}
