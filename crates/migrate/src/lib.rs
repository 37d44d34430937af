//! # keel-migrate: Reversible schema migrations
//!
//! Applies and reverts an ordered set of migrations against PostgreSQL or
//! SQLite, recording progress in a ledger table inside the target database.
//!
//! Each migration runs in its own transaction together with its ledger
//! write, runs are serialized by an exclusive database lock, and every
//! batch is planned completely before the first step executes.

pub mod backends;
pub mod error;
pub mod migrations;

// Re-export core traits and types
pub use backends::{
    connect, mask_password, DatabaseBackendType, DatabasePool, DatabasePoolConfig, DatabaseRow,
    DatabaseTransaction, DatabaseValue, SqlDialect,
};
pub use error::*;
pub use migrations::*;

/// Convenience imports for applications defining migrations
pub mod prelude {
    pub use crate::backends::{DatabaseTransaction, DatabaseValue, SqlDialect};
    pub use crate::error::{DatabaseResult, MigrateError, MigrateResult};
    pub use crate::migrations::{
        AdvanceTarget, Migration, MigrationConfig, MigrationId, MigrationRegistry,
        MigrationRollback, MigrationRunner, RevertTarget, SqlMigration,
    };
    pub use async_trait::async_trait;
}
