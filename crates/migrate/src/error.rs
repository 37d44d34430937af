//! Error types for the migration engine
//!
//! Errors are grouped by the phase that detects them: registry construction,
//! planning, step execution, and ledger storage. Gateway failures surface as
//! [`DatabaseError`] and are folded into [`MigrateError`] by the engine.

use std::time::Duration;

use thiserror::Error;

use crate::migrations::definitions::{MigrationDirection, MigrationId};

/// Result type alias for connection gateway operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Result type alias for migration engine operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Errors raised by a database backend
#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Unsupported database URL: {0}")]
    UnsupportedUrl(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::Query(err.to_string())
    }
}

/// Malformed migration definitions, detected when the registry is built
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Duplicate migration identifier {id}: '{first}' and '{second}'")]
    DuplicateId {
        id: MigrationId,
        first: String,
        second: String,
    },

    #[error("Migration '{name}' has invalid identifier {id}; identifiers must be positive")]
    InvalidId { id: i64, name: String },

    #[error("Migration {id} has an empty name")]
    EmptyName { id: MigrationId },
}

/// A requested run that cannot be planned. Nothing has been executed yet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Target migration {0} is not registered")]
    UnknownTarget(MigrationId),

    #[error("Applied migration {0} is not registered and cannot be reverted")]
    UnknownApplied(MigrationId),

    #[error("Migration {id} ('{name}') has no down operation and cannot be reverted")]
    Irreversible { id: MigrationId, name: String },

    #[error("Cannot revert {requested} migration(s): only {applied} applied")]
    NotEnoughApplied { requested: usize, applied: usize },
}

/// Stage of a single migration step at which it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStage {
    /// Opening the step transaction
    Begin,
    /// Running the migration's `up` or `down` operation
    Operation,
    /// Writing or deleting the ledger entry
    Ledger,
    /// Committing the step transaction
    Commit,
}

impl std::fmt::Display for StepStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStage::Begin => write!(f, "begin"),
            StepStage::Operation => write!(f, "operation"),
            StepStage::Ledger => write!(f, "ledger write"),
            StepStage::Commit => write!(f, "commit"),
        }
    }
}

/// A migration step that failed mid-batch.
///
/// The failed step was rolled back. Steps in `completed` are durably
/// recorded; steps in `remaining` were never attempted.
#[derive(Debug, Clone, Error)]
#[error("Migration {id} ('{name}') failed during {direction} ({stage}): {cause}")]
pub struct MigrationFailure {
    pub id: MigrationId,
    pub name: String,
    pub direction: MigrationDirection,
    pub stage: StepStage,
    pub cause: String,
    pub completed: Vec<MigrationId>,
    pub remaining: Vec<MigrationId>,
}

/// Top-level error type of the migration engine
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("{0}")]
    Migration(Box<MigrationFailure>),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timed out after {waited:?} waiting for the migration lock")]
    LockTimeout { waited: Duration },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<MigrationFailure> for MigrateError {
    fn from(failure: MigrationFailure) -> Self {
        MigrateError::Migration(Box::new(failure))
    }
}

impl MigrateError {
    /// The failed step, if this error came from executing a batch
    pub fn as_failure(&self) -> Option<&MigrationFailure> {
        match self {
            MigrateError::Migration(failure) => Some(failure),
            _ => None,
        }
    }
}
