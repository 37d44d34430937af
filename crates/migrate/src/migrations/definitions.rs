//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the fundamental types used throughout the migration system: the
//! ordered identifier, the `Migration` trait, SQL-backed migrations, run
//! targets, configuration, and the reports handed back to callers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sql;
use crate::backends::DatabaseTransaction;
use crate::error::{DatabaseError, DatabaseResult, MigrateError, MigrateResult};

/// Ordered, timestamp-derived migration identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(i64);

impl MigrationId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MigrationId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FromStr for MigrationId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(MigrationId)
            .map_err(|_| format!("Invalid migration identifier: '{}'", s))
    }
}

/// A single named, ordered unit of schema change.
///
/// `up` runs inside the step transaction together with the ledger write.
/// Migrations that can be undone override both `down` and `is_reversible`;
/// planning refuses to revert anything that reports itself irreversible.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Identifier defining the total order of migrations
    fn id(&self) -> MigrationId;

    /// Human-readable name used in diagnostics
    fn name(&self) -> &str;

    /// Apply the schema change
    async fn up(&self, tx: &mut dyn DatabaseTransaction) -> DatabaseResult<()>;

    /// Whether `down` is defined for this migration
    fn is_reversible(&self) -> bool {
        false
    }

    /// Undo the schema change
    async fn down(&self, _tx: &mut dyn DatabaseTransaction) -> DatabaseResult<()> {
        Err(DatabaseError::Query(format!(
            "Migration {} ('{}') has no down operation",
            self.id(),
            self.name()
        )))
    }
}

#[cfg(test)]
impl<'a> std::fmt::Debug for dyn Migration + 'a {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Migration({}, {:?})", self.id(), self.name())
    }
}

/// Migration defined by raw SQL scripts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlMigration {
    pub id: MigrationId,
    pub name: String,
    /// SQL statements to apply the migration
    pub up_sql: String,
    /// SQL statements to roll back the migration, if any
    pub down_sql: Option<String>,
}

impl SqlMigration {
    pub fn new(
        id: impl Into<MigrationId>,
        name: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            up_sql: up_sql.into(),
            down_sql: down_sql.filter(|sql| !sql.trim().is_empty()),
        }
    }

    /// Build a migration from a script with `-- Up` and `-- Down` sections.
    ///
    /// Typically fed with `include_str!` so migrations are compiled in.
    pub fn parse(
        id: impl Into<MigrationId>,
        name: impl Into<String>,
        content: &str,
    ) -> MigrateResult<Self> {
        let id = id.into();
        let sections = sql::parse_sections(content);
        if sections.up.is_empty() {
            return Err(MigrateError::Configuration(format!(
                "Migration {} has no '-- Up' section",
                id
            )));
        }
        Ok(Self::new(id, name, sections.up, sections.down))
    }

    async fn run_script(tx: &mut dyn DatabaseTransaction, script: &str) -> DatabaseResult<()> {
        for statement in sql::split_sql_statements(script) {
            tx.execute(&statement, &[]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn id(&self) -> MigrationId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, tx: &mut dyn DatabaseTransaction) -> DatabaseResult<()> {
        Self::run_script(tx, &self.up_sql).await
    }

    fn is_reversible(&self) -> bool {
        self.down_sql.is_some()
    }

    async fn down(&self, tx: &mut dyn DatabaseTransaction) -> DatabaseResult<()> {
        match &self.down_sql {
            Some(script) => Self::run_script(tx, script).await,
            None => Err(DatabaseError::Query(format!(
                "Migration {} ('{}') has no down operation",
                self.id, self.name
            ))),
        }
    }
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Apply the migration (run UP statements)
    Up,
    /// Rollback the migration (run DOWN statements)
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "up"),
            MigrationDirection::Down => write!(f, "down"),
        }
    }
}

/// How far `advance` should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceTarget {
    /// Apply every pending migration
    Latest,
    /// Apply pending migrations up to and including this identifier
    To(MigrationId),
}

/// How far `revert` should go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertTarget {
    /// Revert this many of the most recently applied migrations
    Steps(usize),
    /// Revert every applied migration above this identifier (exclusive)
    To(MigrationId),
    /// Revert every applied migration
    All,
}

impl Default for RevertTarget {
    fn default() -> Self {
        RevertTarget::Steps(1)
    }
}

/// Default name of the ledger table
pub const DEFAULT_LEDGER_TABLE: &str = "migrations";

/// Configuration for the migration system
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Table name for tracking applied migrations
    pub ledger_table: String,
    /// Key of the exclusive run lock; derived from the ledger table when unset
    pub lock_key: Option<i64>,
    /// How long to wait for the run lock; `None` waits indefinitely
    pub lock_timeout: Option<Duration>,
    /// Delay between lock attempts
    pub lock_poll_interval: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            lock_key: None,
            lock_timeout: None,
            lock_poll_interval: Duration::from_millis(100),
        }
    }
}

impl MigrationConfig {
    pub fn with_ledger_table(mut self, table: impl Into<String>) -> Self {
        self.ledger_table = table.into();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_key(mut self, key: i64) -> Self {
        self.lock_key = Some(key);
        self
    }

    /// The run lock key in effect
    pub fn effective_lock_key(&self) -> i64 {
        self.lock_key
            .unwrap_or_else(|| super::lock::lock_key_for(&self.ledger_table))
    }

    /// Validate the configuration
    pub fn validate(&self) -> MigrateResult<()> {
        if !sql::is_plain_identifier(&self.ledger_table) {
            return Err(MigrateError::Configuration(format!(
                "Ledger table name '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                self.ledger_table
            )));
        }
        if self.lock_poll_interval.is_zero() {
            return Err(MigrateError::Configuration(
                "Lock poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of an `advance` or `revert` batch
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub direction: MigrationDirection,
    /// Identifiers processed, in processing order
    pub processed: Vec<MigrationId>,
    /// Planned identifiers left unprocessed because the run was cancelled
    pub remaining: Vec<MigrationId>,
    pub cancelled: bool,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl RunReport {
    pub(crate) fn empty(direction: MigrationDirection) -> Self {
        Self {
            direction,
            processed: Vec::new(),
            remaining: Vec::new(),
            cancelled: false,
            execution_time_ms: 0,
        }
    }

    /// Whether nothing was processed
    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    /// Number of migrations processed
    pub fn count(&self) -> usize {
        self.processed.len()
    }
}

/// State of one registered migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    /// Recorded in the ledger
    Applied { applied_at: DateTime<Utc> },
    /// Not applied; the next `advance` will pick it up
    Pending,
    /// Not applied, but a later migration already is; `advance` never applies it
    Skipped,
}

/// Status of one registered migration
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusEntry {
    pub id: MigrationId,
    pub name: String,
    #[serde(flatten)]
    pub state: MigrationState,
}

impl MigrationStatusEntry {
    pub fn is_applied(&self) -> bool {
        matches!(self.state, MigrationState::Applied { .. })
    }

    pub fn applied_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            MigrationState::Applied { applied_at } => Some(applied_at),
            _ => None,
        }
    }
}

/// Ledger row as read back from the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: MigrationId,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Migration status for every registered migration plus unknown ledger rows
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusReport {
    /// One entry per registered migration, ordered by identifier
    pub entries: Vec<MigrationStatusEntry>,
    /// Ledger entries with no registered migration
    pub orphaned: Vec<LedgerEntry>,
}

impl MigrationStatusReport {
    pub fn applied_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_applied()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.count_state(|s| matches!(s, MigrationState::Pending))
    }

    pub fn skipped_count(&self) -> usize {
        self.count_state(|s| matches!(s, MigrationState::Skipped))
    }

    /// Whether every registered migration is applied
    pub fn is_current(&self) -> bool {
        self.pending_count() == 0 && self.skipped_count() == 0
    }

    pub fn get(&self, id: MigrationId) -> Option<&MigrationStatusEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn count_state(&self, pred: impl Fn(&MigrationState) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.state)).count()
    }
}
