//! Migration Ledger - persistent record of applied migrations
//!
//! One row per applied migration, stored in the target database itself so
//! that ledger writes commit in the same transaction as the schema change
//! they describe.

use std::collections::BTreeSet;

use chrono::Utc;

use super::definitions::{LedgerEntry, Migration, MigrationId, DEFAULT_LEDGER_TABLE};
use super::sql::is_plain_identifier;
use crate::backends::{DatabasePool, DatabaseTransaction, DatabaseValue, SqlDialect};
use crate::error::{DatabaseError, MigrateError, MigrateResult};

fn storage(context: &str, err: DatabaseError) -> MigrateError {
    MigrateError::Storage(format!("{}: {}", context, err))
}

/// Access to the ledger table
#[derive(Debug, Clone)]
pub struct MigrationLedger {
    table: String,
}

impl Default for MigrationLedger {
    fn default() -> Self {
        Self {
            table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl MigrationLedger {
    /// Ledger stored in `table`, which must be a plain SQL identifier
    pub fn new(table: impl Into<String>) -> MigrateResult<Self> {
        let table = table.into();
        if !is_plain_identifier(&table) {
            return Err(MigrateError::Configuration(format!(
                "Invalid ledger table name '{}'",
                table
            )));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// SQL to create the ledger table
    pub fn create_table_sql(&self, dialect: SqlDialect) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             identifier BIGINT PRIMARY KEY, \
             name VARCHAR(255) NOT NULL, \
             applied_at {} NOT NULL DEFAULT {})",
            self.table,
            dialect.timestamp_type(),
            dialect.current_timestamp()
        )
    }

    /// Create the ledger table if absent. Safe to call repeatedly.
    pub async fn ensure_initialized(&self, pool: &dyn DatabasePool) -> MigrateResult<()> {
        let sql = self.create_table_sql(pool.sql_dialect());
        pool.execute(&sql, &[])
            .await
            .map_err(|e| storage("Failed to create ledger table", e))?;
        tracing::debug!(target: "keel::migrate", table = %self.table, "Ledger table ready");
        Ok(())
    }

    /// Whether the ledger table exists, without creating it
    pub async fn is_initialized(&self, pool: &dyn DatabasePool) -> MigrateResult<bool> {
        let (sql, name) = match pool.sql_dialect() {
            SqlDialect::PostgreSQL => (
                "SELECT COUNT(*) AS found FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1",
                self.table.to_lowercase(),
            ),
            SqlDialect::SQLite => (
                "SELECT COUNT(*) AS found FROM sqlite_master WHERE type = 'table' AND name = ?",
                self.table.clone(),
            ),
        };

        let rows = pool
            .fetch_all(sql, &[DatabaseValue::String(name)])
            .await
            .map_err(|e| storage("Failed to inspect ledger table", e))?;

        let found = match rows.first() {
            Some(row) => row
                .get_by_index(0)
                .and_then(|v| v.as_i64())
                .map_err(|e| storage("Failed to inspect ledger table", e))?,
            None => 0,
        };
        Ok(found > 0)
    }

    /// Applied entries, oldest application first
    pub async fn applied(&self, pool: &dyn DatabasePool) -> MigrateResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT identifier, name, applied_at FROM {} ORDER BY applied_at ASC, identifier ASC",
            self.table
        );
        let rows = pool
            .fetch_all(&sql, &[])
            .await
            .map_err(|e| storage("Failed to read ledger", e))?;

        rows.iter()
            .map(|row| {
                let id = row.get_by_name("identifier")?.as_i64()?;
                let name = row.get_by_name("name")?.as_string()?;
                let applied_at = row.get_by_name("applied_at")?.as_datetime()?;
                Ok(LedgerEntry {
                    id: MigrationId::new(id),
                    name,
                    applied_at,
                })
            })
            .collect::<Result<Vec<_>, DatabaseError>>()
            .map_err(|e| storage("Malformed ledger entry", e))
    }

    /// Identifiers of all applied migrations
    pub async fn applied_identifiers(
        &self,
        pool: &dyn DatabasePool,
    ) -> MigrateResult<BTreeSet<MigrationId>> {
        Ok(self.applied(pool).await?.into_iter().map(|e| e.id).collect())
    }

    /// Record `migration` as applied inside the step transaction
    pub async fn record_applied(
        &self,
        tx: &mut dyn DatabaseTransaction,
        migration: &dyn Migration,
    ) -> MigrateResult<()> {
        let dialect = tx.dialect();
        let sql = format!(
            "INSERT INTO {} (identifier, name, applied_at) VALUES ({}, {}, {})",
            self.table,
            dialect.parameter_placeholder(0),
            dialect.parameter_placeholder(1),
            dialect.parameter_placeholder(2)
        );
        let params = [
            DatabaseValue::Int64(migration.id().value()),
            DatabaseValue::String(migration.name().to_string()),
            DatabaseValue::DateTime(Utc::now()),
        ];

        tx.execute(&sql, &params)
            .await
            .map_err(|e| storage("Failed to record migration", e))?;
        Ok(())
    }

    /// Delete the entry for `id` inside the step transaction
    pub async fn record_reverted(
        &self,
        tx: &mut dyn DatabaseTransaction,
        id: MigrationId,
    ) -> MigrateResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE identifier = {}",
            self.table,
            tx.dialect().parameter_placeholder(0)
        );

        let affected = tx
            .execute(&sql, &[DatabaseValue::Int64(id.value())])
            .await
            .map_err(|e| storage("Failed to remove migration record", e))?;

        if affected == 0 {
            return Err(MigrateError::Storage(format!(
                "Migration {} is not recorded in ledger table '{}'",
                id, self.table
            )));
        }
        Ok(())
    }
}
