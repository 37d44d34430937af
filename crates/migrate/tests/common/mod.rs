#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_migrate::prelude::*;
use keel_migrate::{connect, DatabasePool, DatabasePoolConfig};
use tempfile::TempDir;

/// A SQLite database file that lives as long as the value
pub struct TestDb {
    _dir: TempDir,
    pub url: String,
    pub pool: Arc<dyn DatabasePool>,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let url = format!("sqlite://{}", dir.path().join("migrate.db").display());
        let pool = connect(&url, DatabasePoolConfig::default())
            .await
            .expect("sqlite pool");
        Self { _dir: dir, url, pool }
    }

    /// An independent pool on the same file, standing in for another process
    pub async fn second_pool(&self) -> Arc<dyn DatabasePool> {
        connect(&self.url, DatabasePoolConfig::default())
            .await
            .expect("second sqlite pool")
    }

    pub fn runner(&self, registry: MigrationRegistry) -> MigrationRunner {
        self.runner_with(registry, MigrationConfig::default())
    }

    pub fn runner_with(&self, registry: MigrationRegistry, config: MigrationConfig) -> MigrationRunner {
        MigrationRunner::new(Arc::new(registry), self.pool.clone(), config).expect("runner")
    }

    pub async fn table_exists(&self, table: &str) -> bool {
        count(
            self.pool.as_ref(),
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            table,
        )
        .await
            > 0
    }

    pub async fn column_exists(&self, table: &str, column: &str) -> bool {
        let sql = format!("SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = ?", table);
        count(self.pool.as_ref(), &sql, column).await > 0
    }

    pub async fn ledger_ids(&self) -> Vec<i64> {
        let rows = self
            .pool
            .fetch_all("SELECT identifier FROM migrations ORDER BY identifier", &[])
            .await
            .expect("ledger rows");
        rows.iter()
            .map(|row| row.get_by_index(0).and_then(|v| v.as_i64()).expect("identifier"))
            .collect()
    }
}

async fn count(pool: &dyn DatabasePool, sql: &str, arg: &str) -> i64 {
    let rows = pool
        .fetch_all(sql, &[DatabaseValue::from(arg)])
        .await
        .expect("count query");
    rows[0].get_by_index(0).and_then(|v| v.as_i64()).expect("count")
}

pub fn sql(id: i64, name: &str, up: &str, down: Option<&str>) -> SqlMigration {
    SqlMigration::new(id, name, up, down.map(str::to_string))
}

pub fn create_item() -> SqlMigration {
    sql(
        1000,
        "create_item",
        "CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        Some("DROP TABLE item"),
    )
}

pub fn add_quantity() -> SqlMigration {
    sql(
        1100,
        "add_quantity",
        "ALTER TABLE item ADD COLUMN quantity INTEGER NOT NULL DEFAULT 0",
        Some("ALTER TABLE item DROP COLUMN quantity"),
    )
}

pub fn create_tag() -> SqlMigration {
    sql(
        1200,
        "create_tag",
        "CREATE TABLE tag (id INTEGER PRIMARY KEY, label TEXT NOT NULL); \
         CREATE INDEX idx_tag_label ON tag (label);",
        Some("DROP INDEX idx_tag_label; DROP TABLE tag;"),
    )
}

pub fn item_registry() -> MigrationRegistry {
    MigrationRegistry::builder()
        .add(create_item())
        .add(add_quantity())
        .add(create_tag())
        .build()
        .expect("registry")
}

/// Waits before creating its table, keeping the run lock busy
pub struct SlowMigration {
    pub id: MigrationId,
    pub delay: Duration,
}

#[async_trait]
impl Migration for SlowMigration {
    fn id(&self) -> MigrationId {
        self.id
    }

    fn name(&self) -> &str {
        "slow"
    }

    async fn up(&self, tx: &mut dyn DatabaseTransaction) -> DatabaseResult<()> {
        tokio::time::sleep(self.delay).await;
        tx.execute("CREATE TABLE slow (id INTEGER PRIMARY KEY)", &[])
            .await?;
        Ok(())
    }
}
