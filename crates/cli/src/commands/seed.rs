use anyhow::{bail, Context};
use keel_migrate::prelude::*;
use keel_migrate::DatabasePool;
use serde::Serialize;
use uuid::Uuid;

/// One row of sample data for the `item` table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeedItem {
    pub name: &'static str,
    pub description: Option<&'static str>,
    pub is_active: bool,
    pub quantity: i32,
}

/// Sample items inserted by `migrate seed`
pub fn sample_items() -> Vec<SeedItem> {
    vec![
        SeedItem {
            name: "Sample Widget",
            description: Some("A sample widget for testing and demonstration."),
            is_active: true,
            quantity: 10,
        },
        SeedItem {
            name: "Inactive Item",
            description: Some("This item is marked inactive."),
            is_active: false,
            quantity: 0,
        },
        SeedItem {
            name: "Minimal Item",
            description: None,
            is_active: true,
            quantity: 1,
        },
    ]
}

/// Insert the sample items once every registered migration is applied.
///
/// Seeding does not take the run lock; run it after `migrate up` has finished,
/// not alongside another `up` or `down`.
pub async fn seed(runner: &MigrationRunner) -> anyhow::Result<usize> {
    let status = runner
        .status()
        .await
        .context("Failed to read migration status")?;

    if !status.is_current() {
        bail!(
            "Refusing to seed: {} pending and {} skipped migration(s). Run `migrate up` first.",
            status.pending_count(),
            status.skipped_count()
        );
    }

    let inserted = insert_items(runner.pool(), &sample_items()).await?;
    tracing::info!(target: "keel::cli", inserted, "Seed data inserted");
    println!("Seeded {} item(s)", inserted);
    Ok(inserted)
}

/// Insert `items` in a single transaction
pub async fn insert_items(pool: &dyn DatabasePool, items: &[SeedItem]) -> anyhow::Result<usize> {
    let mut tx = pool
        .begin_transaction()
        .await
        .context("Failed to start seed transaction")?;

    let dialect = tx.dialect();
    let placeholders: Vec<String> = (0..5).map(|i| dialect.parameter_placeholder(i)).collect();
    let sql = format!(
        r#"INSERT INTO "item" ("id", "name", "description", "isActive", "quantity") VALUES ({})"#,
        placeholders.join(", ")
    );

    for item in items {
        let params = [
            DatabaseValue::Uuid(Uuid::new_v4()),
            DatabaseValue::from(item.name),
            DatabaseValue::from(item.description),
            DatabaseValue::Bool(item.is_active),
            DatabaseValue::Int32(item.quantity),
        ];
        tx.execute(&sql, &params)
            .await
            .with_context(|| format!("Failed to insert seed item '{}'", item.name))?;
    }

    tx.commit().await.context("Failed to commit seed data")?;
    Ok(items.len())
}
