use std::sync::Arc;

use clap::Parser;
use keel_cli::cli::Cli;
use keel_cli::commands::seed;
use keel_cli::config::Settings;
use keel_cli::migrations;
use keel_migrate::prelude::*;
use keel_migrate::{connect, DatabasePool, DatabasePoolConfig};
use tempfile::TempDir;

const CREATE_ITEM: i64 = 1739180400000;
const ADD_QUANTITY: i64 = 1739180500000;

struct Fixture {
    _dir: TempDir,
    url: String,
    pool: Arc<dyn DatabasePool>,
    runner: MigrationRunner,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("items.db").display());
    let pool = connect(&url, DatabasePoolConfig::default()).await.unwrap();
    let runner = MigrationRunner::new(
        Arc::new(migrations::registry().unwrap()),
        pool.clone(),
        MigrationConfig::default(),
    )
    .unwrap();
    Fixture {
        _dir: dir,
        url,
        pool,
        runner,
    }
}

async fn quantity_readable(pool: &dyn DatabasePool) -> bool {
    pool.fetch_all(r#"SELECT "quantity" FROM "item""#, &[])
        .await
        .is_ok()
}

#[tokio::test]
async fn apply_revert_and_reapply_builtins() {
    let f = fixture().await;

    let report = f.runner.advance(AdvanceTarget::Latest).await.unwrap();
    assert_eq!(
        report.processed,
        vec![MigrationId::new(CREATE_ITEM), MigrationId::new(ADD_QUANTITY)]
    );
    assert!(quantity_readable(f.pool.as_ref()).await);

    let again = f.runner.advance(AdvanceTarget::Latest).await.unwrap();
    assert!(again.is_empty());

    let reverted = f.runner.revert(RevertTarget::Steps(1)).await.unwrap();
    assert_eq!(reverted.processed, vec![MigrationId::new(ADD_QUANTITY)]);
    assert!(!quantity_readable(f.pool.as_ref()).await);

    let status = f.runner.status().await.unwrap();
    assert_eq!(status.applied_count(), 1);
    assert!(status.get(MigrationId::new(CREATE_ITEM)).unwrap().is_applied());
    assert_eq!(status.pending_count(), 1);

    let reapplied = f.runner.advance(AdvanceTarget::Latest).await.unwrap();
    assert_eq!(reapplied.processed, vec![MigrationId::new(ADD_QUANTITY)]);
    assert!(quantity_readable(f.pool.as_ref()).await);
}

#[tokio::test]
async fn advance_to_first_then_latest() {
    let f = fixture().await;

    let first = f
        .runner
        .advance(AdvanceTarget::To(MigrationId::new(CREATE_ITEM)))
        .await
        .unwrap();
    assert_eq!(first.processed, vec![MigrationId::new(CREATE_ITEM)]);
    assert!(!quantity_readable(f.pool.as_ref()).await);

    let rest = f.runner.advance(AdvanceTarget::Latest).await.unwrap();
    assert_eq!(rest.processed, vec![MigrationId::new(ADD_QUANTITY)]);
}

#[tokio::test]
async fn seed_requires_current_schema() {
    let f = fixture().await;

    let err = seed::seed(&f.runner).await.unwrap_err();
    assert!(err.to_string().contains("2 pending"));

    f.runner.advance(AdvanceTarget::Latest).await.unwrap();
    let inserted = seed::seed(&f.runner).await.unwrap();
    assert_eq!(inserted, 3);

    let rows = f
        .pool
        .fetch_all(
            r#"SELECT "name", "description", "isActive", "quantity" FROM "item" ORDER BY "quantity" DESC"#,
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[0].get_by_name("name").unwrap().as_string().unwrap(),
        "Sample Widget"
    );
    assert_eq!(rows[0].get_by_name("quantity").unwrap().as_i64().unwrap(), 10);
    assert!(!rows[2].get_by_name("description").unwrap().is_null());
    assert!(rows[1].get_by_name("description").unwrap().is_null());
}

#[tokio::test]
async fn run_drives_commands_end_to_end() {
    let f = fixture().await;
    let settings = || {
        let mut settings = Settings::from_lookup(|_| None).unwrap();
        settings.database_url = f.url.clone();
        settings
    };

    keel_cli::run(Cli::try_parse_from(["migrate", "up"]).unwrap(), settings())
        .await
        .unwrap();
    keel_cli::run(Cli::try_parse_from(["migrate", "status", "--json"]).unwrap(), settings())
        .await
        .unwrap();
    keel_cli::run(Cli::try_parse_from(["migrate", "down", "--all"]).unwrap(), settings())
        .await
        .unwrap();

    let status = f.runner.status().await.unwrap();
    assert_eq!(status.pending_count(), 2);

    let err = keel_cli::run(
        Cli::try_parse_from(["migrate", "up", "--to", "42"]).unwrap(),
        settings(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("42"));
}
