mod common;

use common::*;
use keel_migrate::prelude::*;
use keel_migrate::{MigrationDirection, MigrationState, PlanError};

#[tokio::test]
async fn advance_applies_everything_in_order() {
    let db = TestDb::new().await;
    let runner = db.runner(item_registry());

    let report = runner.advance(AdvanceTarget::Latest).await.unwrap();

    assert_eq!(
        report.processed,
        vec![MigrationId::new(1000), MigrationId::new(1100), MigrationId::new(1200)]
    );
    assert!(!report.cancelled);
    assert!(db.column_exists("item", "quantity").await);
    assert!(db.table_exists("tag").await);
    assert_eq!(db.ledger_ids().await, vec![1000, 1100, 1200]);
}

#[tokio::test]
async fn second_advance_is_a_no_op() {
    let db = TestDb::new().await;
    let runner = db.runner(item_registry());

    runner.advance(AdvanceTarget::Latest).await.unwrap();
    let again = runner.advance(AdvanceTarget::Latest).await.unwrap();

    assert!(again.is_empty());
    assert_eq!(db.ledger_ids().await, vec![1000, 1100, 1200]);
}

#[tokio::test]
async fn advance_to_target_then_latest() {
    let db = TestDb::new().await;
    let runner = db.runner(item_registry());

    let first = runner
        .advance(AdvanceTarget::To(MigrationId::new(1000)))
        .await
        .unwrap();
    assert_eq!(first.processed, vec![MigrationId::new(1000)]);
    assert!(db.table_exists("item").await);
    assert!(!db.column_exists("item", "quantity").await);

    let rest = runner.advance(AdvanceTarget::Latest).await.unwrap();
    assert_eq!(
        rest.processed,
        vec![MigrationId::new(1100), MigrationId::new(1200)]
    );

    let below = runner
        .advance(AdvanceTarget::To(MigrationId::new(1000)))
        .await
        .unwrap();
    assert!(below.is_empty());
}

#[tokio::test]
async fn unknown_target_fails_before_touching_the_database() {
    let db = TestDb::new().await;
    let runner = db.runner(item_registry());

    let err = runner
        .advance(AdvanceTarget::To(MigrationId::new(1050)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MigrateError::Plan(PlanError::UnknownTarget(id)) if id == MigrationId::new(1050)
    ));
    assert!(!db.table_exists("migrations").await);
}

#[tokio::test]
async fn revert_one_step_restores_previous_schema() {
    let db = TestDb::new().await;
    let runner = db.runner(item_registry());
    runner.advance(AdvanceTarget::Latest).await.unwrap();

    let report = runner.revert(RevertTarget::Steps(1)).await.unwrap();

    assert_eq!(report.processed, vec![MigrationId::new(1200)]);
    assert!(!db.table_exists("tag").await);
    assert!(db.column_exists("item", "quantity").await);
    assert_eq!(db.ledger_ids().await, vec![1000, 1100]);
}

#[tokio::test]
async fn revert_to_target_and_all() {
    let db = TestDb::new().await;
    let runner = db.runner(item_registry());
    runner.advance(AdvanceTarget::Latest).await.unwrap();

    let report = runner
        .revert(RevertTarget::To(MigrationId::new(1000)))
        .await
        .unwrap();
    assert_eq!(
        report.processed,
        vec![MigrationId::new(1200), MigrationId::new(1100)]
    );
    assert!(db.table_exists("item").await);
    assert!(!db.column_exists("item", "quantity").await);

    let report = runner.revert(RevertTarget::All).await.unwrap();
    assert_eq!(report.processed, vec![MigrationId::new(1000)]);
    assert!(!db.table_exists("item").await);
    assert!(db.ledger_ids().await.is_empty());

    // Reapplying after a full revert works from scratch
    let report = runner.advance(AdvanceTarget::Latest).await.unwrap();
    assert_eq!(report.count(), 3);
}

#[tokio::test]
async fn revert_more_than_applied_changes_nothing() {
    let db = TestDb::new().await;
    let runner = db.runner(item_registry());
    runner
        .advance(AdvanceTarget::To(MigrationId::new(1100)))
        .await
        .unwrap();

    let err = runner.revert(RevertTarget::Steps(5)).await.unwrap_err();

    assert!(matches!(
        err,
        MigrateError::Plan(PlanError::NotEnoughApplied { requested: 5, applied: 2 })
    ));
    assert_eq!(db.ledger_ids().await, vec![1000, 1100]);
}

#[tokio::test]
async fn irreversible_migration_is_refused_during_planning() {
    let db = TestDb::new().await;
    let registry = MigrationRegistry::builder()
        .add(create_item())
        .add(sql(
            1100,
            "seed_defaults",
            "INSERT INTO item (name) VALUES ('default')",
            None,
        ))
        .build()
        .unwrap();
    let runner = db.runner(registry);
    runner.advance(AdvanceTarget::Latest).await.unwrap();

    let err = runner.revert(RevertTarget::All).await.unwrap_err();

    assert!(matches!(
        err,
        MigrateError::Plan(PlanError::Irreversible { id, .. }) if id == MigrationId::new(1100)
    ));
    assert_eq!(db.ledger_ids().await, vec![1000, 1100]);
    assert!(db.table_exists("item").await);
}

#[tokio::test]
async fn revert_last_on_empty_ledger_is_empty() {
    let db = TestDb::new().await;
    let runner = db.runner(item_registry());

    let report = runner.revert_last().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(report.direction, MigrationDirection::Down);
}

#[tokio::test]
async fn revert_last_undoes_one_migration_at_a_time() {
    let db = TestDb::new().await;
    let runner = db.runner(item_registry());
    runner.advance(AdvanceTarget::Latest).await.unwrap();

    let report = runner.revert_last().await.unwrap();
    assert_eq!(report.processed, vec![MigrationId::new(1200)]);
    let report = runner.revert_last().await.unwrap();
    assert_eq!(report.processed, vec![MigrationId::new(1100)]);
    assert_eq!(db.ledger_ids().await, vec![1000]);

    runner.revert_last().await.unwrap();
    assert!(db.ledger_ids().await.is_empty());
    assert!(runner.revert_last().await.unwrap().is_empty());
}

#[tokio::test]
async fn status_reports_without_creating_the_ledger() {
    let db = TestDb::new().await;
    let runner = db.runner(item_registry());

    let status = runner.status().await.unwrap();
    assert_eq!(status.pending_count(), 3);
    assert!(!db.table_exists("migrations").await);

    runner
        .advance(AdvanceTarget::To(MigrationId::new(1000)))
        .await
        .unwrap();
    let status = runner.status().await.unwrap();
    assert_eq!(status.applied_count(), 1);
    assert_eq!(status.pending_count(), 2);
    assert!(status
        .get(MigrationId::new(1000))
        .and_then(|entry| entry.applied_at())
        .is_some());
}

#[tokio::test]
async fn status_flags_skipped_and_orphaned_entries() {
    let db = TestDb::new().await;
    db.runner(item_registry())
        .advance(AdvanceTarget::Latest)
        .await
        .unwrap();

    // A build that dropped 1200 and gained an older 1050
    let registry = MigrationRegistry::builder()
        .add(create_item())
        .add(sql(1050, "late_arrival", "SELECT 1", None))
        .add(add_quantity())
        .build()
        .unwrap();
    let runner = db.runner(registry);

    let status = runner.status().await.unwrap();
    assert_eq!(
        status.get(MigrationId::new(1050)).map(|e| e.state.clone()),
        Some(MigrationState::Skipped)
    );
    assert_eq!(status.orphaned.len(), 1);
    assert_eq!(status.orphaned[0].id, MigrationId::new(1200));

    // Skipped migrations are never applied by advance
    let report = runner.advance(AdvanceTarget::Latest).await.unwrap();
    assert!(report.is_empty());

    // Reverting through an unregistered entry is refused
    let err = runner.revert(RevertTarget::All).await.unwrap_err();
    assert!(matches!(
        err,
        MigrateError::Plan(PlanError::UnknownApplied(id)) if id == MigrationId::new(1200)
    ));
}

#[tokio::test]
async fn custom_ledger_table_is_used() {
    let db = TestDb::new().await;
    let runner = db.runner_with(
        item_registry(),
        MigrationConfig::default().with_ledger_table("schema_history"),
    );

    runner.advance(AdvanceTarget::Latest).await.unwrap();

    assert!(db.table_exists("schema_history").await);
    assert!(!db.table_exists("migrations").await);
}
