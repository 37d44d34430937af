//! Migration Rollback - Handles reverting applied migrations
//!
//! Provides functionality to revert migrations by count, down to a target,
//! or entirely, executing each migration's `down` operation in descending
//! identifier order.

use async_trait::async_trait;

use super::definitions::{LedgerEntry, Migration, MigrationDirection, RevertTarget, RunReport};
use super::registry::MigrationRegistry;
use super::runner::MigrationRunner;
use crate::error::{MigrateError, MigrateResult, PlanError};

/// Check that an explicit revert target is registered
pub fn validate_revert_target(
    registry: &MigrationRegistry,
    target: RevertTarget,
) -> Result<(), PlanError> {
    match target {
        RevertTarget::To(id) if !registry.contains(id) => Err(PlanError::UnknownTarget(id)),
        _ => Ok(()),
    }
}

/// Compute the migrations `revert` would undo, in execution order.
///
/// Every selected entry must map to a registered, reversible migration;
/// otherwise nothing is reverted.
pub fn plan_revert<'r>(
    registry: &'r MigrationRegistry,
    applied: &[LedgerEntry],
    target: RevertTarget,
) -> Result<Vec<&'r dyn Migration>, PlanError> {
    validate_revert_target(registry, target)?;

    let mut newest_first: Vec<&LedgerEntry> = applied.iter().collect();
    newest_first.sort_by(|a, b| b.applied_at.cmp(&a.applied_at).then(b.id.cmp(&a.id)));

    let selected: Vec<&LedgerEntry> = match target {
        RevertTarget::Steps(n) => {
            if n > newest_first.len() {
                return Err(PlanError::NotEnoughApplied {
                    requested: n,
                    applied: newest_first.len(),
                });
            }
            newest_first.into_iter().take(n).collect()
        }
        RevertTarget::To(id) => newest_first.into_iter().filter(|e| e.id > id).collect(),
        RevertTarget::All => newest_first,
    };

    let mut steps = Vec::with_capacity(selected.len());
    for entry in selected {
        let migration = registry
            .get(entry.id)
            .ok_or(PlanError::UnknownApplied(entry.id))?;
        if !migration.is_reversible() {
            return Err(PlanError::Irreversible {
                id: migration.id(),
                name: migration.name().to_string(),
            });
        }
        steps.push(migration);
    }

    steps.sort_by(|a, b| b.id().cmp(&a.id()));
    Ok(steps)
}

/// Extension trait for MigrationRunner to add revert functionality
#[async_trait]
pub trait MigrationRollback {
    /// Revert applied migrations selected by `target`
    async fn revert(&self, target: RevertTarget) -> MigrateResult<RunReport>;

    /// Revert the most recently applied migration, if any
    async fn revert_last(&self) -> MigrateResult<RunReport>;
}

#[async_trait]
impl MigrationRollback for MigrationRunner {
    async fn revert(&self, target: RevertTarget) -> MigrateResult<RunReport> {
        validate_revert_target(self.registry(), target)?;

        let guard = self.acquire_lock().await?;
        let result = revert_locked(self, target).await;
        self.finish(guard, result).await
    }

    async fn revert_last(&self) -> MigrateResult<RunReport> {
        let guard = self.acquire_lock().await?;
        let result = match revert_locked(self, RevertTarget::Steps(1)).await {
            Err(MigrateError::Plan(PlanError::NotEnoughApplied { applied: 0, .. })) => {
                tracing::info!(target: "keel::migrate", "Nothing to revert");
                Ok(RunReport::empty(MigrationDirection::Down))
            }
            other => other,
        };
        self.finish(guard, result).await
    }
}

async fn revert_locked(runner: &MigrationRunner, target: RevertTarget) -> MigrateResult<RunReport> {
    runner.ledger().ensure_initialized(runner.pool()).await?;
    let applied = runner.ledger().applied(runner.pool()).await?;
    let steps = plan_revert(runner.registry(), &applied, target)?;

    if steps.is_empty() {
        tracing::info!(target: "keel::migrate", requested = ?target, "Nothing to revert");
        return Ok(RunReport::empty(MigrationDirection::Down));
    }

    runner.run_batch(MigrationDirection::Down, steps).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::definitions::{MigrationId, SqlMigration};
    use chrono::{Duration, TimeZone, Utc};

    fn reversible(id: i64) -> SqlMigration {
        SqlMigration::new(id, format!("m{id}"), "SELECT 1", Some("SELECT 2".to_string()))
    }

    fn registry() -> MigrationRegistry {
        MigrationRegistry::builder()
            .add(reversible(1000))
            .add(reversible(1100))
            .add(reversible(1200))
            .add(SqlMigration::new(1300, "m1300", "SELECT 1", None))
            .build()
            .unwrap()
    }

    fn entries(ids: &[i64]) -> Vec<LedgerEntry> {
        let base = Utc.with_ymd_and_hms(2025, 2, 10, 9, 40, 0).unwrap();
        ids.iter()
            .enumerate()
            .map(|(offset, id)| LedgerEntry {
                id: MigrationId::new(*id),
                name: format!("m{id}"),
                applied_at: base + Duration::seconds(offset as i64),
            })
            .collect()
    }

    fn ids(steps: &[&dyn Migration]) -> Vec<i64> {
        steps.iter().map(|m| m.id().value()).collect()
    }

    #[test]
    fn steps_take_most_recent_in_descending_order() {
        let registry = registry();
        let applied = entries(&[1000, 1100, 1200]);
        let steps = plan_revert(&registry, &applied, RevertTarget::Steps(2)).unwrap();
        assert_eq!(ids(&steps), vec![1200, 1100]);
    }

    #[test]
    fn zero_steps_plans_nothing() {
        let registry = registry();
        let steps = plan_revert(&registry, &entries(&[1000]), RevertTarget::Steps(0)).unwrap();
        assert!(steps.is_empty());
    }

    #[test]
    fn too_many_steps_is_rejected() {
        let registry = registry();
        let err = plan_revert(&registry, &entries(&[1000]), RevertTarget::Steps(3)).unwrap_err();
        assert_eq!(
            err,
            PlanError::NotEnoughApplied {
                requested: 3,
                applied: 1
            }
        );
    }

    #[test]
    fn to_target_is_exclusive() {
        let registry = registry();
        let applied = entries(&[1000, 1100, 1200]);
        let steps =
            plan_revert(&registry, &applied, RevertTarget::To(MigrationId::new(1000))).unwrap();
        assert_eq!(ids(&steps), vec![1200, 1100]);

        let err = plan_revert(&registry, &applied, RevertTarget::To(MigrationId::new(5)))
            .unwrap_err();
        assert_eq!(err, PlanError::UnknownTarget(MigrationId::new(5)));
    }

    #[test]
    fn irreversible_migration_blocks_the_whole_plan() {
        let registry = registry();
        let applied = entries(&[1000, 1100, 1200, 1300]);
        let err = plan_revert(&registry, &applied, RevertTarget::All).unwrap_err();
        assert!(matches!(err, PlanError::Irreversible { id, .. } if id == MigrationId::new(1300)));
    }

    #[test]
    fn unregistered_applied_entry_is_rejected() {
        let registry = registry();
        let applied = entries(&[1000, 4242]);
        let err = plan_revert(&registry, &applied, RevertTarget::Steps(1)).unwrap_err();
        assert_eq!(err, PlanError::UnknownApplied(MigrationId::new(4242)));
    }

    #[test]
    fn execution_order_is_by_identifier_even_when_applied_out_of_order() {
        let registry = registry();
        // 1100 applied after 1200
        let applied = entries(&[1000, 1200, 1100]);
        let steps = plan_revert(&registry, &applied, RevertTarget::Steps(2)).unwrap();
        assert_eq!(ids(&steps), vec![1200, 1100]);
    }
}
