//! Migration Runner - Executes migrations against the database
//!
//! Every run plans first and executes second: the full set of steps is
//! computed from the registry and the ledger before anything touches the
//! schema. Each step then runs in its own transaction together with its
//! ledger write, and a batch stops at the first failing step.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::definitions::{
    AdvanceTarget, Migration, MigrationConfig, MigrationDirection, MigrationId, MigrationState,
    MigrationStatusEntry, MigrationStatusReport, RunReport,
};
use super::ledger::MigrationLedger;
use super::lock::{LockGuard, MigrationLock};
use super::registry::MigrationRegistry;
use crate::backends::DatabasePool;
use crate::error::{MigrateResult, MigrationFailure, PlanError, StepStage};

/// Cooperative cancellation flag shared between a runner and its caller.
///
/// Checked before each step; a step that has started always commits or
/// rolls back.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the current batch stop before its next step
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear a previous request so the runner can be used again
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Steps selected by `plan_advance`
pub struct AdvancePlan<'r> {
    /// Migrations to apply, ascending
    pub steps: Vec<&'r dyn Migration>,
    /// Unapplied migrations below the highest applied identifier
    pub skipped: Vec<MigrationId>,
}

impl std::fmt::Debug for AdvancePlan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvancePlan")
            .field("steps", &self.steps.iter().map(|m| m.id()).collect::<Vec<_>>())
            .field("skipped", &self.skipped)
            .finish()
    }
}

/// Check that an explicit advance target is registered
pub fn validate_advance_target(
    registry: &MigrationRegistry,
    target: AdvanceTarget,
) -> Result<(), PlanError> {
    match target {
        AdvanceTarget::To(id) if !registry.contains(id) => Err(PlanError::UnknownTarget(id)),
        _ => Ok(()),
    }
}

/// Compute the migrations `advance` would apply.
///
/// Only migrations above the highest applied identifier are eligible, so a
/// target at or below it plans nothing.
pub fn plan_advance<'r>(
    registry: &'r MigrationRegistry,
    applied: &BTreeSet<MigrationId>,
    target: AdvanceTarget,
) -> Result<AdvancePlan<'r>, PlanError> {
    validate_advance_target(registry, target)?;

    let high_water = applied.iter().next_back().copied();
    let limit = match target {
        AdvanceTarget::Latest => None,
        AdvanceTarget::To(id) => Some(id),
    };

    let mut steps = Vec::new();
    let mut skipped = Vec::new();

    for migration in registry.list() {
        let id = migration.id();
        if applied.contains(&id) {
            continue;
        }
        if high_water.map_or(false, |max| id < max) {
            skipped.push(id);
            continue;
        }
        if limit.map_or(true, |limit| id <= limit) {
            steps.push(migration);
        }
    }

    Ok(AdvancePlan { steps, skipped })
}

/// Executes migrations from a registry against one database
pub struct MigrationRunner {
    registry: Arc<MigrationRegistry>,
    pool: Arc<dyn DatabasePool>,
    ledger: MigrationLedger,
    lock: MigrationLock,
    cancellation: CancellationHandle,
}

impl MigrationRunner {
    /// Create a new migration runner
    pub fn new(
        registry: Arc<MigrationRegistry>,
        pool: Arc<dyn DatabasePool>,
        config: MigrationConfig,
    ) -> MigrateResult<Self> {
        config.validate()?;
        let ledger = MigrationLedger::new(config.ledger_table.clone())?;
        let lock = MigrationLock::new(
            config.effective_lock_key(),
            config.lock_timeout,
            config.lock_poll_interval,
        );

        Ok(Self {
            registry,
            pool,
            ledger,
            lock,
            cancellation: CancellationHandle::new(),
        })
    }

    /// Share a cancellation handle with the caller
    pub fn with_cancellation(mut self, handle: CancellationHandle) -> Self {
        self.cancellation = handle;
        self
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Get the database pool
    pub fn pool(&self) -> &dyn DatabasePool {
        self.pool.as_ref()
    }

    pub fn ledger(&self) -> &MigrationLedger {
        &self.ledger
    }

    /// Apply pending migrations up to `target`
    pub async fn advance(&self, target: AdvanceTarget) -> MigrateResult<RunReport> {
        validate_advance_target(&self.registry, target)?;

        let guard = self.lock.acquire(self.pool()).await?;
        let result = self.advance_locked(target).await;
        self.finish(guard, result).await
    }

    async fn advance_locked(&self, target: AdvanceTarget) -> MigrateResult<RunReport> {
        self.ledger.ensure_initialized(self.pool()).await?;
        let applied = self.ledger.applied_identifiers(self.pool()).await?;
        let plan = plan_advance(&self.registry, &applied, target)?;

        for id in &plan.skipped {
            tracing::warn!(
                target: "keel::migrate",
                migration = %id,
                "Migration is older than the latest applied migration and will not be applied"
            );
        }

        if plan.steps.is_empty() {
            tracing::info!(target: "keel::migrate", requested = ?target, "No pending migrations");
            return Ok(RunReport::empty(MigrationDirection::Up));
        }

        self.run_batch(MigrationDirection::Up, plan.steps).await
    }

    /// Report the state of every registered migration.
    ///
    /// Read-only: neither creates the ledger table nor takes the run lock.
    pub async fn status(&self) -> MigrateResult<MigrationStatusReport> {
        let applied = if self.ledger.is_initialized(self.pool()).await? {
            self.ledger.applied(self.pool()).await?
        } else {
            Vec::new()
        };

        let high_water = applied.iter().map(|e| e.id).max();
        let mut by_id: BTreeMap<MigrationId, _> =
            applied.into_iter().map(|e| (e.id, e)).collect();

        let entries = self
            .registry
            .list()
            .map(|migration| {
                let id = migration.id();
                let state = match by_id.remove(&id) {
                    Some(entry) => MigrationState::Applied {
                        applied_at: entry.applied_at,
                    },
                    None if high_water.map_or(false, |max| id < max) => MigrationState::Skipped,
                    None => MigrationState::Pending,
                };
                MigrationStatusEntry {
                    id,
                    name: migration.name().to_string(),
                    state,
                }
            })
            .collect();

        Ok(MigrationStatusReport {
            entries,
            orphaned: by_id.into_values().collect(),
        })
    }

    pub(crate) async fn acquire_lock(&self) -> MigrateResult<LockGuard> {
        self.lock.acquire(self.pool()).await
    }

    /// Release the run lock, preferring the batch's own error over a release failure
    pub(crate) async fn finish<T>(
        &self,
        guard: LockGuard,
        result: MigrateResult<T>,
    ) -> MigrateResult<T> {
        let released = guard.release().await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                tracing::warn!(
                    target: "keel::migrate",
                    error = %release_err,
                    "Failed to release migration lock after an error"
                );
                Err(err)
            }
        }
    }

    /// Execute planned steps in order, one transaction each
    pub(crate) async fn run_batch(
        &self,
        direction: MigrationDirection,
        steps: Vec<&dyn Migration>,
    ) -> MigrateResult<RunReport> {
        let started = Instant::now();
        let planned: Vec<MigrationId> = steps.iter().map(|m| m.id()).collect();
        let mut processed = Vec::with_capacity(steps.len());

        tracing::info!(
            target: "keel::migrate",
            %direction,
            count = steps.len(),
            "Starting migration batch"
        );

        for (index, migration) in steps.iter().enumerate() {
            if self.cancellation.is_cancelled() {
                let remaining = planned[index..].to_vec();
                tracing::warn!(
                    target: "keel::migrate",
                    %direction,
                    completed = processed.len(),
                    remaining = remaining.len(),
                    "Migration batch cancelled"
                );
                return Ok(RunReport {
                    direction,
                    processed,
                    remaining,
                    cancelled: true,
                    execution_time_ms: started.elapsed().as_millis(),
                });
            }

            let step_started = Instant::now();
            tracing::info!(
                target: "keel::migrate",
                migration = %migration.id(),
                name = migration.name(),
                %direction,
                "Executing migration"
            );

            if let Err((stage, cause)) = self.execute_step(direction, *migration).await {
                tracing::error!(
                    target: "keel::migrate",
                    migration = %migration.id(),
                    name = migration.name(),
                    %direction,
                    %stage,
                    error = %cause,
                    "Migration failed, batch halted"
                );
                return Err(MigrationFailure {
                    id: migration.id(),
                    name: migration.name().to_string(),
                    direction,
                    stage,
                    cause,
                    completed: processed,
                    remaining: planned[index + 1..].to_vec(),
                }
                .into());
            }

            tracing::info!(
                target: "keel::migrate",
                migration = %migration.id(),
                elapsed_ms = step_started.elapsed().as_millis() as u64,
                "Migration committed"
            );
            processed.push(migration.id());
        }

        Ok(RunReport {
            direction,
            processed,
            remaining: Vec::new(),
            cancelled: false,
            execution_time_ms: started.elapsed().as_millis(),
        })
    }

    /// Run one step: begin, operation, ledger write, commit.
    ///
    /// Any failure after `begin` rolls the transaction back, so the schema
    /// change and its ledger entry land together or not at all.
    async fn execute_step(
        &self,
        direction: MigrationDirection,
        migration: &dyn Migration,
    ) -> Result<(), (StepStage, String)> {
        let mut tx = self
            .pool
            .begin_transaction()
            .await
            .map_err(|e| (StepStage::Begin, e.to_string()))?;

        let outcome = match direction {
            MigrationDirection::Up => match migration.up(tx.as_mut()).await {
                Ok(()) => self
                    .ledger
                    .record_applied(tx.as_mut(), migration)
                    .await
                    .map_err(|e| (StepStage::Ledger, e.to_string())),
                Err(e) => Err((StepStage::Operation, e.to_string())),
            },
            MigrationDirection::Down => match migration.down(tx.as_mut()).await {
                Ok(()) => self
                    .ledger
                    .record_reverted(tx.as_mut(), migration.id())
                    .await
                    .map_err(|e| (StepStage::Ledger, e.to_string())),
                Err(e) => Err((StepStage::Operation, e.to_string())),
            },
        };

        match outcome {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| (StepStage::Commit, e.to_string())),
            Err(failure) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        target: "keel::migrate",
                        migration = %migration.id(),
                        error = %rollback_err,
                        "Rollback after failed step also failed"
                    );
                }
                Err(failure)
            }
        }
    }
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("registry", &self.registry)
            .field("ledger", &self.ledger)
            .field("lock", &self.lock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::definitions::SqlMigration;

    fn registry(ids: &[i64]) -> MigrationRegistry {
        ids.iter()
            .fold(MigrationRegistry::builder(), |builder, id| {
                builder.add(SqlMigration::new(*id, format!("m{id}"), "SELECT 1", None))
            })
            .build()
            .unwrap()
    }

    fn ids(plan: &AdvancePlan<'_>) -> Vec<i64> {
        plan.steps.iter().map(|m| m.id().value()).collect()
    }

    fn applied(ids: &[i64]) -> BTreeSet<MigrationId> {
        ids.iter().copied().map(MigrationId::new).collect()
    }

    #[test]
    fn plans_everything_on_fresh_database() {
        let registry = registry(&[1000, 1100, 1200]);
        let plan = plan_advance(&registry, &applied(&[]), AdvanceTarget::Latest).unwrap();
        assert_eq!(ids(&plan), vec![1000, 1100, 1200]);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn stops_at_explicit_target() {
        let registry = registry(&[1000, 1100, 1200]);
        let plan = plan_advance(
            &registry,
            &applied(&[]),
            AdvanceTarget::To(MigrationId::new(1100)),
        )
        .unwrap();
        assert_eq!(ids(&plan), vec![1000, 1100]);
    }

    #[test]
    fn target_at_or_below_high_water_is_a_no_op() {
        let registry = registry(&[1000, 1100, 1200]);
        let plan = plan_advance(
            &registry,
            &applied(&[1000, 1100]),
            AdvanceTarget::To(MigrationId::new(1000)),
        )
        .unwrap();
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn unapplied_ids_below_high_water_are_skipped() {
        let registry = registry(&[1000, 1050, 1100, 1200]);
        let plan = plan_advance(&registry, &applied(&[1000, 1100]), AdvanceTarget::Latest).unwrap();
        assert_eq!(ids(&plan), vec![1200]);
        assert_eq!(plan.skipped, vec![MigrationId::new(1050)]);
    }

    #[test]
    fn unknown_target_is_rejected() {
        let registry = registry(&[1000]);
        let err = plan_advance(
            &registry,
            &applied(&[]),
            AdvanceTarget::To(MigrationId::new(999)),
        )
        .unwrap_err();
        assert_eq!(err, PlanError::UnknownTarget(MigrationId::new(999)));
    }

    #[test]
    fn cancellation_handle_is_shared() {
        let handle = CancellationHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
        handle.reset();
        assert!(!clone.is_cancelled());
    }
}
