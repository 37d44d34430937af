//! Migration System
//!
//! Registry, ledger, run lock, and the runner that applies and reverts
//! migrations against a database through the backend abstractions.

pub mod definitions;
pub mod ledger;
pub mod lock;
pub mod registry;
pub mod rollback;
pub mod runner;
pub mod sql;

pub use definitions::*;
pub use ledger::MigrationLedger;
pub use lock::{lock_key_for, LockGuard, MigrationLock};
pub use registry::{MigrationRegistry, MigrationRegistryBuilder};
pub use rollback::{plan_revert, MigrationRollback};
pub use runner::{plan_advance, AdvancePlan, CancellationHandle, MigrationRunner};
pub use sql::{migration_file_name, migration_template, next_migration_id, split_sql_statements};
