//! Exclusive run lock
//!
//! At most one runner may apply or revert migrations against a database at
//! a time. The lock is taken through the backend (`pg_try_advisory_lock` on
//! PostgreSQL, a lock row on SQLite) and polled until it is free or the
//! configured timeout expires.

use std::time::{Duration, Instant};

use crate::backends::{DatabasePool, LockHandle};
use crate::error::{MigrateError, MigrateResult};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Default lock key derived from the ledger table name (64-bit FNV-1a)
pub fn lock_key_for(ledger_table: &str) -> i64 {
    let hash = ledger_table.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    hash as i64
}

/// Lock acquisition policy
#[derive(Debug, Clone)]
pub struct MigrationLock {
    key: i64,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl MigrationLock {
    pub fn new(key: i64, timeout: Option<Duration>, poll_interval: Duration) -> Self {
        Self {
            key,
            timeout,
            poll_interval,
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Wait for the lock, failing with `LockTimeout` once the timeout elapses
    pub async fn acquire(&self, pool: &dyn DatabasePool) -> MigrateResult<LockGuard> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            let attempt = pool
                .try_lock(self.key)
                .await
                .map_err(|e| MigrateError::Storage(format!("Failed to take migration lock: {}", e)))?;

            if let Some(handle) = attempt {
                tracing::debug!(
                    target: "keel::migrate",
                    key = self.key,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Migration lock acquired"
                );
                return Ok(LockGuard { handle });
            }

            let waited = started.elapsed();
            if let Some(timeout) = self.timeout {
                if waited >= timeout {
                    tracing::warn!(
                        target: "keel::migrate",
                        key = self.key,
                        ?timeout,
                        "Gave up waiting for the migration lock"
                    );
                    return Err(MigrateError::LockTimeout { waited });
                }
            }

            if !announced {
                tracing::info!(
                    target: "keel::migrate",
                    key = self.key,
                    "Another migration run holds the lock, waiting"
                );
                announced = true;
            }

            let pause = match self.timeout {
                Some(timeout) => self.poll_interval.min(timeout.saturating_sub(waited)),
                None => self.poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }
}

/// A held run lock
pub struct LockGuard {
    handle: Box<dyn LockHandle>,
}

impl LockGuard {
    pub fn key(&self) -> i64 {
        self.handle.key()
    }

    /// Release the lock
    pub async fn release(self) -> MigrateResult<()> {
        let key = self.handle.key();
        self.handle
            .release()
            .await
            .map_err(|e| MigrateError::Storage(format!("Failed to release migration lock: {}", e)))?;
        tracing::debug!(target: "keel::migrate", key, "Migration lock released");
        Ok(())
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DatabaseBackend, DatabasePoolConfig, SqliteBackend};
    use std::sync::Arc;

    async fn memory_pool() -> Arc<dyn DatabasePool> {
        SqliteBackend::new()
            .create_pool("sqlite::memory:", DatabasePoolConfig::default())
            .await
            .unwrap()
    }

    #[test]
    fn key_derivation_is_fnv1a() {
        // FNV-1a of the empty input is the offset basis
        assert_eq!(lock_key_for(""), FNV_OFFSET_BASIS as i64);
        assert_eq!(lock_key_for("migrations"), lock_key_for("migrations"));
        assert_ne!(lock_key_for("migrations"), lock_key_for("migration"));
    }

    #[tokio::test]
    async fn second_acquire_times_out_until_release() {
        let pool = memory_pool().await;
        let lock = MigrationLock::new(7, Some(Duration::from_millis(150)), Duration::from_millis(20));

        let guard = lock.acquire(pool.as_ref()).await.unwrap();
        assert_eq!(guard.key(), 7);

        let err = lock.acquire(pool.as_ref()).await.unwrap_err();
        match err {
            MigrateError::LockTimeout { waited } => assert!(waited >= Duration::from_millis(150)),
            other => panic!("unexpected error: {other:?}"),
        }

        guard.release().await.unwrap();
        let guard = lock.acquire(pool.as_ref()).await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn waiter_proceeds_once_lock_is_released() {
        let pool = memory_pool().await;
        let lock = MigrationLock::new(9, None, Duration::from_millis(10));
        let guard = lock.acquire(pool.as_ref()).await.unwrap();

        let waiter_pool = pool.clone();
        let waiter_lock = lock.clone();
        let waiter = tokio::spawn(async move {
            let guard = waiter_lock.acquire(waiter_pool.as_ref()).await.unwrap();
            guard.release().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        guard.release().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter finished")
            .unwrap();
    }
}
