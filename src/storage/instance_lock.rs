// =============================================================================
// Instance Lock — database-backed guard against two engines on one store
// =============================================================================
//
// Acquisition is an UPSERT that only steals the row when the previous lease
// expired; renewal only succeeds while we still own it. The watchdog loop
// renews every tick, so a crashed process frees the lock after one TTL.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::types::now_ms;

/// Exclusive per-database lock identified by `(app, owner)`.
pub struct InstanceLock {
    conn: Arc<Mutex<Connection>>,
    app: String,
    owner: String,
}

impl InstanceLock {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>, app: &str, owner: &str) -> Self {
        Self {
            conn,
            app: app.to_string(),
            owner: owner.to_string(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Try to take (or extend) the lock. Returns true iff we hold it after
    /// the call.
    pub fn acquire(&self, ttl_ms: i64) -> Result<bool> {
        self.acquire_at(ttl_ms, now_ms())
    }

    pub fn acquire_at(&self, ttl_ms: i64, now: i64) -> Result<bool> {
        let expire_at = now + ttl_ms.max(1);
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO app_locks (app, owner, expire_at_ms) VALUES (?1, ?2, ?3) \
             ON CONFLICT(app) DO UPDATE SET \
               owner = excluded.owner, expire_at_ms = excluded.expire_at_ms \
             WHERE app_locks.expire_at_ms < ?4 OR app_locks.owner = excluded.owner",
            params![self.app, self.owner, expire_at, now],
        )
        .context("instance lock upsert failed")?;

        let holder: Option<String> = conn
            .query_row(
                "SELECT owner FROM app_locks WHERE app = ?1",
                params![self.app],
                |row| row.get(0),
            )
            .optional()
            .context("instance lock readback failed")?;

        let ok = holder.as_deref() == Some(self.owner.as_str());
        if ok {
            info!(app = %self.app, owner = %self.owner, "instance lock acquired");
        } else {
            warn!(app = %self.app, holder = ?holder, "instance lock held by another process");
        }
        Ok(ok)
    }

    /// Extend the lease. Returns true only while we still own the lock.
    pub fn renew(&self, ttl_ms: i64) -> Result<bool> {
        self.renew_at(ttl_ms, now_ms())
    }

    pub fn renew_at(&self, ttl_ms: i64, now: i64) -> Result<bool> {
        let expire_at = now + ttl_ms.max(1);
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE app_locks SET expire_at_ms = ?1 WHERE app = ?2 AND owner = ?3",
                params![expire_at, self.app, self.owner],
            )
            .context("instance lock renew failed")?;
        Ok(updated == 1)
    }

    /// Drop the lock if we own it.
    pub fn release(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM app_locks WHERE app = ?1 AND owner = ?2",
            params![self.app, self.owner],
        )
        .context("instance lock release failed")?;
        info!(app = %self.app, owner = %self.owner, "instance lock released");
        Ok(())
    }
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock")
            .field("app", &self.app)
            .field("owner", &self.owner)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn second_owner_cannot_steal_live_lock() {
        let s = Storage::open_in_memory().unwrap();
        let a = s.instance_lock("engine", "owner-a");
        let b = s.instance_lock("engine", "owner-b");

        assert!(a.acquire_at(10_000, 1_000).unwrap());
        assert!(!b.acquire_at(10_000, 2_000).unwrap());

        // Re-acquisition by the current owner extends the lease.
        assert!(a.acquire_at(10_000, 3_000).unwrap());
    }

    #[test]
    fn expired_lock_is_stolen() {
        let s = Storage::open_in_memory().unwrap();
        let a = s.instance_lock("engine", "owner-a");
        let b = s.instance_lock("engine", "owner-b");

        assert!(a.acquire_at(1_000, 1_000).unwrap());
        // Lease ran out at 2_000.
        assert!(b.acquire_at(10_000, 2_500).unwrap());
        // The previous owner can no longer renew.
        assert!(!a.renew_at(1_000, 2_600).unwrap());
    }

    #[test]
    fn release_frees_for_next_owner() {
        let s = Storage::open_in_memory().unwrap();
        let a = s.instance_lock("engine", "owner-a");
        let b = s.instance_lock("engine", "owner-b");

        assert!(a.acquire_at(60_000, 1_000).unwrap());
        a.release().unwrap();
        assert!(b.acquire_at(60_000, 1_001).unwrap());
    }

    #[test]
    fn renew_succeeds_only_for_holder() {
        let s = Storage::open_in_memory().unwrap();
        let a = s.instance_lock("engine", "owner-a");
        assert!(a.acquire_at(5_000, 1_000).unwrap());
        assert!(a.renew_at(5_000, 2_000).unwrap());

        let b = s.instance_lock("engine", "owner-b");
        assert!(!b.renew_at(5_000, 2_000).unwrap());
    }

    #[test]
    fn contention_across_separate_connections_to_one_file() {
        // Two Storage handles on the same database file model two processes.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let first = Storage::open(&path).unwrap();
        let second = Storage::open(&path).unwrap();

        let a = first.instance_lock("engine", "process-a");
        let b = second.instance_lock("engine", "process-b");

        assert!(a.acquire_at(60_000, 1_000).unwrap());
        assert!(!b.acquire_at(60_000, 2_000).unwrap());

        a.release().unwrap();
        assert!(b.acquire_at(60_000, 3_000).unwrap());
    }
}
