// =============================================================================
// Idempotency repository — claim / commit / release over a unique-key upsert
// =============================================================================
//
// Protocol (all timestamps in epoch ms):
//   claim(key, ttl_ms)  — atomic: INSERT OR IGNORE wins the slot; an existing
//                         record can only be re-claimed once expired.
//   commit(key, blob)   — claimed -> committed, stores the result payload.
//   release(key)        — deletes a *claimed* record (retry desired).
//   get_original(key)   — committed payload within TTL, else None.
//
// The unique primary key serializes concurrent claimers: exactly one caller
// observes `claim -> true` per key per TTL window, across crash/restart.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::types::now_ms;

/// Record states.
const STATE_CLAIMED: &str = "claimed";
const STATE_COMMITTED: &str = "committed";

/// Repository over the `idempotency` table.
#[derive(Clone)]
pub struct IdempotencyRepo {
    conn: Arc<Mutex<Connection>>,
}

impl IdempotencyRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Try to acquire the slot for `key`. Returns true iff this caller won:
    /// either the record is new, or the previous record expired.
    pub fn claim(&self, key: &str, ttl_ms: i64) -> Result<bool> {
        self.claim_at(key, ttl_ms, now_ms())
    }

    pub fn claim_at(&self, key: &str, ttl_ms: i64, now: i64) -> Result<bool> {
        let expires_at = now + ttl_ms.max(1);
        let conn = self.conn.lock();

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO idempotency (key, state, expires_at_ms, payload) \
                 VALUES (?1, ?2, ?3, NULL)",
                params![key, STATE_CLAIMED, expires_at],
            )
            .context("idempotency insert failed")?;
        if inserted == 1 {
            debug!(key, "idempotency slot claimed (new)");
            return Ok(true);
        }

        // Existing record: re-claim only if it expired.
        let reclaimed = conn
            .execute(
                "UPDATE idempotency SET state = ?1, expires_at_ms = ?2, payload = NULL \
                 WHERE key = ?3 AND expires_at_ms < ?4",
                params![STATE_CLAIMED, expires_at, key, now],
            )
            .context("idempotency re-claim failed")?;
        if reclaimed == 1 {
            debug!(key, "idempotency slot re-claimed (expired lease)");
        }
        Ok(reclaimed == 1)
    }

    /// Transition claimed -> committed and store the result payload.
    pub fn commit(&self, key: &str, payload: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE idempotency SET state = ?1, payload = ?2 WHERE key = ?3",
            params![STATE_COMMITTED, payload.to_string(), key],
        )
        .context("idempotency commit failed")?;
        Ok(())
    }

    /// Delete a claimed record so the key can be retried. Committed records
    /// are left untouched.
    pub fn release(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM idempotency WHERE key = ?1 AND state = ?2",
            params![key, STATE_CLAIMED],
        )
        .context("idempotency release failed")?;
        Ok(())
    }

    /// Committed payload for `key` if still within TTL.
    pub fn get_original(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.get_original_at(key, now_ms())
    }

    pub fn get_original_at(&self, key: &str, now: i64) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM idempotency \
                 WHERE key = ?1 AND state = ?2 AND expires_at_ms >= ?3",
                params![key, STATE_COMMITTED, now],
                |row| row.get(0),
            )
            .optional()
            .context("idempotency payload lookup failed")?;

        match payload {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).context("corrupt idempotency payload")?,
            )),
            None => Ok(None),
        }
    }

    /// Delete every record whose TTL elapsed. Returns the number pruned.
    pub fn prune_expired(&self) -> Result<usize> {
        self.prune_expired_at(now_ms())
    }

    pub fn prune_expired_at(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn
            .execute("DELETE FROM idempotency WHERE expires_at_ms < ?1", params![now])
            .context("idempotency prune failed")?;
        Ok(n)
    }
}
