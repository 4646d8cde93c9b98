// =============================================================================
// Audit repository — append-only event journal, never deleted
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::types::now_ms;

/// One audit row.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub ts_ms: i64,
    pub kind: String,
    pub payload: serde_json::Value,
}

pub(crate) fn append_in(
    conn: &Connection,
    ts_ms: i64,
    kind: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (ts_ms, kind, payload_json) VALUES (?1, ?2, ?3)",
        params![ts_ms, kind, payload.to_string()],
    )
    .context("audit append failed")?;
    Ok(())
}

/// Repository over the `audit_log` table.
#[derive(Clone)]
pub struct AuditRepo {
    conn: Arc<Mutex<Connection>>,
}

impl AuditRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn append(&self, kind: &str, payload: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        append_in(&conn, now_ms(), kind, payload)
    }

    /// Most recent entries, newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ts_ms, kind, payload_json FROM audit_log \
             ORDER BY ts_ms DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("audit scan failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, ts_ms, kind, raw) in rows {
            out.push(AuditEntry {
                id,
                ts_ms,
                kind,
                payload: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(out)
    }

    /// Count entries of a given kind (test and diagnostics helper).
    pub fn count_kind(&self, kind: &str) -> Result<u32> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE kind = ?1",
            params![kind],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u32)
        .context("audit count failed")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use serde_json::json;

    #[test]
    fn append_and_read_back_in_reverse_order() {
        let repo = Storage::open_in_memory().unwrap().audit();
        repo.append("dms_triggered", &json!({"symbol": "BTC/USDT"})).unwrap();
        repo.append("exit_below_min", &json!({"symbol": "ETH/USDT"})).unwrap();

        let entries = repo.list_recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "exit_below_min");
        assert_eq!(entries[1].kind, "dms_triggered");
        assert_eq!(entries[1].payload["symbol"], "BTC/USDT");
        assert_eq!(repo.count_kind("dms_triggered").unwrap(), 1);
    }
}
