// =============================================================================
// KV repository — small persisted operational state
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::now_ms;

/// Repository over the `kv` table.
#[derive(Clone)]
pub struct KvRepo {
    conn: Arc<Mutex<Connection>>,
}

impl KvRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, updated_ms) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ms = excluded.updated_ms",
            params![key, value, now_ms()],
        )
        .context("kv put failed")?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .context("kv get failed")
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .context("kv delete failed")?;
        Ok(())
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
    fn put_get_overwrite_delete() {
        let kv = Storage::open_in_memory().unwrap().kv();
        assert_eq!(kv.get("a").unwrap(), None);

        kv.put("a", "1").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));

        kv.put("a", "2").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("2"));

        kv.delete("a").unwrap();
        assert_eq!(kv.get("a").unwrap(), None);
    }
}
