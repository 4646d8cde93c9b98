// =============================================================================
// Storage — SQLite-backed ports for trades, positions, idempotency, audit, KV
// =============================================================================
//
// One connection, shared behind a mutex. Reads go straight through; writes
// that must be atomic (fill ingestion) run inside a BEGIN IMMEDIATE
// transaction so concurrent loops never interleave position mutations.
//
// Unit rule: every timestamp and TTL column is epoch **milliseconds**.
// Decimals are stored as TEXT and parsed back with full precision.
// =============================================================================

pub mod audit;
pub mod idempotency;
pub mod instance_lock;
pub mod kv;
pub mod positions;
pub mod trades;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::types::{now_ms, Order, Position};

pub use audit::AuditRepo;
pub use idempotency::IdempotencyRepo;
pub use instance_lock::InstanceLock;
pub use kv::KvRepo;
pub use positions::PositionsRepo;
pub use trades::TradesRepo;

// ---------------------------------------------------------------------------
// Decimal <-> TEXT helpers shared by the repositories
// ---------------------------------------------------------------------------

pub(crate) fn dec_to_sql(d: &Decimal) -> String {
    d.normalize().to_string()
}

pub(crate) fn dec_from_sql(s: &str) -> rusqlite::Result<Decimal> {
    s.parse::<Decimal>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Outcome of ingesting one fill atomically.
#[derive(Debug, Clone)]
pub struct AppliedFill {
    pub trade_id: i64,
    pub position: Position,
    /// The fill was applied to the position this time (false = duplicate or
    /// not-yet-closed ingestion).
    pub applied: bool,
    /// `base_qty` transitioned 0 -> positive.
    pub opened: bool,
    /// `base_qty` transitioned positive -> 0.
    pub closed: bool,
}

/// Shared handle over the SQLite store.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the database file and bootstrap the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        let storage = Self::bootstrap(conn)?;
        info!(path = %path.display(), "storage opened");
        Ok(storage)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "busy_timeout", 30_000)
            .context("failed to set busy_timeout")?;
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA).context("failed to bootstrap schema")?;
        debug!("storage schema bootstrapped");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -------------------------------------------------------------------------
    // Repositories
    // -------------------------------------------------------------------------

    pub fn trades(&self) -> TradesRepo {
        TradesRepo::new(self.conn.clone())
    }

    pub fn positions(&self) -> PositionsRepo {
        PositionsRepo::new(self.conn.clone())
    }

    pub fn idempotency(&self) -> IdempotencyRepo {
        IdempotencyRepo::new(self.conn.clone())
    }

    pub fn audit(&self) -> AuditRepo {
        AuditRepo::new(self.conn.clone())
    }

    pub fn kv(&self) -> KvRepo {
        KvRepo::new(self.conn.clone())
    }

    /// Instance lock bound to this database, identifying the owner by `owner`.
    pub fn instance_lock(&self, app: &str, owner: &str) -> InstanceLock {
        InstanceLock::new(self.conn.clone(), app, owner)
    }

    // -------------------------------------------------------------------------
    // Transactional fill ingestion
    // -------------------------------------------------------------------------

    /// Persist one fill atomically: upsert the trade row, project it onto the
    /// position (bumping its version), and append the audit entry — all in a
    /// single BEGIN IMMEDIATE transaction.
    ///
    /// The position is projected only on the row's first transition to
    /// `closed`, so ingesting the same `client_order_id` again (execute-path
    /// retry, reconciliation replay) is a no-op for the position.
    pub fn apply_fill(&self, order: &Order) -> Result<AppliedFill> {
        anyhow::ensure!(
            !order.client_order_id.is_empty(),
            "fill ingestion requires a client_order_id"
        );
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin immediate transaction")?;

        let now = now_ms();
        let (trade_id, prev_status) = trades::upsert_in(&tx, order, now)?;
        let first_close = order.status == crate::types::OrderStatus::Closed
            && prev_status != Some(crate::types::OrderStatus::Closed);

        let (position, opened, closed) = if first_close {
            positions::apply_fill_in(&tx, order)?
        } else {
            let pos = positions::get_in(&tx, &order.symbol)?;
            (pos, false, false)
        };

        if first_close {
            audit::append_in(
                &tx,
                now,
                "trade_recorded",
                &serde_json::json!({
                    "symbol": order.symbol.to_string(),
                    "side": order.side.to_string(),
                    "client_order_id": order.client_order_id,
                    "broker_order_id": order.id,
                    "filled": order.filled.to_string(),
                    "price": order.price.to_string(),
                    "cost": order.cost.to_string(),
                    "fee_quote": order.fee_quote.to_string(),
                }),
            )?;
        }

        tx.commit().context("failed to commit fill transaction")?;

        Ok(AppliedFill {
            trade_id,
            position,
            applied: first_close,
            opened,
            closed,
        })
    }

    /// Cheap connectivity probe used by the health checker.
    pub fn ping(&self) -> bool {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|v| v == 1)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  broker_order_id TEXT,
  client_order_id TEXT,
  symbol          TEXT NOT NULL,
  side            TEXT NOT NULL,
  order_type      TEXT NOT NULL,
  amount          TEXT NOT NULL,
  price           TEXT NOT NULL,
  filled          TEXT NOT NULL,
  cost            TEXT NOT NULL,
  fee_quote       TEXT NOT NULL,
  status          TEXT NOT NULL,
  ts_ms           INTEGER NOT NULL,
  inserted_ms     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_symbol_ts ON trades(symbol, ts_ms);
CREATE UNIQUE INDEX IF NOT EXISTS uq_trades_client_order_id
  ON trades(client_order_id) WHERE client_order_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS uq_trades_broker_order_id
  ON trades(broker_order_id) WHERE broker_order_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS positions (
  symbol                TEXT PRIMARY KEY,
  base_qty              TEXT NOT NULL,
  avg_entry_price       TEXT NOT NULL,
  max_price_since_entry TEXT NOT NULL,
  version               INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS idempotency (
  key           TEXT PRIMARY KEY,
  state         TEXT NOT NULL,
  expires_at_ms INTEGER NOT NULL,
  payload       TEXT
);
CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency(expires_at_ms);

CREATE TABLE IF NOT EXISTS audit_log (
  id           INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms        INTEGER NOT NULL,
  kind         TEXT NOT NULL,
  payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log(ts_ms);

CREATE TABLE IF NOT EXISTS kv (
  key        TEXT PRIMARY KEY,
  value      TEXT NOT NULL,
  updated_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS app_locks (
  app          TEXT PRIMARY KEY,
  owner        TEXT NOT NULL,
  expire_at_ms INTEGER NOT NULL
);
"#;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderStatus, OrderType, Side, Symbol};
    use rust_decimal_macros::dec;

    fn sym() -> Symbol {
        Symbol::parse("BTC/USDT").unwrap()
    }

    fn buy_order(coid: &str, filled: Decimal, price: Decimal) -> Order {
        let cost = filled * price;
        Order {
            id: format!("ex-{coid}"),
            client_order_id: coid.to_string(),
            symbol: sym(),
            side: Side::Buy,
            order_type: OrderType::Market,
            amount: filled,
            price,
            filled,
            cost,
            fee_quote: dec!(0.1),
            status: OrderStatus::Closed,
            ts_ms: now_ms(),
        }
    }

    #[test]
    fn ping_reports_healthy_database() {
        let s = Storage::open_in_memory().unwrap();
        assert!(s.ping());
    }

    #[test]
    fn apply_fill_persists_trade_and_projects_position() {
        let s = Storage::open_in_memory().unwrap();
        let order = buy_order("c-1", dec!(0.002), dec!(50000));

        let applied = s.apply_fill(&order).unwrap();
        assert!(applied.applied);
        assert!(applied.opened);
        assert!(!applied.closed);
        assert_eq!(applied.position.base_qty, dec!(0.002));
        assert!(applied.position.version >= 1);

        let trade = s.trades().get_by_client_order_id("c-1").unwrap().unwrap();
        assert_eq!(trade.filled, dec!(0.002));

        // Audit entry accompanies the fill.
        let entries = s.audit().list_recent(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, "trade_recorded");
    }

    #[test]
    fn duplicate_fill_does_not_double_apply_position() {
        let s = Storage::open_in_memory().unwrap();
        let order = buy_order("c-dup", dec!(0.001), dec!(50000));

        let first = s.apply_fill(&order).unwrap();
        let second = s.apply_fill(&order).unwrap();

        assert!(first.applied);
        assert!(!second.applied);
        assert_eq!(second.position.base_qty, dec!(0.001));
        assert_eq!(first.trade_id, second.trade_id);
    }

    #[test]
    fn sell_fill_closes_position() {
        let s = Storage::open_in_memory().unwrap();
        s.apply_fill(&buy_order("c-b", dec!(0.002), dec!(50000))).unwrap();

        let mut sell = buy_order("c-s", dec!(0.002), dec!(51000));
        sell.side = Side::Sell;
        let applied = s.apply_fill(&sell).unwrap();

        assert!(applied.closed);
        assert_eq!(applied.position.base_qty, Decimal::ZERO);
        assert_eq!(applied.position.avg_entry_price, Decimal::ZERO);
    }

    #[test]
    fn decimal_roundtrip_preserves_precision() {
        let d = dec!(0.000123456789012345);
        let back = dec_from_sql(&dec_to_sql(&d)).unwrap();
        assert_eq!(back, d);
    }
}
