// =============================================================================
// Trades repository — persisted fill records with upsert-on-client_order_id
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use super::{dec_from_sql, dec_to_sql};
use crate::types::{now_ms, Order, OrderStatus, OrderType, Side, Symbol, Trade};

const TRADE_COLUMNS: &str = "id, broker_order_id, client_order_id, symbol, side, order_type, \
     amount, price, filled, cost, fee_quote, status, ts_ms, inserted_ms";

fn map_row(row: &Row<'_>) -> rusqlite::Result<Trade> {
    let symbol: String = row.get(3)?;
    let side: String = row.get(4)?;
    let order_type: String = row.get(5)?;
    let status: String = row.get(11)?;
    let bad = |e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    };
    Ok(Trade {
        id: row.get(0)?,
        broker_order_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        client_order_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        symbol: Symbol::parse(&symbol).map_err(bad)?,
        side: Side::from_str(&side).map_err(bad)?,
        order_type: OrderType::from_str(&order_type).map_err(bad)?,
        amount: dec_from_sql(&row.get::<_, String>(6)?)?,
        price: dec_from_sql(&row.get::<_, String>(7)?)?,
        filled: dec_from_sql(&row.get::<_, String>(8)?)?,
        cost: dec_from_sql(&row.get::<_, String>(9)?)?,
        fee_quote: dec_from_sql(&row.get::<_, String>(10)?)?,
        status: OrderStatus::from_str(&status).map_err(bad)?,
        ts_ms: row.get(12)?,
        inserted_ms: row.get(13)?,
    })
}

/// Upsert inside an existing transaction. Returns `(trade_id, prev_status)`
/// where `prev_status` is the status the row had before this call (None when
/// the row is new).
pub(crate) fn upsert_in(
    conn: &Connection,
    order: &Order,
    now: i64,
) -> Result<(i64, Option<OrderStatus>)> {
    let existing: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, status FROM trades WHERE client_order_id = ?1",
            params![order.client_order_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("trade lookup by client_order_id failed")?;

    if let Some((id, prev_status)) = existing {
        conn.execute(
            "UPDATE trades SET broker_order_id = ?1, price = ?2, filled = ?3, cost = ?4, \
             fee_quote = ?5, status = ?6, ts_ms = ?7 WHERE id = ?8",
            params![
                order.id,
                dec_to_sql(&order.price),
                dec_to_sql(&order.filled),
                dec_to_sql(&order.cost),
                dec_to_sql(&order.fee_quote),
                order.status.to_string(),
                order.ts_ms,
                id
            ],
        )
        .context("trade update failed")?;
        let prev = OrderStatus::from_str(&prev_status)
            .map_err(|e| anyhow::anyhow!("corrupt trade status: {e}"))?;
        return Ok((id, Some(prev)));
    }

    conn.execute(
        "INSERT INTO trades (broker_order_id, client_order_id, symbol, side, order_type, \
         amount, price, filled, cost, fee_quote, status, ts_ms, inserted_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            order.id,
            order.client_order_id,
            order.symbol.to_string(),
            order.side.to_string(),
            order.order_type.to_string(),
            dec_to_sql(&order.amount),
            dec_to_sql(&order.price),
            dec_to_sql(&order.filled),
            dec_to_sql(&order.cost),
            dec_to_sql(&order.fee_quote),
            order.status.to_string(),
            order.ts_ms,
            now
        ],
    )
    .context("trade insert failed")?;
    Ok((conn.last_insert_rowid(), None))
}

/// Upsert keyed on `broker_order_id` (reconciliation path: broker-reported
/// orders that may carry no client id yet). Returns the trade row id.
pub(crate) fn upsert_by_broker_in(conn: &Connection, order: &Order, now: i64) -> Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM trades WHERE broker_order_id = ?1",
            params![order.id],
            |row| row.get(0),
        )
        .optional()
        .context("trade lookup by broker_order_id failed")?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE trades SET price = ?1, filled = ?2, cost = ?3, fee_quote = ?4, \
             status = ?5, ts_ms = ?6, \
             client_order_id = CASE \
               WHEN client_order_id IS NULL OR client_order_id = '' THEN ?7 \
               ELSE client_order_id END \
             WHERE id = ?8",
            params![
                dec_to_sql(&order.price),
                dec_to_sql(&order.filled),
                dec_to_sql(&order.cost),
                dec_to_sql(&order.fee_quote),
                order.status.to_string(),
                order.ts_ms,
                if order.client_order_id.is_empty() {
                    None
                } else {
                    Some(order.client_order_id.as_str())
                },
                id
            ],
        )
        .context("trade update by broker_order_id failed")?;
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO trades (broker_order_id, client_order_id, symbol, side, order_type, \
         amount, price, filled, cost, fee_quote, status, ts_ms, inserted_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            order.id,
            if order.client_order_id.is_empty() {
                None
            } else {
                Some(order.client_order_id.as_str())
            },
            order.symbol.to_string(),
            order.side.to_string(),
            order.order_type.to_string(),
            dec_to_sql(&order.amount),
            dec_to_sql(&order.price),
            dec_to_sql(&order.filled),
            dec_to_sql(&order.cost),
            dec_to_sql(&order.fee_quote),
            order.status.to_string(),
            order.ts_ms,
            now
        ],
    )
    .context("trade insert by broker_order_id failed")?;
    Ok(conn.last_insert_rowid())
}

/// Repository over the `trades` table.
#[derive(Clone)]
pub struct TradesRepo {
    conn: Arc<Mutex<Connection>>,
}

impl TradesRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Upsert on `client_order_id` outside a larger transaction. Returns the
    /// row id and the status the row had before (None when new).
    pub fn upsert(&self, order: &Order) -> Result<(i64, Option<OrderStatus>)> {
        let conn = self.conn.lock();
        upsert_in(&conn, order, now_ms())
    }

    /// Upsert on `broker_order_id` (reconciliation path).
    pub fn upsert_broker_order(&self, order: &Order) -> Result<i64> {
        let conn = self.conn.lock();
        upsert_by_broker_in(&conn, order, now_ms())
    }

    pub fn get_by_client_order_id(&self, client_order_id: &str) -> Result<Option<Trade>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {TRADE_COLUMNS} FROM trades WHERE client_order_id = ?1"),
            params![client_order_id],
            map_row,
        )
        .optional()
        .context("trade lookup by client_order_id failed")
    }

    pub fn get_by_broker_order_id(&self, broker_order_id: &str) -> Result<Option<Trade>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {TRADE_COLUMNS} FROM trades WHERE broker_order_id = ?1"),
            params![broker_order_id],
            map_row,
        )
        .optional()
        .context("trade lookup by broker_order_id failed")
    }

    /// Associate a `client_order_id` with an already-recorded broker order.
    pub fn bind_client_order_id(&self, broker_order_id: &str, client_order_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trades SET client_order_id = ?1 \
             WHERE broker_order_id = ?2 AND (client_order_id IS NULL OR client_order_id = '')",
            params![client_order_id, broker_order_id],
        )
        .context("binding client_order_id failed")?;
        Ok(())
    }

    /// All trades for a symbol in `ts_ms` (then insert) order — the FIFO
    /// replay source.
    pub fn list_symbol_asc(&self, symbol: &Symbol) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE symbol = ?1 ORDER BY ts_ms ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![symbol.to_string()], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("trade scan failed")?;
        Ok(rows)
    }

    /// Trades for a symbol within the current UTC day `[00:00, 24:00)`.
    pub fn list_today(&self, symbol: &Symbol, now: i64) -> Result<Vec<Trade>> {
        let day_start = now - now.rem_euclid(86_400_000);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE symbol = ?1 AND ts_ms >= ?2 ORDER BY ts_ms ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![symbol.to_string(), day_start], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("today's trade scan failed")?;
        Ok(rows)
    }

    /// Timestamp of the most recent trade for `symbol`, if any.
    pub fn last_trade_ts_ms(&self, symbol: &Symbol) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT MAX(ts_ms) FROM trades WHERE symbol = ?1",
            params![symbol.to_string()],
            |row| row.get::<_, Option<i64>>(0),
        )
        .context("last trade timestamp query failed")
    }

    /// Number of trades for `symbol` with `ts_ms >= since`.
    pub fn count_since(&self, symbol: &Symbol, since: i64) -> Result<u32> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE symbol = ?1 AND ts_ms >= ?2",
            params![symbol.to_string(), since],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u32)
        .context("trade count query failed")
    }

    /// Sum of quote `cost` for trades with `ts_ms >= since`.
    pub fn turnover_quote_since(&self, symbol: &Symbol, since: i64) -> Result<Decimal> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT cost FROM trades WHERE symbol = ?1 AND ts_ms >= ?2",
        )?;
        let mut total = Decimal::ZERO;
        let rows = stmt.query_map(params![symbol.to_string(), since], |row| {
            row.get::<_, String>(0)
        })?;
        for cost in rows {
            total += dec_from_sql(&cost?)?;
        }
        Ok(total)
    }

    /// Locally-recorded orders still marked `open` (reconciliation input).
    pub fn open_orders(&self, symbol: &Symbol) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE symbol = ?1 AND status = 'open' ORDER BY ts_ms ASC"
        ))?;
        let rows = stmt
            .query_map(params![symbol.to_string()], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("open order scan failed")?;
        Ok(rows)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use rust_decimal_macros::dec;

    fn sym() -> Symbol {
        Symbol::parse("ETH/USDT").unwrap()
    }

    fn order(coid: &str, side: Side, ts_ms: i64) -> Order {
        Order {
            id: format!("b-{coid}"),
            client_order_id: coid.to_string(),
            symbol: sym(),
            side,
            order_type: OrderType::Market,
            amount: dec!(0.5),
            price: dec!(3000),
            filled: dec!(0.5),
            cost: dec!(1500),
            fee_quote: dec!(1.5),
            status: OrderStatus::Closed,
            ts_ms,
        }
    }

    #[test]
    fn upsert_inserts_then_refreshes() {
        let repo = Storage::open_in_memory().unwrap().trades();
        let mut o = order("c-1", Side::Buy, 1_000);
        o.status = OrderStatus::Open;

        let (id1, prev1) = repo.upsert(&o).unwrap();
        assert_eq!(prev1, None);

        o.status = OrderStatus::Closed;
        o.filled = dec!(0.5);
        let (id2, prev2) = repo.upsert(&o).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(prev2, Some(OrderStatus::Open));

        let t = repo.get_by_client_order_id("c-1").unwrap().unwrap();
        assert_eq!(t.filled, dec!(0.5));
        assert_eq!(t.status, OrderStatus::Closed);
        assert_eq!(t.broker_order_id, "b-c-1");
    }

    #[test]
    fn upsert_broker_order_binds_client_id_when_missing() {
        let repo = Storage::open_in_memory().unwrap().trades();
        let mut o = order("", Side::Buy, 1_000);
        o.client_order_id = String::new();
        o.id = "ex-9".to_string();
        o.status = OrderStatus::Open;

        let id1 = repo.upsert_broker_order(&o).unwrap();

        // Second pass reports a fill and the late-bound client id.
        o.client_order_id = "c-bound".to_string();
        o.status = OrderStatus::Closed;
        o.filled = dec!(0.5);
        let id2 = repo.upsert_broker_order(&o).unwrap();
        assert_eq!(id1, id2);

        let t = repo.get_by_broker_order_id("ex-9").unwrap().unwrap();
        assert_eq!(t.client_order_id, "c-bound");
        assert_eq!(t.status, OrderStatus::Closed);
    }

    #[test]
    fn window_queries_respect_since_bound() {
        let repo = Storage::open_in_memory().unwrap().trades();
        repo.upsert(&order("c-1", Side::Buy, 1_000)).unwrap();
        repo.upsert(&order("c-2", Side::Buy, 2_000)).unwrap();
        repo.upsert(&order("c-3", Side::Sell, 10_000)).unwrap();

        assert_eq!(repo.count_since(&sym(), 2_000).unwrap(), 2);
        assert_eq!(repo.turnover_quote_since(&sym(), 2_000).unwrap(), dec!(3000));
        assert_eq!(repo.last_trade_ts_ms(&sym()).unwrap(), Some(10_000));
        assert_eq!(repo.last_trade_ts_ms(&Symbol::parse("XRP/USDT").unwrap()).unwrap(), None);
    }

    #[test]
    fn list_today_uses_utc_day_boundary() {
        let repo = Storage::open_in_memory().unwrap().trades();
        let now = 86_400_000 * 20 + 3_600_000; // day 20, 01:00 UTC
        repo.upsert(&order("yesterday", Side::Buy, 86_400_000 * 20 - 1)).unwrap();
        repo.upsert(&order("today", Side::Buy, 86_400_000 * 20 + 1)).unwrap();

        let today = repo.list_today(&sym(), now).unwrap();
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].client_order_id, "today");
    }

    #[test]
    fn bind_client_order_id_only_fills_missing() {
        let repo = Storage::open_in_memory().unwrap().trades();
        let mut o = order("", Side::Buy, 1_000);
        o.client_order_id = String::new();
        o.id = "ex-77".to_string();
        // Insert a row with no client id (as reconciliation would).
        repo.upsert_raw_for_tests(&o);

        repo.bind_client_order_id("ex-77", "c-late").unwrap();
        let t = repo.get_by_broker_order_id("ex-77").unwrap().unwrap();
        assert_eq!(t.client_order_id, "c-late");

        // A second bind does not overwrite.
        repo.bind_client_order_id("ex-77", "c-other").unwrap();
        let t = repo.get_by_broker_order_id("ex-77").unwrap().unwrap();
        assert_eq!(t.client_order_id, "c-late");
    }

    impl TradesRepo {
        /// Insert bypassing the client_order_id upsert path (test helper for
        /// rows that lack a client id).
        fn upsert_raw_for_tests(&self, order: &Order) {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO trades (broker_order_id, client_order_id, symbol, side, order_type, \
                 amount, price, filled, cost, fee_quote, status, ts_ms, inserted_ms) \
                 VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    order.id,
                    order.symbol.to_string(),
                    order.side.to_string(),
                    order.order_type.to_string(),
                    dec_to_sql(&order.amount),
                    dec_to_sql(&order.price),
                    dec_to_sql(&order.filled),
                    dec_to_sql(&order.cost),
                    dec_to_sql(&order.fee_quote),
                    order.status.to_string(),
                    order.ts_ms,
                    now_ms()
                ],
            )
            .unwrap();
        }
    }
}
