// =============================================================================
// Positions repository — long-only per-symbol projection of trades
// =============================================================================
//
// Invariants enforced here:
//   - base_qty never goes negative (unmatched sell quantity is ignored)
//   - base_qty = 0 forces avg_entry_price = 0 and clears the trailing anchor
//   - version bumps on every mutation
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;

use super::{dec_from_sql, dec_to_sql};
use crate::types::{Order, Position, Side, Symbol};

pub(crate) fn get_in(conn: &Connection, symbol: &Symbol) -> Result<Position> {
    let row = conn
        .query_row(
            "SELECT base_qty, avg_entry_price, max_price_since_entry, version \
             FROM positions WHERE symbol = ?1",
            params![symbol.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .context("position lookup failed")?;

    match row {
        Some((qty, avg, max_price, version)) => Ok(Position {
            symbol: symbol.clone(),
            base_qty: dec_from_sql(&qty)?,
            avg_entry_price: dec_from_sql(&avg)?,
            max_price_since_entry: dec_from_sql(&max_price)?,
            version,
        }),
        None => Ok(Position::flat(symbol.clone())),
    }
}

fn store_in(conn: &Connection, pos: &Position) -> Result<()> {
    conn.execute(
        "INSERT INTO positions (symbol, base_qty, avg_entry_price, max_price_since_entry, version) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(symbol) DO UPDATE SET \
           base_qty = excluded.base_qty, \
           avg_entry_price = excluded.avg_entry_price, \
           max_price_since_entry = excluded.max_price_since_entry, \
           version = excluded.version",
        params![
            pos.symbol.to_string(),
            dec_to_sql(&pos.base_qty),
            dec_to_sql(&pos.avg_entry_price),
            dec_to_sql(&pos.max_price_since_entry),
            pos.version
        ],
    )
    .context("position store failed")?;
    Ok(())
}

/// Project one fill onto the position inside an existing transaction.
/// Returns `(position, opened, closed)`.
pub(crate) fn apply_fill_in(conn: &Connection, order: &Order) -> Result<(Position, bool, bool)> {
    let mut pos = get_in(conn, &order.symbol)?;
    let was_open = pos.is_open();

    match order.side {
        Side::Buy => {
            let new_qty = pos.base_qty + order.filled;
            if new_qty > Decimal::ZERO {
                // Weighted average entry, fees folded into the cost basis.
                let old_basis = pos.avg_entry_price * pos.base_qty;
                pos.avg_entry_price = (old_basis + order.cost + order.fee_quote) / new_qty;
            }
            pos.base_qty = new_qty;
            if order.price > pos.max_price_since_entry {
                pos.max_price_since_entry = order.price;
            }
        }
        Side::Sell => {
            // Long-only: anything beyond the held quantity is ignored.
            let consumed = order.filled.min(pos.base_qty);
            pos.base_qty -= consumed;
            if pos.base_qty <= Decimal::ZERO {
                pos.base_qty = Decimal::ZERO;
                pos.avg_entry_price = Decimal::ZERO;
                pos.max_price_since_entry = Decimal::ZERO;
            }
        }
    }

    pos.version += 1;
    store_in(conn, &pos)?;

    let opened = !was_open && pos.is_open();
    let closed = was_open && !pos.is_open();
    Ok((pos, opened, closed))
}

/// Repository over the `positions` table.
#[derive(Clone)]
pub struct PositionsRepo {
    conn: Arc<Mutex<Connection>>,
}

impl PositionsRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn get(&self, symbol: &Symbol) -> Result<Position> {
        let conn = self.conn.lock();
        get_in(&conn, symbol)
    }

    /// All positions with `base_qty > 0`.
    pub fn list_open(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, base_qty, avg_entry_price, max_price_since_entry, version \
             FROM positions WHERE CAST(base_qty AS REAL) > 0",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("open position scan failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for (symbol, qty, avg, max_price, version) in rows {
            out.push(Position {
                symbol: Symbol::parse(&symbol)
                    .map_err(|e| anyhow::anyhow!("corrupt position symbol: {e}"))?,
                base_qty: dec_from_sql(&qty)?,
                avg_entry_price: dec_from_sql(&avg)?,
                max_price_since_entry: dec_from_sql(&max_price)?,
                version,
            });
        }
        Ok(out)
    }

    /// Ratchet the trailing anchor up to `price` if it exceeds the stored
    /// maximum. No-op on flat positions.
    pub fn raise_max_price(&self, symbol: &Symbol, price: Decimal) -> Result<()> {
        let conn = self.conn.lock();
        let pos = get_in(&conn, symbol)?;
        if !pos.is_open() || price <= pos.max_price_since_entry {
            return Ok(());
        }
        let updated = Position {
            max_price_since_entry: price,
            version: pos.version + 1,
            ..pos
        };
        store_in(&conn, &updated)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::{now_ms, OrderStatus, OrderType};
    use rust_decimal_macros::dec;

    fn sym() -> Symbol {
        Symbol::parse("BTC/USDT").unwrap()
    }

    fn fill(side: Side, filled: Decimal, price: Decimal, fee: Decimal) -> Order {
        Order {
            id: uuid::Uuid::new_v4().to_string(),
            client_order_id: uuid::Uuid::new_v4().to_string(),
            symbol: sym(),
            side,
            order_type: OrderType::Market,
            amount: filled,
            price,
            filled,
            cost: filled * price,
            fee_quote: fee,
            status: OrderStatus::Closed,
            ts_ms: now_ms(),
        }
    }

    #[test]
    fn missing_position_reads_flat() {
        let s = Storage::open_in_memory().unwrap();
        let p = s.positions().get(&sym()).unwrap();
        assert_eq!(p.base_qty, Decimal::ZERO);
        assert_eq!(p.version, 0);
    }

    #[test]
    fn buy_sets_weighted_average_entry_with_fees() {
        let s = Storage::open_in_memory().unwrap();
        s.apply_fill(&fill(Side::Buy, dec!(1), dec!(100), dec!(1))).unwrap();
        let applied = s.apply_fill(&fill(Side::Buy, dec!(1), dec!(200), dec!(2))).unwrap();

        // (100 + 1 + 200 + 2) / 2
        assert_eq!(applied.position.base_qty, dec!(2));
        assert_eq!(applied.position.avg_entry_price, dec!(151.5));
        assert_eq!(applied.position.version, 2);
    }

    #[test]
    fn oversized_sell_never_goes_negative() {
        let s = Storage::open_in_memory().unwrap();
        s.apply_fill(&fill(Side::Buy, dec!(0.5), dec!(100), dec!(0))).unwrap();
        let applied = s.apply_fill(&fill(Side::Sell, dec!(2), dec!(110), dec!(0))).unwrap();

        assert_eq!(applied.position.base_qty, Decimal::ZERO);
        assert_eq!(applied.position.avg_entry_price, Decimal::ZERO);
        assert!(applied.closed);
    }

    #[test]
    fn raise_max_price_ratchets_only_upward() {
        let s = Storage::open_in_memory().unwrap();
        s.apply_fill(&fill(Side::Buy, dec!(1), dec!(100), dec!(0))).unwrap();
        let repo = s.positions();

        repo.raise_max_price(&sym(), dec!(120)).unwrap();
        assert_eq!(repo.get(&sym()).unwrap().max_price_since_entry, dec!(120));

        repo.raise_max_price(&sym(), dec!(110)).unwrap();
        assert_eq!(repo.get(&sym()).unwrap().max_price_since_entry, dec!(120));
    }

    #[test]
    fn list_open_skips_flat_positions() {
        let s = Storage::open_in_memory().unwrap();
        s.apply_fill(&fill(Side::Buy, dec!(1), dec!(100), dec!(0))).unwrap();
        s.apply_fill(&fill(Side::Sell, dec!(1), dec!(100), dec!(0))).unwrap();
        assert!(s.positions().list_open().unwrap().is_empty());

        s.apply_fill(&fill(Side::Buy, dec!(0.3), dec!(100), dec!(0))).unwrap();
        let open = s.positions().list_open().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].base_qty, dec!(0.3));
    }
}
