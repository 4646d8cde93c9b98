// =============================================================================
// FIFO realized PnL — the single accounting routine behind the risk rules
// =============================================================================
//
// Strict FIFO: buys append lots of (qty, unit_cost) where the unit cost folds
// the buy fee into the basis; sells consume lots oldest-first, and each sale's
// fee is subtracted once from that sale's total. Unmatched sell quantity is
// ignored (the engine is long-only). Replaying the same trades always yields
// the same result — determinism is what lets the rules recompute from
// storage instead of carrying mutable state.
// =============================================================================

use rust_decimal::Decimal;

use crate::types::{Side, Trade};

/// One realized sale produced by the FIFO replay.
#[derive(Debug, Clone)]
pub struct RealizedSale {
    pub ts_ms: i64,
    pub pnl_quote: Decimal,
}

/// Result of replaying a trade history.
#[derive(Debug, Clone, Default)]
pub struct FifoPnl {
    pub sales: Vec<RealizedSale>,
    /// Remaining open buy lots as (qty, unit_cost_quote).
    pub open_lots: Vec<(Decimal, Decimal)>,
}

impl FifoPnl {
    /// Total realized PnL across all sales.
    pub fn total(&self) -> Decimal {
        self.sales.iter().map(|s| s.pnl_quote).sum()
    }

    /// Realized PnL for sales with `ts_ms >= since`.
    pub fn realized_since(&self, since: i64) -> Decimal {
        self.sales
            .iter()
            .filter(|s| s.ts_ms >= since)
            .map(|s| s.pnl_quote)
            .sum()
    }

    /// Number of consecutive losing sales counted back from the latest sale.
    pub fn trailing_loss_streak(&self) -> u32 {
        let mut streak = 0;
        for sale in self.sales.iter().rev() {
            if sale.pnl_quote < Decimal::ZERO {
                streak += 1;
            } else {
                break;
            }
        }
        streak
    }

    /// Worst relative drawdown of the cumulative-PnL curve over sales with
    /// `ts_ms >= since`, as a fraction. The peak denominator falls back to 1
    /// while the curve has no positive peak yet.
    pub fn max_drawdown_since(&self, since: i64) -> Decimal {
        let mut cum = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut worst = Decimal::ZERO;

        for sale in self.sales.iter().filter(|s| s.ts_ms >= since) {
            cum += sale.pnl_quote;
            if cum > peak {
                peak = cum;
            }
            let denom = if peak == Decimal::ZERO { Decimal::ONE } else { peak.abs() };
            let dd = (peak - cum) / denom;
            if dd > worst {
                worst = dd;
            }
        }
        worst
    }
}

/// Replay `trades` (must be in ascending time order) through the FIFO ledger.
pub fn replay(trades: &[Trade]) -> FifoPnl {
    let mut lots: Vec<(Decimal, Decimal)> = Vec::new();
    let mut sales = Vec::new();

    for trade in trades {
        let filled = trade.filled;
        if filled <= Decimal::ZERO {
            continue;
        }

        match trade.side {
            Side::Buy => {
                let unit_cost = (trade.cost + trade.fee_quote) / filled;
                lots.push((filled, unit_cost));
            }
            Side::Sell => {
                let mut qty = filled;
                let mut realized = Decimal::ZERO;
                while qty > Decimal::ZERO && !lots.is_empty() {
                    let (lot_qty, lot_cost) = lots[0];
                    let take = lot_qty.min(qty);
                    realized += take * (trade.price - lot_cost);
                    qty -= take;
                    if take == lot_qty {
                        lots.remove(0);
                    } else {
                        lots[0].0 = lot_qty - take;
                    }
                }
                // The sell fee applies to the sale once, matched or not.
                realized -= trade.fee_quote;
                sales.push(RealizedSale {
                    ts_ms: trade.ts_ms,
                    pnl_quote: realized,
                });
            }
        }
    }

    FifoPnl {
        sales,
        open_lots: lots,
    }
}

/// Start of the current UTC day `[00:00, 24:00)` in epoch ms.
pub fn utc_day_start(now_ms: i64) -> i64 {
    now_ms - now_ms.rem_euclid(86_400_000)
}
