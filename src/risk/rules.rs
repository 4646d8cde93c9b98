// =============================================================================
// Risk rules — the ordered checks every decision must clear before execution
// =============================================================================
//
// Each rule answers `(allow, reason, details)`. Rules that cannot obtain
// their data allow with reason "no_data": the pipeline fails open on gaps and
// fails closed only on an explicit breach. A limit of zero disables a rule.
// =============================================================================

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use super::pnl;
use crate::settings::Settings;
use crate::storage::Storage;
use crate::types::{Side, Symbol, Ticker};

/// Outcome of one rule evaluation.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub allow: bool,
    pub reason: String,
    pub details: serde_json::Value,
}

impl Verdict {
    pub fn allow(reason: &str) -> Self {
        Self {
            allow: true,
            reason: reason.to_string(),
            details: json!({}),
        }
    }

    pub fn allow_with(reason: &str, details: serde_json::Value) -> Self {
        Self {
            allow: true,
            reason: reason.to_string(),
            details,
        }
    }

    pub fn block(reason: &str, details: serde_json::Value) -> Self {
        Self {
            allow: false,
            reason: reason.to_string(),
            details,
        }
    }
}

/// Everything a rule may consult. Statistics come from storage; the ticker is
/// the snapshot the evaluation tick already fetched.
pub struct RuleContext<'a> {
    pub symbol: &'a Symbol,
    pub side: Side,
    /// Estimated base quantity this order would add (buys only).
    pub projected_base: Decimal,
    pub ticker: Option<&'a Ticker>,
    pub storage: &'a Storage,
    pub settings: &'a Settings,
    pub now_ms: i64,
}

/// One link in the pipeline.
pub trait RiskRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &RuleContext<'_>) -> Verdict;
}

// ---------------------------------------------------------------------------
// 1. Time drift
// ---------------------------------------------------------------------------

/// Local clock vs the broker-reported ticker timestamp.
pub struct TimeDriftRule;

impl RiskRule for TimeDriftRule {
    fn name(&self) -> &'static str {
        "time_drift"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        let max = ctx.settings.risk.max_drift_ms;
        if max <= 0 {
            return Verdict::allow("disabled");
        }
        let Some(ticker) = ctx.ticker else {
            return Verdict::allow("no_data");
        };
        let drift = (ctx.now_ms - ticker.ts_ms).abs();
        if drift > max {
            return Verdict::block(
                "time_drift",
                json!({ "drift_ms": drift, "limit_ms": max }),
            );
        }
        Verdict::allow("ok")
    }
}

// ---------------------------------------------------------------------------
// 2. Trading hours
// ---------------------------------------------------------------------------

/// Optional UTC `[start_hour, end_hour)` trading window.
pub struct TradingHoursRule;

impl RiskRule for TradingHoursRule {
    fn name(&self) -> &'static str {
        "trading_hours"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        let Some((start, end)) = ctx.settings.risk.trading_hours_utc else {
            return Verdict::allow("disabled");
        };
        let Some(dt) = DateTime::<Utc>::from_timestamp_millis(ctx.now_ms) else {
            return Verdict::allow("no_data");
        };
        let hour = dt.hour();
        if hour < start || hour >= end {
            return Verdict::block(
                "trading_hours",
                json!({ "hour_utc": hour, "window": [start, end] }),
            );
        }
        Verdict::allow("ok")
    }
}

// ---------------------------------------------------------------------------
// 3. Cooldown
// ---------------------------------------------------------------------------

/// Minimum pause after the last executed trade on this symbol.
pub struct CooldownRule;

impl RiskRule for CooldownRule {
    fn name(&self) -> &'static str {
        "cooldown"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        let cooldown_sec = ctx.settings.risk.cooldown_sec;
        if cooldown_sec <= 0 {
            return Verdict::allow("disabled");
        }
        let last = match ctx.storage.trades().last_trade_ts_ms(ctx.symbol) {
            Ok(Some(ts)) => ts,
            Ok(None) => return Verdict::allow("no_trades"),
            Err(_) => return Verdict::allow("no_data"),
        };
        let elapsed_sec = (ctx.now_ms - last) / 1000;
        if elapsed_sec < cooldown_sec {
            return Verdict::block(
                "cooldown",
                json!({ "elapsed_sec": elapsed_sec, "need_sec": cooldown_sec }),
            );
        }
        Verdict::allow("ok")
    }
}

// ---------------------------------------------------------------------------
// 4. Spread cap
// ---------------------------------------------------------------------------

/// Reject when the relative bid/ask spread reaches the cap.
pub struct SpreadCapRule;

impl RiskRule for SpreadCapRule {
    fn name(&self) -> &'static str {
        "spread_cap"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        let max = ctx.settings.risk.max_spread_pct;
        if max <= Decimal::ZERO {
            return Verdict::allow("disabled");
        }
        let Some(ticker) = ctx.ticker else {
            return Verdict::allow("no_data");
        };
        let mid = ticker.mid();
        if mid <= Decimal::ZERO {
            return Verdict::allow("no_data");
        }
        let spread = (ticker.ask - ticker.bid) / mid;
        if spread >= max {
            return Verdict::block(
                "spread_cap",
                json!({ "spread_pct": spread.to_string(), "limit_pct": max.to_string() }),
            );
        }
        Verdict::allow("ok")
    }
}

// ---------------------------------------------------------------------------
// 5. Position cap (buys)
// ---------------------------------------------------------------------------

/// Cap the base inventory a single symbol may accumulate.
pub struct PositionCapRule;

impl RiskRule for PositionCapRule {
    fn name(&self) -> &'static str {
        "position_cap"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        if ctx.side != Side::Buy {
            return Verdict::allow("not_applicable");
        }
        let max = ctx.settings.risk.max_position_base;
        if max <= Decimal::ZERO {
            return Verdict::allow("disabled");
        }
        let position = match ctx.storage.positions().get(ctx.symbol) {
            Ok(p) => p,
            Err(_) => return Verdict::allow("no_data"),
        };
        // At the cap, or the projected add would cross it: both rejected.
        if position.base_qty >= max || position.base_qty + ctx.projected_base > max {
            return Verdict::block(
                "position_cap",
                json!({
                    "base_qty": position.base_qty.to_string(),
                    "projected_add": ctx.projected_base.to_string(),
                    "limit": max.to_string(),
                }),
            );
        }
        Verdict::allow("ok")
    }
}

// ---------------------------------------------------------------------------
// 6. Sell without position (sells)
// ---------------------------------------------------------------------------

/// Long-only enforcement: a sell with no inventory is never sent.
pub struct SellWithoutPositionRule;

impl RiskRule for SellWithoutPositionRule {
    fn name(&self) -> &'static str {
        "no_position"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        if ctx.side != Side::Sell {
            return Verdict::allow("not_applicable");
        }
        let position = match ctx.storage.positions().get(ctx.symbol) {
            Ok(p) => p,
            Err(_) => return Verdict::allow("no_data"),
        };
        if position.base_qty <= Decimal::ZERO {
            return Verdict::block(
                "no_position",
                json!({ "base_qty": position.base_qty.to_string() }),
            );
        }
        Verdict::allow("ok")
    }
}

// ---------------------------------------------------------------------------
// 7. Orders-per-hour throttle
// ---------------------------------------------------------------------------

pub struct OrdersPerHourRule;

impl RiskRule for OrdersPerHourRule {
    fn name(&self) -> &'static str {
        "orders_per_hour"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        let max = ctx.settings.risk.max_orders_per_hour;
        if max == 0 {
            return Verdict::allow("disabled");
        }
        let count = match ctx.storage.trades().count_since(ctx.symbol, ctx.now_ms - 3_600_000) {
            Ok(n) => n,
            Err(_) => return Verdict::allow("no_data"),
        };
        if count >= max {
            return Verdict::block(
                "orders_per_hour",
                json!({ "count_1h": count, "limit": max }),
            );
        }
        Verdict::allow("ok")
    }
}

// ---------------------------------------------------------------------------
// 8. Turnover 5m budget
// ---------------------------------------------------------------------------

pub struct Turnover5mRule;

impl RiskRule for Turnover5mRule {
    fn name(&self) -> &'static str {
        "turnover_5m"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        let max = ctx.settings.risk.max_turnover_5m_quote;
        if max <= Decimal::ZERO {
            return Verdict::allow("disabled");
        }
        let turnover = match ctx
            .storage
            .trades()
            .turnover_quote_since(ctx.symbol, ctx.now_ms - 300_000)
        {
            Ok(t) => t,
            Err(_) => return Verdict::allow("no_data"),
        };
        if turnover >= max {
            return Verdict::block(
                "turnover_5m",
                json!({ "turnover": turnover.to_string(), "limit": max.to_string() }),
            );
        }
        Verdict::allow("ok")
    }
}

// ---------------------------------------------------------------------------
// 9. Loss streak
// ---------------------------------------------------------------------------

/// Consecutive realized-loss sells computed via FIFO over the full history.
pub struct LossStreakRule;

impl RiskRule for LossStreakRule {
    fn name(&self) -> &'static str {
        "loss_streak"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        let max = ctx.settings.risk.max_loss_streak;
        if max == 0 {
            return Verdict::allow("disabled");
        }
        let trades = match ctx.storage.trades().list_symbol_asc(ctx.symbol) {
            Ok(t) if !t.is_empty() => t,
            Ok(_) => return Verdict::allow("no_trades"),
            Err(_) => return Verdict::allow("no_data"),
        };
        let streak = pnl::replay(&trades).trailing_loss_streak();
        if streak >= max {
            return Verdict::block(
                "loss_streak",
                json!({ "streak": streak, "limit": max }),
            );
        }
        Verdict::allow_with("ok", json!({ "streak": streak }))
    }
}

// ---------------------------------------------------------------------------
// 10. Max daily drawdown
// ---------------------------------------------------------------------------

/// Intraday drawdown of the cumulative realized-PnL curve.
pub struct MaxDrawdownRule;

impl RiskRule for MaxDrawdownRule {
    fn name(&self) -> &'static str {
        "max_drawdown"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        let max = ctx.settings.risk.max_drawdown_pct;
        if max <= Decimal::ZERO {
            return Verdict::allow("disabled");
        }
        let trades = match ctx.storage.trades().list_today(ctx.symbol, ctx.now_ms) {
            Ok(t) if !t.is_empty() => t,
            Ok(_) => return Verdict::allow("no_today_trades"),
            Err(_) => return Verdict::allow("no_data"),
        };
        let day_start = pnl::utc_day_start(ctx.now_ms);
        let dd = pnl::replay(&trades).max_drawdown_since(day_start);
        if dd >= max {
            return Verdict::block(
                "max_drawdown",
                json!({ "drawdown_pct": dd.to_string(), "limit_pct": max.to_string() }),
            );
        }
        Verdict::allow("ok")
    }
}

// ---------------------------------------------------------------------------
// 11. Daily loss limit
// ---------------------------------------------------------------------------

pub struct DailyLossRule;

impl RiskRule for DailyLossRule {
    fn name(&self) -> &'static str {
        "daily_loss"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        let limit = ctx.settings.risk.daily_loss_limit_quote;
        if limit <= Decimal::ZERO {
            return Verdict::allow("disabled");
        }
        let trades = match ctx.storage.trades().list_today(ctx.symbol, ctx.now_ms) {
            Ok(t) if !t.is_empty() => t,
            Ok(_) => return Verdict::allow("no_today_trades"),
            Err(_) => return Verdict::allow("no_data"),
        };
        let day_start = pnl::utc_day_start(ctx.now_ms);
        let today = pnl::replay(&trades).realized_since(day_start);
        if today <= -limit {
            return Verdict::block(
                "daily_loss",
                json!({ "pnl_today": today.to_string(), "limit": limit.to_string() }),
            );
        }
        Verdict::allow("ok")
    }
}

// ---------------------------------------------------------------------------
// 12. Anti-correlation
// ---------------------------------------------------------------------------

/// At most one open position per correlation group.
pub struct AntiCorrelationRule;

impl RiskRule for AntiCorrelationRule {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Verdict {
        if ctx.side != Side::Buy {
            return Verdict::allow("not_applicable");
        }
        let groups = &ctx.settings.risk.correlation_groups;
        let Some(group) = groups.iter().find(|g| g.contains(ctx.symbol)) else {
            return Verdict::allow("no_group");
        };
        for sibling in group.iter().filter(|s| *s != ctx.symbol) {
            match ctx.storage.positions().get(sibling) {
                Ok(p) if p.is_open() => {
                    return Verdict::block(
                        "correlation",
                        json!({
                            "symbol": ctx.symbol.to_string(),
                            "open_sibling": sibling.to_string(),
                            "base_qty": p.base_qty.to_string(),
                        }),
                    );
                }
                Ok(_) => {}
                Err(_) => return Verdict::allow("no_data"),
            }
        }
        Verdict::allow("ok")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::{now_ms, Order, OrderStatus, OrderType};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_map(&env).unwrap()
    }

    fn sym() -> Symbol {
        Symbol::parse("BTC/USDT").unwrap()
    }

    fn ticker(bid: Decimal, ask: Decimal, ts_ms: i64) -> Ticker {
        Ticker {
            symbol: sym(),
            last: (bid + ask) / Decimal::TWO,
            bid,
            ask,
            ts_ms,
        }
    }

    fn fill(side: Side, filled: Decimal, price: Decimal, fee: Decimal, ts_ms: i64) -> Order {
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
            ts_ms,
        }
    }

    struct Fixture {
        storage: Storage,
        settings: Settings,
        now: i64,
    }

    impl Fixture {
        fn new(pairs: &[(&str, &str)]) -> Self {
            Self {
                storage: Storage::open_in_memory().unwrap(),
                settings: settings(pairs),
                now: now_ms(),
            }
        }

        fn ctx<'a>(
            &'a self,
            side: Side,
            projected: Decimal,
            ticker: Option<&'a Ticker>,
        ) -> RuleContext<'a> {
            RuleContext {
                symbol: &self.settings.symbols[0],
                side,
                projected_base: projected,
                ticker,
                storage: &self.storage,
                settings: &self.settings,
                now_ms: self.now,
            }
        }
    }

    #[test]
    fn spread_exactly_at_cap_is_rejected() {
        let f = Fixture::new(&[("RISK_MAX_SPREAD_PCT", "0.04")]);
        // bid 49000 / ask 51000: spread 2000, mid 50000 -> exactly 4 %.
        let t = ticker(dec!(49000), dec!(51000), f.now);
        let v = SpreadCapRule.check(&f.ctx(Side::Buy, dec!(0.001), Some(&t)));
        assert!(!v.allow);
        assert_eq!(v.reason, "spread_cap");

        // A hair under the cap passes.
        let t = ticker(dec!(49001), dec!(51000), f.now);
        assert!(SpreadCapRule.check(&f.ctx(Side::Buy, dec!(0.001), Some(&t))).allow);
    }

    #[test]
    fn spread_rule_fails_open_without_ticker() {
        let f = Fixture::new(&[("RISK_MAX_SPREAD_PCT", "0.001")]);
        let v = SpreadCapRule.check(&f.ctx(Side::Buy, dec!(0.001), None));
        assert!(v.allow);
        assert_eq!(v.reason, "no_data");
    }

    #[test]
    fn time_drift_blocks_on_stale_ticker() {
        let f = Fixture::new(&[("RISK_MAX_DRIFT_MS", "5000")]);
        let stale = ticker(dec!(100), dec!(101), f.now - 10_000);
        assert!(!TimeDriftRule.check(&f.ctx(Side::Buy, dec!(1), Some(&stale))).allow);

        let fresh = ticker(dec!(100), dec!(101), f.now - 1_000);
        assert!(TimeDriftRule.check(&f.ctx(Side::Buy, dec!(1), Some(&fresh))).allow);
    }

    #[test]
    fn position_exactly_at_cap_rejects_further_buys() {
        let f = Fixture::new(&[("RISK_MAX_POSITION_BASE", "0.005")]);
        f.storage
            .apply_fill(&fill(Side::Buy, dec!(0.005), dec!(50000), dec!(0), f.now - 1))
            .unwrap();

        let v = PositionCapRule.check(&f.ctx(Side::Buy, dec!(0.001), None));
        assert!(!v.allow);
        assert_eq!(v.reason, "position_cap");

        // Sells are unaffected.
        assert!(PositionCapRule.check(&f.ctx(Side::Sell, dec!(0), None)).allow);
    }

    #[test]
    fn sell_without_position_is_blocked() {
        let f = Fixture::new(&[]);
        let v = SellWithoutPositionRule.check(&f.ctx(Side::Sell, dec!(0), None));
        assert!(!v.allow);
        assert_eq!(v.reason, "no_position");

        f.storage
            .apply_fill(&fill(Side::Buy, dec!(0.01), dec!(50000), dec!(0), f.now - 1))
            .unwrap();
        assert!(SellWithoutPositionRule.check(&f.ctx(Side::Sell, dec!(0), None)).allow);
    }

    #[test]
    fn cooldown_blocks_fresh_trades_only() {
        let f = Fixture::new(&[("RISK_COOLDOWN_SEC", "60")]);
        assert!(CooldownRule.check(&f.ctx(Side::Buy, dec!(1), None)).allow);

        f.storage
            .apply_fill(&fill(Side::Buy, dec!(0.001), dec!(50000), dec!(0), f.now - 10_000))
            .unwrap();
        assert!(!CooldownRule.check(&f.ctx(Side::Buy, dec!(1), None)).allow);
    }

    #[test]
    fn orders_per_hour_throttles_at_limit() {
        let f = Fixture::new(&[("RISK_MAX_ORDERS_PER_HOUR", "2")]);
        for i in 0..2 {
            f.storage
                .apply_fill(&fill(Side::Buy, dec!(0.001), dec!(50000), dec!(0), f.now - 1_000 - i))
                .unwrap();
        }
        let v = OrdersPerHourRule.check(&f.ctx(Side::Buy, dec!(1), None));
        assert!(!v.allow);
        assert_eq!(v.reason, "orders_per_hour");
    }

    #[test]
    fn turnover_budget_blocks_at_limit() {
        let f = Fixture::new(&[("RISK_MAX_TURNOVER_5M_QUOTE", "100")]);
        f.storage
            .apply_fill(&fill(Side::Buy, dec!(0.002), dec!(50000), dec!(0), f.now - 1_000))
            .unwrap();
        let v = Turnover5mRule.check(&f.ctx(Side::Buy, dec!(1), None));
        assert!(!v.allow);
        assert_eq!(v.reason, "turnover_5m");
    }

    #[test]
    fn loss_streak_blocks_after_consecutive_losses() {
        let f = Fixture::new(&[("RISK_MAX_LOSS_STREAK", "2")]);
        f.storage
            .apply_fill(&fill(Side::Buy, dec!(0.03), dec!(50000), dec!(0), f.now - 5_000))
            .unwrap();
        for i in 0..2 {
            f.storage
                .apply_fill(&fill(Side::Sell, dec!(0.01), dec!(49000), dec!(0), f.now - 3_000 + i))
                .unwrap();
        }
        let v = LossStreakRule.check(&f.ctx(Side::Buy, dec!(1), None));
        assert!(!v.allow);
        assert_eq!(v.reason, "loss_streak");
    }

    #[test]
    fn daily_loss_limit_blocks_when_breached() {
        let f = Fixture::new(&[("RISK_DAILY_LOSS_LIMIT_QUOTE", "50")]);
        f.storage
            .apply_fill(&fill(Side::Buy, dec!(0.1), dec!(50000), dec!(0), f.now - 5_000))
            .unwrap();
        // Sell 0.1 at 49000: realized -100.
        f.storage
            .apply_fill(&fill(Side::Sell, dec!(0.1), dec!(49000), dec!(0), f.now - 2_000))
            .unwrap();

        let v = DailyLossRule.check(&f.ctx(Side::Buy, dec!(1), None));
        assert!(!v.allow);
        assert_eq!(v.reason, "daily_loss");
    }

    #[test]
    fn correlation_group_allows_one_open_position() {
        let f = Fixture::new(&[
            ("SYMBOLS", "BTC/USDT,ETH/USDT"),
            ("RISK_CORRELATION_GROUPS", "BTC/USDT,ETH/USDT"),
        ]);
        // Open a position on the sibling symbol.
        let mut sibling_fill = fill(Side::Buy, dec!(1), dec!(3000), dec!(0), f.now - 1_000);
        sibling_fill.symbol = Symbol::parse("ETH/USDT").unwrap();
        f.storage.apply_fill(&sibling_fill).unwrap();

        let v = AntiCorrelationRule.check(&f.ctx(Side::Buy, dec!(0.001), None));
        assert!(!v.allow);
        assert_eq!(v.reason, "correlation");
    }

    #[test]
    fn disabled_rules_pass_through() {
        let f = Fixture::new(&[]);
        let ctx = f.ctx(Side::Buy, dec!(1), None);
        assert!(PositionCapRule.check(&ctx).allow);
        assert!(OrdersPerHourRule.check(&ctx).allow);
        assert!(Turnover5mRule.check(&ctx).allow);
        assert!(LossStreakRule.check(&ctx).allow);
        assert!(MaxDrawdownRule.check(&ctx).allow);
        assert!(DailyLossRule.check(&ctx).allow);
        assert!(TradingHoursRule.check(&ctx).allow);
    }
}
