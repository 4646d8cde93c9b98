// =============================================================================
// Risk Pipeline — ordered, short-circuit rule chain guarding every order
// =============================================================================
//
// The first rule answering `allow = false` wins; nothing after it runs. The
// caller (execute-trade) publishes `risk.blocked` / `budget.exceeded` from
// the returned decision, so rules themselves stay free of side effects.
// =============================================================================

pub mod pnl;
pub mod rules;

use serde_json::json;
use tracing::{debug, warn};

pub use rules::{RiskRule, RuleContext, Verdict};

use rules::{
    AntiCorrelationRule, CooldownRule, DailyLossRule, LossStreakRule, MaxDrawdownRule,
    OrdersPerHourRule, PositionCapRule, SellWithoutPositionRule, SpreadCapRule, TimeDriftRule,
    TradingHoursRule, Turnover5mRule,
};

/// Final pipeline decision.
#[derive(Debug, Clone)]
pub struct RiskDecision {
    pub allowed: bool,
    /// Name of the rule that blocked (empty when allowed).
    pub rule: String,
    pub reason: String,
    pub details: serde_json::Value,
}

impl RiskDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            rule: String::new(),
            reason: "ok".to_string(),
            details: json!({}),
        }
    }

    /// True when the block came from one of the budget rules (these also
    /// publish `budget.exceeded`).
    pub fn is_budget_block(&self) -> bool {
        matches!(self.reason.as_str(), "orders_per_hour" | "turnover_5m")
    }
}

/// The ordered rule chain.
pub struct RiskManager {
    chain: Vec<Box<dyn RiskRule>>,
}

impl RiskManager {
    /// The standard twelve-rule chain, in the order that matters: cheap
    /// market sanity first, storage-derived statistics later.
    pub fn standard() -> Self {
        Self {
            chain: vec![
                Box::new(TimeDriftRule),
                Box::new(TradingHoursRule),
                Box::new(CooldownRule),
                Box::new(SpreadCapRule),
                Box::new(PositionCapRule),
                Box::new(SellWithoutPositionRule),
                Box::new(OrdersPerHourRule),
                Box::new(Turnover5mRule),
                Box::new(LossStreakRule),
                Box::new(MaxDrawdownRule),
                Box::new(DailyLossRule),
                Box::new(AntiCorrelationRule),
            ],
        }
    }

    /// A custom chain (tests, reduced pipelines).
    pub fn with_rules(chain: Vec<Box<dyn RiskRule>>) -> Self {
        Self { chain }
    }

    /// Evaluate the chain; the first block short-circuits.
    pub fn check(&self, ctx: &RuleContext<'_>) -> RiskDecision {
        for rule in &self.chain {
            let verdict = rule.check(ctx);
            if !verdict.allow {
                warn!(
                    symbol = %ctx.symbol,
                    side = %ctx.side,
                    rule = rule.name(),
                    reason = %verdict.reason,
                    "risk pipeline blocked order"
                );
                return RiskDecision {
                    allowed: false,
                    rule: rule.name().to_string(),
                    reason: verdict.reason,
                    details: verdict.details,
                };
            }
            debug!(
                symbol = %ctx.symbol,
                rule = rule.name(),
                reason = %verdict.reason,
                "risk rule passed"
            );
        }
        RiskDecision::allowed()
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("rules", &self.chain.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::storage::Storage;
    use crate::types::{now_ms, Side, Symbol, Ticker};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_map(&env).unwrap()
    }

    #[test]
    fn first_blocking_rule_wins() {
        let storage = Storage::open_in_memory().unwrap();
        let settings = settings(&[("RISK_MAX_SPREAD_PCT", "0.005")]);
        let symbol = Symbol::parse("BTC/USDT").unwrap();
        let wide = Ticker {
            symbol: symbol.clone(),
            last: dec!(50000),
            bid: dec!(49000),
            ask: dec!(51000),
            ts_ms: now_ms(),
        };

        let decision = RiskManager::standard().check(&RuleContext {
            symbol: &symbol,
            side: Side::Buy,
            projected_base: dec!(0.001),
            ticker: Some(&wide),
            storage: &storage,
            settings: &settings,
            now_ms: now_ms(),
        });

        assert!(!decision.allowed);
        assert_eq!(decision.reason, "spread_cap");
        assert_eq!(decision.rule, "spread_cap");
        assert!(!decision.is_budget_block());
    }

    #[test]
    fn clean_context_passes_all_rules() {
        let storage = Storage::open_in_memory().unwrap();
        let settings = settings(&[]);
        let symbol = Symbol::parse("BTC/USDT").unwrap();
        let tight = Ticker {
            symbol: symbol.clone(),
            last: dec!(50000),
            bid: dec!(49999),
            ask: dec!(50001),
            ts_ms: now_ms(),
        };

        let decision = RiskManager::standard().check(&RuleContext {
            symbol: &symbol,
            side: Side::Buy,
            projected_base: Decimal::new(1, 3),
            ticker: Some(&tight),
            storage: &storage,
            settings: &settings,
            now_ms: now_ms(),
        });

        assert!(decision.allowed);
        assert_eq!(decision.reason, "ok");
    }

    #[test]
    fn budget_blocks_are_flagged() {
        let d = RiskDecision {
            allowed: false,
            rule: "orders_per_hour".to_string(),
            reason: "orders_per_hour".to_string(),
            details: serde_json::json!({}),
        };
        assert!(d.is_budget_block());
    }
}
