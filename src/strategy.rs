// =============================================================================
// Strategy — pure decision functions over a market snapshot
// =============================================================================
//
// A strategy is a pure function of (settings, context): no rolling state, no
// I/O, no clocks. Anything that needs history receives it through the
// context. The manager composes several strategies and returns the first
// non-hold decision, which keeps composition deterministic for a given input.
//
// The optional `context` value carries externally-supplied macro features
// (fear/greed, dominance indexes). The engine core never populates it.
// =============================================================================

use rust_decimal::{Decimal, MathematicalOps};
use serde_json::json;
use tracing::debug;

use crate::settings::Settings;
use crate::types::{Action, Candle, Decision, Symbol, Ticker};

/// Everything a strategy may look at for one evaluation.
#[derive(Debug, Clone)]
pub struct StrategyCtx {
    pub symbol: Symbol,
    pub ticker: Ticker,
    /// OHLCV history, oldest first.
    pub candles: Vec<Candle>,
    /// Optional macro/context features supplied by external adapters.
    pub context: serde_json::Value,
}

/// A pure decision function.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn generate(&self, settings: &Settings, ctx: &StrategyCtx) -> Decision;
}

// ---------------------------------------------------------------------------
// Indicator helpers (inline, close-price based)
// ---------------------------------------------------------------------------

/// Exponential moving average over the full slice; None if `values` is
/// shorter than `period`.
fn ema(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let seed: Decimal = values[..period].iter().sum::<Decimal>() / Decimal::from(period as u64);
    let k = Decimal::TWO / Decimal::from((period + 1) as u64);
    let mut current = seed;
    for v in &values[period..] {
        current = (*v - current) * k + current;
    }
    Some(current)
}

fn closes(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.close).collect()
}

// ---------------------------------------------------------------------------
// EMA cross
// ---------------------------------------------------------------------------

/// Buy when the fast EMA crosses above the slow EMA, sell on the cross down.
pub struct EmaCrossStrategy {
    pub fast: usize,
    pub slow: usize,
}

impl Default for EmaCrossStrategy {
    fn default() -> Self {
        Self { fast: 12, slow: 26 }
    }
}

impl Strategy for EmaCrossStrategy {
    fn name(&self) -> &'static str {
        "ema_cross"
    }

    fn generate(&self, _settings: &Settings, ctx: &StrategyCtx) -> Decision {
        let closes = closes(&ctx.candles);
        // One extra point so the previous-tick EMAs exist.
        if closes.len() <= self.slow {
            return Decision::hold("no_data");
        }

        let prev = &closes[..closes.len() - 1];
        let (Some(fast_now), Some(slow_now), Some(fast_prev), Some(slow_prev)) = (
            ema(&closes, self.fast),
            ema(&closes, self.slow),
            ema(prev, self.fast),
            ema(prev, self.slow),
        ) else {
            return Decision::hold("no_data");
        };

        let action = if fast_prev <= slow_prev && fast_now > slow_now {
            Action::Buy
        } else if fast_prev >= slow_prev && fast_now < slow_now {
            Action::Sell
        } else {
            return Decision::hold("no_cross");
        };

        let score = if slow_now > Decimal::ZERO {
            ((fast_now - slow_now) / slow_now).abs()
        } else {
            Decimal::ZERO
        };

        debug!(
            symbol = %ctx.symbol,
            %action,
            fast = %fast_now,
            slow = %slow_now,
            "ema cross signal"
        );

        Decision {
            action,
            score,
            meta: json!({
                "strategy": self.name(),
                "fast": fast_now.to_string(),
                "slow": slow_now.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Bollinger reversion
// ---------------------------------------------------------------------------

/// Mean-reversion on band breaches: buy below the lower band, sell above the
/// upper band.
pub struct BollingerReversionStrategy {
    pub period: usize,
    /// Band width in standard deviations.
    pub width: Decimal,
}

impl Default for BollingerReversionStrategy {
    fn default() -> Self {
        Self {
            period: 20,
            width: Decimal::TWO,
        }
    }
}

impl Strategy for BollingerReversionStrategy {
    fn name(&self) -> &'static str {
        "bollinger_reversion"
    }

    fn generate(&self, _settings: &Settings, ctx: &StrategyCtx) -> Decision {
        let closes = closes(&ctx.candles);
        if self.period == 0 || closes.len() < self.period {
            return Decision::hold("no_data");
        }

        let window = &closes[closes.len() - self.period..];
        let n = Decimal::from(self.period as u64);
        let mean: Decimal = window.iter().sum::<Decimal>() / n;
        let variance: Decimal = window
            .iter()
            .map(|v| (*v - mean) * (*v - mean))
            .sum::<Decimal>()
            / n;
        let Some(sd) = variance.sqrt() else {
            return Decision::hold("no_data");
        };

        let upper = mean + self.width * sd;
        let lower = mean - self.width * sd;
        let last = ctx.ticker.last;

        let action = if last < lower {
            Action::Buy
        } else if last > upper {
            Action::Sell
        } else {
            return Decision::hold("inside_bands");
        };

        let score = if sd > Decimal::ZERO {
            ((last - mean) / sd).abs()
        } else {
            Decimal::ZERO
        };

        Decision {
            action,
            score,
            meta: json!({
                "strategy": self.name(),
                "mean": mean.to_string(),
                "upper": upper.to_string(),
                "lower": lower.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// First-non-hold composition of strategies, in configuration order.
pub struct StrategyManager {
    strategies: Vec<Box<dyn Strategy>>,
}

impl StrategyManager {
    pub fn new(strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self { strategies }
    }

    /// The default pairing: trend entry via EMA cross, band-reversion backup.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(EmaCrossStrategy::default()),
            Box::new(BollingerReversionStrategy::default()),
        ])
    }

    /// Evaluate strategies in order; the first non-hold decision wins.
    pub fn generate(&self, settings: &Settings, ctx: &StrategyCtx) -> Decision {
        for strategy in &self.strategies {
            let decision = strategy.generate(settings, ctx);
            if decision.action != Action::Hold {
                return decision;
            }
        }
        Decision::hold("all_strategies_hold")
    }
}

impl std::fmt::Debug for StrategyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyManager")
            .field("strategies", &self.strategies.len())
            .finish()
    }
}
