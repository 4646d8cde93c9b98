// =============================================================================
// Protective Exits — per-symbol stop-loss / take-profit / trailing machine
// =============================================================================
//
// State per symbol: {entry_price, max_price, armed}. Armed on the 0 -> open
// position transition, disarmed on close. Evaluation order per tick:
//
//   1. ratchet max_price
//   2. hard stop   (mode hard|both):    last <= entry * (1 - stop_pct)
//   3. take profit (mode hard|both):    last >= entry * (1 + take_pct)
//   4. trailing    (mode trailing|both): last <= max * (1 - trailing_pct)
//
// A trigger is a forced sell through the idempotent execute path (strategy is
// bypassed, the broker adapter is not). Positions too small for the market's
// minimum are disarmed with an `exit_below_min` audit entry — the engine
// never emits an order the broker would reject.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::broker::MarketSpec;
use crate::events::{topics, EventBus};
use crate::execution::{ExecuteRequest, ExecutionEngine};
use crate::idempotency::KeySource;
use crate::market_data::MarketData;
use crate::settings::{ExitMode, ExitSettings};
use crate::storage::Storage;
use crate::types::{Position, Side, Symbol};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Why an exit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    HardStop,
    TakeProfit,
    Trailing,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HardStop => write!(f, "hard_stop"),
            Self::TakeProfit => write!(f, "take_profit"),
            Self::Trailing => write!(f, "trailing"),
        }
    }
}

/// In-memory exit state for one symbol.
#[derive(Debug, Clone)]
pub struct ExitState {
    pub entry_price: Decimal,
    pub max_price: Decimal,
    pub armed: bool,
}

/// Result of one evaluation tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitEvaluation {
    /// Nothing to do (not armed, mode off, or no trigger).
    Idle,
    /// A protective sell should fire for the full position.
    Trigger(ExitReason),
}

/// Owns the per-symbol exit states. No I/O: arming, disarming, and
/// evaluation are pure state transitions the workers drive.
pub struct ExitManager {
    cfg: ExitSettings,
    states: Mutex<HashMap<Symbol, ExitState>>,
}

impl ExitManager {
    pub fn new(cfg: ExitSettings) -> Self {
        Self {
            cfg,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Arm on position open. Entry price is the fill price when known.
    pub fn arm(&self, symbol: &Symbol, entry_price: Decimal) {
        if self.cfg.mode == ExitMode::Off || entry_price <= Decimal::ZERO {
            return;
        }
        let mut states = self.states.lock();
        states.insert(
            symbol.clone(),
            ExitState {
                entry_price,
                max_price: entry_price,
                armed: true,
            },
        );
        info!(%symbol, %entry_price, "protective exits armed");
    }

    /// Re-arm from a persisted position (restart recovery). Keeps existing
    /// state when already armed.
    pub fn ensure_armed(&self, position: &Position) {
        if self.cfg.mode == ExitMode::Off || !position.is_open() {
            return;
        }
        let mut states = self.states.lock();
        if states.get(&position.symbol).is_some_and(|s| s.armed) {
            return;
        }
        let entry = position.avg_entry_price;
        if entry <= Decimal::ZERO {
            return;
        }
        states.insert(
            position.symbol.clone(),
            ExitState {
                entry_price: entry,
                max_price: position.max_price_since_entry.max(entry),
                armed: true,
            },
        );
        info!(symbol = %position.symbol, %entry, "protective exits re-armed from position");
    }

    /// Disarm and clear state (position closed).
    pub fn disarm(&self, symbol: &Symbol) {
        if self.states.lock().remove(symbol).is_some() {
            info!(%symbol, "protective exits disarmed");
        }
    }

    pub fn is_armed(&self, symbol: &Symbol) -> bool {
        self.states.lock().get(symbol).is_some_and(|s| s.armed)
    }

    pub fn state_of(&self, symbol: &Symbol) -> Option<ExitState> {
        self.states.lock().get(symbol).cloned()
    }

    /// One evaluation tick at price `last`. Ratchets the trailing anchor and
    /// reports whether a protective sell should fire.
    pub fn evaluate(&self, symbol: &Symbol, last: Decimal) -> ExitEvaluation {
        if self.cfg.mode == ExitMode::Off {
            return ExitEvaluation::Idle;
        }
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(symbol) else {
            return ExitEvaluation::Idle;
        };
        if !state.armed || last <= Decimal::ZERO {
            return ExitEvaluation::Idle;
        }

        if last > state.max_price {
            state.max_price = last;
        }

        let hard_modes = matches!(self.cfg.mode, ExitMode::Hard | ExitMode::Both);
        let trailing_modes = matches!(self.cfg.mode, ExitMode::Trailing | ExitMode::Both);

        if hard_modes && last <= state.entry_price * (Decimal::ONE - self.cfg.stop_pct) {
            return ExitEvaluation::Trigger(ExitReason::HardStop);
        }
        if hard_modes
            && self.cfg.take_pct > Decimal::ZERO
            && last >= state.entry_price * (Decimal::ONE + self.cfg.take_pct)
        {
            return ExitEvaluation::Trigger(ExitReason::TakeProfit);
        }
        if trailing_modes && last <= state.max_price * (Decimal::ONE - self.cfg.trailing_pct) {
            return ExitEvaluation::Trigger(ExitReason::Trailing);
        }

        debug!(%symbol, %last, max = %state.max_price, "exit evaluation: no trigger");
        ExitEvaluation::Idle
    }
}

impl std::fmt::Debug for ExitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitManager")
            .field("armed_symbols", &self.states.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Exits loop worker
// ---------------------------------------------------------------------------

/// The work function the orchestrator's exits loop runs each tick.
pub struct ExitsWorker {
    pub exits: Arc<ExitManager>,
    pub execution: Arc<ExecutionEngine>,
    pub market_data: Arc<MarketData>,
    pub storage: Storage,
    pub bus: EventBus,
    pub market_spec: MarketSpec,
    pub min_base_to_exit: Decimal,
}

impl ExitsWorker {
    /// One exits tick for `symbol`. Errors never propagate out of the loop;
    /// they are logged and the next tick retries.
    pub async fn tick(&self, symbol: &Symbol) -> anyhow::Result<()> {
        let position = self.storage.positions().get(symbol)?;

        // Position closed externally: disarm without issuing anything.
        if !position.is_open() {
            if self.exits.is_armed(symbol) {
                self.exits.disarm(symbol);
            }
            return Ok(());
        }

        self.exits.ensure_armed(&position);

        // Never emit an order the broker would reject.
        if position.base_qty < self.market_spec.min_amount {
            if self.exits.is_armed(symbol) {
                self.exits.disarm(symbol);
                self.storage.audit().append(
                    "exit_below_min",
                    &json!({
                        "symbol": symbol.to_string(),
                        "base_qty": position.base_qty.to_string(),
                        "min_amount": self.market_spec.min_amount.to_string(),
                    }),
                )?;
                warn!(%symbol, base_qty = %position.base_qty, "position below market minimum — exits disarmed");
            }
            return Ok(());
        }
        if position.base_qty < self.min_base_to_exit {
            return Ok(());
        }

        let ticker = match self.market_data.ticker(symbol).await {
            Ok(t) => t,
            Err(e) => {
                debug!(%symbol, error = %e, "exits tick skipped: no market data");
                return Ok(());
            }
        };

        let ExitEvaluation::Trigger(reason) = self.exits.evaluate(symbol, ticker.last) else {
            // Persist the ratcheted anchor so a restart keeps the trail.
            self.storage.positions().raise_max_price(symbol, ticker.last)?;
            return Ok(());
        };

        info!(
            %symbol,
            %reason,
            last = %ticker.last,
            base_qty = %position.base_qty,
            "protective exit triggered — selling position"
        );

        let outcome = self
            .execution
            .execute(ExecuteRequest {
                symbol: symbol.clone(),
                side: Side::Sell,
                amount: position.base_qty,
                source: KeySource::Exit,
            })
            .await?;

        if outcome.executed {
            let key_hint = symbol.to_string();
            self.bus
                .publish(
                    topics::PROTECTIVE_EXIT_TRIGGERED,
                    json!({
                        "symbol": key_hint,
                        "reason": reason.to_string(),
                        "exit_price": ticker.last.to_string(),
                        "base_qty": position.base_qty.to_string(),
                    }),
                    Some(&key_hint),
                )
                .await;
            self.storage.audit().append(
                "protective_exit",
                &json!({
                    "symbol": key_hint,
                    "reason": reason.to_string(),
                    "exit_price": ticker.last.to_string(),
                }),
            )?;
        }
        Ok(())
    }
}
