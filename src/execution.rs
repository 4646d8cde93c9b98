// =============================================================================
// Execution Engine — decision -> risk -> idempotency -> broker -> storage -> bus
// =============================================================================
//
// The one place orders are born. Sequence per request:
//
//   1. per-symbol single-flight lock (concurrent callers await, never overlap)
//   2. idempotency claim; losers return the committed original
//   3. risk pipeline (skipped for forced exit/DMS sells, which only keep the
//      long-only guard)
//   4. broker call, transient errors retried with jittered backoff
//   5. atomic persistence (trade + position + audit), idempotency commit,
//      then best-effort events
//
// The client_order_id is derived from the idempotency key, so even a
// crash-restarted process re-sends the same id and the broker resolves the
// duplicate instead of double-filling.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::errors::{BrokerError, EngineError};
use crate::events::{topics, EventBus};
use crate::exits::ExitManager;
use crate::idempotency::{build_key, KeySource};
use crate::market_data::MarketData;
use crate::metrics::Metrics;
use crate::risk::{RiskManager, RiskRule, RuleContext};
use crate::settings::Settings;
use crate::storage::Storage;
use crate::types::{now_ms, Order, Side, Symbol, Ticker};

/// Broker retry policy for transient failures.
const MAX_BROKER_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 300;
const RETRY_CAP_MS: u64 = 3_000;

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// One order request entering the execution path.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub symbol: Symbol,
    pub side: Side,
    /// Quote amount for buys, base amount for sells.
    pub amount: Decimal,
    pub source: KeySource,
}

impl ExecuteRequest {
    /// Forced sells (protective exit, DMS) bypass the strategy-facing risk
    /// rules and keep only the long-only guard.
    fn is_forced(&self) -> bool {
        matches!(self.source, KeySource::Exit | KeySource::Dms)
    }
}

/// What the caller observes. A duplicate is indistinguishable from the
/// original apart from the flag.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub executed: bool,
    pub reason: String,
    pub order: Option<Order>,
    pub trade_id: Option<i64>,
    pub duplicate: bool,
}

impl ExecutionOutcome {
    fn blocked(reason: String) -> Self {
        Self {
            executed: false,
            reason,
            order: None,
            trade_id: None,
            duplicate: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-symbol single-flight locks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SymbolLocks {
    map: Mutex<HashMap<Symbol, Arc<tokio::sync::Mutex<()>>>>,
}

impl SymbolLocks {
    fn get(&self, symbol: &Symbol) -> Arc<tokio::sync::Mutex<()>> {
        self.map
            .lock()
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    settings: Arc<Settings>,
    storage: Storage,
    broker: Arc<dyn Broker>,
    market_data: Arc<MarketData>,
    bus: EventBus,
    risk: Arc<RiskManager>,
    exits: Arc<ExitManager>,
    metrics: Arc<Metrics>,
    locks: SymbolLocks,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        storage: Storage,
        broker: Arc<dyn Broker>,
        market_data: Arc<MarketData>,
        bus: EventBus,
        risk: Arc<RiskManager>,
        exits: Arc<ExitManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            storage,
            broker,
            market_data,
            bus,
            risk,
            exits,
            metrics,
            locks: SymbolLocks::default(),
        }
    }

    /// Execute one trade request end to end.
    pub async fn execute(&self, req: ExecuteRequest) -> Result<ExecutionOutcome, EngineError> {
        let lock = self.locks.get(&req.symbol);
        let _flight = lock.lock().await;

        let now = now_ms();
        let key = build_key(
            req.source,
            &req.symbol,
            req.side,
            self.settings.idempotency_bucket_ms,
            now,
        );

        // ------------------------------------------------------------------
        // 1. Idempotency claim
        // ------------------------------------------------------------------
        let claimed = self
            .storage
            .idempotency()
            .claim(&key, self.settings.idempotency_ttl_ms)
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        if !claimed {
            return self.resolve_duplicate(&key).await;
        }

        // ------------------------------------------------------------------
        // 2. Risk pipeline
        // ------------------------------------------------------------------
        let ticker = self.market_data.ticker(&req.symbol).await.ok();
        let decision = self.run_risk(&req, ticker.as_ref(), now);

        if !decision.allowed {
            self.publish_block(&req, &decision.reason, &decision.details).await;
            self.storage
                .idempotency()
                .release(&key)
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            self.metrics.inc_labeled("orders_blocked_total", "reason", &decision.reason);
            return Ok(ExecutionOutcome::blocked(decision.reason));
        }

        // ------------------------------------------------------------------
        // 3. Broker call with bounded retry
        // ------------------------------------------------------------------
        let client_order_id = client_order_id_for(&key);
        let started = std::time::Instant::now();
        let order = match self.place_with_retry(&req, &client_order_id).await {
            Ok(order) => {
                self.metrics
                    .observe_call(true, started.elapsed().as_millis() as f64);
                order
            }
            Err(e) => {
                self.metrics
                    .observe_call(false, started.elapsed().as_millis() as f64);
                self.storage
                    .idempotency()
                    .release(&key)
                    .map_err(|se| EngineError::Storage(se.to_string()))?;
                self.bus
                    .publish(
                        topics::ORDER_FAILED,
                        json!({
                            "symbol": req.symbol.to_string(),
                            "side": req.side.to_string(),
                            "source": req.source.to_string(),
                            "error": e.to_string(),
                        }),
                        Some(&req.symbol.to_string()),
                    )
                    .await;
                self.metrics.inc("orders_failed_total");
                return Err(EngineError::Broker(e));
            }
        };

        // ------------------------------------------------------------------
        // 4. Atomic persistence + idempotency commit
        // ------------------------------------------------------------------
        // If persistence fails the key stays claimed: no duplicate order can
        // be sent within the TTL, and reconciliation ingests the fill later.
        let applied = self
            .storage
            .apply_fill(&order)
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        let payload = json!({ "order": &order, "trade_id": applied.trade_id });
        self.storage
            .idempotency()
            .commit(&key, &payload)
            .map_err(|e| EngineError::Storage(e.to_string()))?;

        // ------------------------------------------------------------------
        // 5. Exit arming + events (best effort, outside the transaction)
        // ------------------------------------------------------------------
        if applied.opened {
            let entry = if order.price > Decimal::ZERO {
                order.price
            } else {
                applied.position.avg_entry_price
            };
            self.exits.arm(&req.symbol, entry);
        } else if applied.closed {
            self.exits.disarm(&req.symbol);
        }
        self.market_data.invalidate(&req.symbol);

        let key_hint = req.symbol.to_string();
        self.bus
            .publish(
                topics::ORDER_EXECUTED,
                json!({
                    "symbol": key_hint,
                    "side": req.side.to_string(),
                    "source": req.source.to_string(),
                    "order": &order,
                }),
                Some(&key_hint),
            )
            .await;
        self.bus
            .publish(
                topics::TRADE_COMPLETED,
                json!({
                    "symbol": key_hint,
                    "trade_id": applied.trade_id,
                    "client_order_id": order.client_order_id,
                }),
                Some(&key_hint),
            )
            .await;
        self.metrics.inc("orders_executed_total");

        info!(
            symbol = %req.symbol,
            side = %req.side,
            source = %req.source,
            order_id = %order.id,
            trade_id = applied.trade_id,
            "trade executed"
        );

        Ok(ExecutionOutcome {
            executed: true,
            reason: "executed".to_string(),
            order: Some(order),
            trade_id: Some(applied.trade_id),
            duplicate: false,
        })
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// The claim was lost: someone else owns this bucket. Serve their
    /// committed result so the caller cannot tell it was a duplicate.
    async fn resolve_duplicate(&self, key: &str) -> Result<ExecutionOutcome, EngineError> {
        // The winner may still be in flight in another process; give the
        // committed payload a few chances to appear.
        for _ in 0..3 {
            let original = self
                .storage
                .idempotency()
                .get_original(key)
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            if let Some(payload) = original {
                let order: Option<Order> =
                    serde_json::from_value(payload["order"].clone()).ok();
                let trade_id = payload["trade_id"].as_i64();
                debug!(key, "duplicate request served from committed payload");
                self.metrics.inc("orders_duplicate_total");
                return Ok(ExecutionOutcome {
                    executed: true,
                    reason: "duplicate".to_string(),
                    order,
                    trade_id,
                    duplicate: true,
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        warn!(key, "idempotency slot busy with no committed payload yet");
        Ok(ExecutionOutcome::blocked("in_flight_elsewhere".to_string()))
    }

    fn run_risk(
        &self,
        req: &ExecuteRequest,
        ticker: Option<&Ticker>,
        now: i64,
    ) -> crate::risk::RiskDecision {
        let projected_base = match (req.side, ticker) {
            (Side::Buy, Some(t)) if t.ask > Decimal::ZERO => req.amount / t.ask,
            _ => Decimal::ZERO,
        };
        let ctx = RuleContext {
            symbol: &req.symbol,
            side: req.side,
            projected_base,
            ticker,
            storage: &self.storage,
            settings: &self.settings,
            now_ms: now,
        };

        if req.is_forced() {
            // Forced sells keep only the long-only guard.
            let verdict = crate::risk::rules::SellWithoutPositionRule.check(&ctx);
            return crate::risk::RiskDecision {
                allowed: verdict.allow,
                rule: if verdict.allow { String::new() } else { "no_position".to_string() },
                reason: if verdict.allow { "ok".to_string() } else { verdict.reason },
                details: verdict.details,
            };
        }
        self.risk.check(&ctx)
    }

    async fn publish_block(&self, req: &ExecuteRequest, reason: &str, details: &serde_json::Value) {
        let key_hint = req.symbol.to_string();
        let payload = json!({
            "symbol": key_hint,
            "side": req.side.to_string(),
            "source": req.source.to_string(),
            "reason": reason,
            "details": details,
        });
        self.bus
            .publish(topics::RISK_BLOCKED, payload.clone(), Some(&key_hint))
            .await;
        self.bus
            .publish(topics::TRADE_BLOCKED, payload.clone(), Some(&key_hint))
            .await;
        if matches!(reason, "orders_per_hour" | "turnover_5m") {
            self.bus
                .publish(topics::BUDGET_EXCEEDED, payload, Some(&key_hint))
                .await;
        }
    }

    async fn place_with_retry(
        &self,
        req: &ExecuteRequest,
        client_order_id: &str,
    ) -> Result<Order, BrokerError> {
        let mut last_err: Option<BrokerError> = None;

        for attempt in 1..=MAX_BROKER_ATTEMPTS {
            let result = match req.side {
                Side::Buy => {
                    self.broker
                        .create_market_buy_quote(&req.symbol, req.amount, client_order_id)
                        .await
                }
                Side::Sell => {
                    self.broker
                        .create_market_sell_base(&req.symbol, req.amount, client_order_id)
                        .await
                }
            };

            match result {
                Ok(order) => return Ok(order),
                Err(e) if e.is_retryable() && attempt < MAX_BROKER_ATTEMPTS => {
                    let backoff = RETRY_BASE_MS
                        .saturating_mul(1 << (attempt - 1))
                        .min(RETRY_CAP_MS);
                    // Jitter in [0.5, 1.5) spreads concurrent retries apart.
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    let delay = Duration::from_millis((backoff as f64 * jitter) as u64);
                    warn!(
                        symbol = %req.symbol,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient broker error — retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(symbol = %req.symbol, attempt, error = %e, "broker order failed");
                    return Err(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| BrokerError::Transient("retries exhausted".to_string())))
    }
}

/// Deterministic client order id derived from the idempotency key, e.g.
/// `order:BTC-USDT:buy:1723987200000` -> `orBTCUSDTbu1723987200000`.
fn client_order_id_for(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for part in key.split(':') {
        if part.chars().all(|c| c.is_ascii_digit()) {
            out.push_str(part);
        } else if part.chars().any(|c| c.is_ascii_uppercase()) {
            // Symbol part: strip the dash.
            out.extend(part.chars().filter(|c| c.is_ascii_alphanumeric()));
        } else {
            // Source and side: a two-letter prefix keeps them distinct.
            out.push_str(&part[..part.len().min(2)]);
        }
    }
    out
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("broker", &"<dyn Broker>")
            .field("risk", &self.risk)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MarketSpec, PaperBroker};
    use crate::errors::RejectReason;
    use crate::events::Event;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn sym() -> Symbol {
        Symbol::parse("BTC/USDT").unwrap()
    }

    struct Rig {
        engine: Arc<ExecutionEngine>,
        paper: Arc<PaperBroker>,
        storage: Storage,
        bus: EventBus,
        exits: Arc<ExitManager>,
    }

    fn rig(extra_env: &[(&str, &str)]) -> Rig {
        let env: HashMap<String, String> = extra_env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let settings = Arc::new(Settings::from_map(&env).unwrap());

        let metrics = Arc::new(Metrics::new());
        let bus = EventBus::new(256, metrics.clone());
        bus.start();

        let paper = Arc::new(PaperBroker::new(MarketSpec::default()));
        paper.deposit("USDT", dec!(1000));

        let storage = Storage::open_in_memory().unwrap();
        let market_data = Arc::new(MarketData::new(paper.clone(), 0));
        let exits = Arc::new(ExitManager::new(settings.exits.clone()));

        let engine = Arc::new(ExecutionEngine::new(
            settings,
            storage.clone(),
            paper.clone(),
            market_data,
            bus.clone(),
            Arc::new(RiskManager::standard()),
            exits.clone(),
            metrics,
        ));
        Rig {
            engine,
            paper,
            storage,
            bus,
            exits,
        }
    }

    fn collect(bus: &EventBus, pattern: &str) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(pattern, "test-collector", move |ev: Event| {
            let sink = sink.clone();
            async move {
                sink.lock().push(ev);
                Ok(())
            }
        });
        seen
    }

    #[tokio::test]
    async fn happy_buy_sell_cycle_against_paper_broker() {
        let r = rig(&[("RISK_COOLDOWN_SEC", "0")]);
        r.paper.set_book(&sym(), dec!(50000), dec!(50000));
        let completed = collect(&r.bus, topics::TRADE_COMPLETED);

        let buy = r
            .engine
            .execute(ExecuteRequest {
                symbol: sym(),
                side: Side::Buy,
                amount: dec!(100),
                source: KeySource::Order,
            })
            .await
            .unwrap();
        assert!(buy.executed);
        assert!(!buy.duplicate);

        let pos = r.storage.positions().get(&sym()).unwrap();
        assert_eq!(pos.base_qty, dec!(0.002));
        assert_eq!(r.paper.balance_of("USDT"), dec!(899.9));
        assert!(r.exits.is_armed(&sym()));

        let sell = r
            .engine
            .execute(ExecuteRequest {
                symbol: sym(),
                side: Side::Sell,
                amount: pos.base_qty,
                source: KeySource::Order,
            })
            .await
            .unwrap();
        assert!(sell.executed);

        let pos = r.storage.positions().get(&sym()).unwrap();
        assert_eq!(pos.base_qty, Decimal::ZERO);
        assert_eq!(pos.avg_entry_price, Decimal::ZERO);
        // 1000 minus two 0.1 fees.
        assert_eq!(r.paper.balance_of("USDT"), dec!(999.8));
        assert!(!r.exits.is_armed(&sym()));

        // Every trade.completed has a matching trade row.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = completed.lock().clone();
        assert_eq!(events.len(), 2);
        for ev in events {
            let coid = ev.payload["client_order_id"].as_str().unwrap();
            assert!(r.storage.trades().get_by_client_order_id(coid).unwrap().is_some());
        }
        r.bus.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn concurrent_same_bucket_requests_collapse_to_one_order() {
        // A huge bucket keeps both requests in the same equivalence class no
        // matter where in the wall-clock window the test lands.
        let r = rig(&[("IDEMPOTENCY_BUCKET_MS", "3600000")]);
        r.paper.set_book(&sym(), dec!(50000), dec!(50000));

        let req = ExecuteRequest {
            symbol: sym(),
            side: Side::Buy,
            amount: dec!(100),
            source: KeySource::Order,
        };
        let (a, b) = tokio::join!(
            r.engine.execute(req.clone()),
            r.engine.execute(req.clone())
        );
        let a = a.unwrap();
        let b = b.unwrap();

        assert!(a.executed && b.executed);
        assert_eq!(r.paper.order_count(), 1);

        let id_a = a.order.as_ref().unwrap().id.clone();
        let id_b = b.order.as_ref().unwrap().id.clone();
        assert_eq!(id_a, id_b);
        assert!(a.duplicate != b.duplicate);

        // Exactly one trade row.
        let trades = r.storage.trades().list_symbol_asc(&sym()).unwrap();
        assert_eq!(trades.len(), 1);
        r.bus.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn wide_spread_blocks_before_any_broker_call() {
        let r = rig(&[("RISK_MAX_SPREAD_PCT", "0.005")]);
        r.paper.set_book(&sym(), dec!(49000), dec!(51000));
        let blocked = collect(&r.bus, topics::RISK_BLOCKED);

        let out = r
            .engine
            .execute(ExecuteRequest {
                symbol: sym(),
                side: Side::Buy,
                amount: dec!(100),
                source: KeySource::Order,
            })
            .await
            .unwrap();

        assert!(!out.executed);
        assert_eq!(out.reason, "spread_cap");
        assert_eq!(r.paper.order_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = blocked.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["reason"], "spread_cap");
        assert!(!events[0].payload["reason"].as_str().unwrap().is_empty());
        r.bus.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn risk_block_releases_key_for_next_bucket_attempt() {
        let r = rig(&[("RISK_MAX_SPREAD_PCT", "0.005")]);
        r.paper.set_book(&sym(), dec!(49000), dec!(51000));

        let req = ExecuteRequest {
            symbol: sym(),
            side: Side::Buy,
            amount: dec!(100),
            source: KeySource::Order,
        };
        assert!(!r.engine.execute(req.clone()).await.unwrap().executed);

        // Spread normalizes; the same bucket is claimable again.
        r.paper.set_book(&sym(), dec!(50000), dec!(50001));
        let out = r.engine.execute(req).await.unwrap();
        assert!(out.executed);
        r.bus.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn rejection_is_not_retried_and_publishes_order_failed() {
        let r = rig(&[]);
        r.paper.set_book(&sym(), dec!(50000), dec!(50000));
        let failed = collect(&r.bus, topics::ORDER_FAILED);

        let err = r
            .engine
            .execute(ExecuteRequest {
                symbol: sym(),
                side: Side::Buy,
                amount: dec!(5000), // exceeds the 1000 USDT ledger
                source: KeySource::Order,
            })
            .await
            .unwrap_err();

        match err {
            EngineError::Broker(BrokerError::Rejected { reason, .. }) => {
                assert_eq!(reason, RejectReason::InsufficientFunds)
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(r.paper.order_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(failed.lock().len(), 1);
        r.bus.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn forced_sell_bypasses_risk_except_long_only_guard() {
        // Cooldown would normally block back-to-back orders.
        let r = rig(&[("RISK_COOLDOWN_SEC", "3600")]);
        r.paper.set_book(&sym(), dec!(50000), dec!(50000));

        let buy = r
            .engine
            .execute(ExecuteRequest {
                symbol: sym(),
                side: Side::Buy,
                amount: dec!(100),
                source: KeySource::Order,
            })
            .await
            .unwrap();
        assert!(buy.executed);

        // A strategy sell would hit the cooldown...
        let strategy_sell = r
            .engine
            .execute(ExecuteRequest {
                symbol: sym(),
                side: Side::Sell,
                amount: dec!(0.002),
                source: KeySource::Order,
            })
            .await
            .unwrap();
        assert!(!strategy_sell.executed);
        assert_eq!(strategy_sell.reason, "cooldown");

        // ...but a protective exit goes through.
        let forced = r
            .engine
            .execute(ExecuteRequest {
                symbol: sym(),
                side: Side::Sell,
                amount: dec!(0.002),
                source: KeySource::Exit,
            })
            .await
            .unwrap();
        assert!(forced.executed);

        // Forced sells still respect long-only: with a flat position the
        // guard blocks (fresh bucket via Dms source).
        let no_pos = r
            .engine
            .execute(ExecuteRequest {
                symbol: sym(),
                side: Side::Sell,
                amount: dec!(0.002),
                source: KeySource::Dms,
            })
            .await
            .unwrap();
        assert!(!no_pos.executed);
        assert_eq!(no_pos.reason, "no_position");
        r.bus.stop(Duration::from_secs(1)).await;
    }

    #[test]
    fn client_order_ids_are_deterministic_and_compact() {
        let a = client_order_id_for("order:BTC-USDT:buy:1723987200000");
        let b = client_order_id_for("order:BTC-USDT:buy:1723987200000");
        let c = client_order_id_for("exit:BTC-USDT:sell:1723987200000");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.len() <= 36);
        assert!(a.chars().all(|ch| ch.is_ascii_alphanumeric()));
    }
}
