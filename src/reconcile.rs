// =============================================================================
// Reconciliation — re-assert local state against the broker's authoritative view
// =============================================================================
//
// Three idempotent tasks per cycle:
//   - orders:    mirror broker-open orders into storage, and ingest fills for
//                locally-open orders that closed at the broker
//   - positions: re-price the open position and flag base-balance divergence
//                (operator signal only — never auto-repaired)
//   - balances:  fetch and publish, no mutation
//
// The cycle also prunes expired idempotency records: the TTL outlives the
// reconciliation interval, so duplicates arriving post-crash still find the
// committed payload before pruning touches it.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::events::{topics, EventBus};
use crate::market_data::MarketData;
use crate::metrics::Metrics;
use crate::settings::Settings;
use crate::storage::Storage;
use crate::types::{OrderStatus, Symbol};

/// Summary of one reconciliation cycle for a symbol.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub orders_mirrored: u32,
    pub fills_ingested: u32,
    pub position_mismatch: bool,
    pub idempotency_pruned: usize,
}

pub struct Reconciler {
    pub settings: Arc<Settings>,
    pub storage: Storage,
    pub broker: Arc<dyn Broker>,
    pub market_data: Arc<MarketData>,
    pub bus: EventBus,
    pub metrics: Arc<Metrics>,
}

impl Reconciler {
    /// One full cycle for `symbol`. Each sub-task is independently fallible;
    /// a broker hiccup in one does not stop the others.
    pub async fn run_once(&self, symbol: &Symbol) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        match self.reconcile_orders(symbol).await {
            Ok((mirrored, ingested)) => {
                summary.orders_mirrored = mirrored;
                summary.fills_ingested = ingested;
            }
            Err(e) => {
                warn!(%symbol, error = %e, "orders reconciliation failed");
                self.metrics.inc_labeled("reconcile_errors_total", "task", "orders");
            }
        }

        match self.reconcile_positions(symbol).await {
            Ok(mismatch) => summary.position_mismatch = mismatch,
            Err(e) => {
                warn!(%symbol, error = %e, "positions reconciliation failed");
                self.metrics.inc_labeled("reconcile_errors_total", "task", "positions");
            }
        }

        let balances = match self.fetch_balances(symbol).await {
            Ok(b) => b,
            Err(e) => {
                warn!(%symbol, error = %e, "balances reconciliation failed");
                self.metrics.inc_labeled("reconcile_errors_total", "task", "balances");
                json!(null)
            }
        };

        summary.idempotency_pruned = self.storage.idempotency().prune_expired()?;

        // Restart diagnostics: when did this symbol last reconcile.
        self.storage
            .kv()
            .put(&format!("reconcile.last_ms.{symbol}"), &crate::types::now_ms().to_string())?;

        let key_hint = symbol.to_string();
        self.bus
            .publish(
                topics::RECONCILIATION_COMPLETED,
                json!({
                    "symbol": key_hint,
                    "orders_mirrored": summary.orders_mirrored,
                    "fills_ingested": summary.fills_ingested,
                    "position_mismatch": summary.position_mismatch,
                    "idempotency_pruned": summary.idempotency_pruned,
                    "balances": balances,
                }),
                Some(&key_hint),
            )
            .await;

        info!(
            %symbol,
            mirrored = summary.orders_mirrored,
            ingested = summary.fills_ingested,
            mismatch = summary.position_mismatch,
            "reconciliation cycle completed"
        );
        Ok(summary)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    async fn reconcile_orders(&self, symbol: &Symbol) -> Result<(u32, u32)> {
        let broker_open = self
            .broker
            .fetch_open_orders(symbol)
            .await
            .context("fetch_open_orders failed")?;

        let trades = self.storage.trades();
        let mut mirrored = 0u32;
        for order in &broker_open {
            trades.upsert_broker_order(order)?;
            mirrored += 1;
        }

        let open_ids: HashSet<&str> = broker_open.iter().map(|o| o.id.as_str()).collect();

        // Locally-open orders the broker no longer lists: re-query each and
        // drive the fill-ingestion path when it closed with a fill.
        let mut ingested = 0u32;
        for local in trades.open_orders(symbol)? {
            if local.broker_order_id.is_empty() || open_ids.contains(local.broker_order_id.as_str())
            {
                continue;
            }
            let fetched = match self.broker.fetch_order(symbol, &local.broker_order_id).await {
                Ok(o) => o,
                Err(e) => {
                    warn!(
                        %symbol,
                        broker_order_id = %local.broker_order_id,
                        error = %e,
                        "re-query of vanished open order failed"
                    );
                    continue;
                }
            };

            match fetched.status {
                OrderStatus::Closed if fetched.filled > Decimal::ZERO => {
                    let mut fill = fetched;
                    if fill.client_order_id.is_empty() {
                        fill.client_order_id = local.client_order_id.clone();
                    }
                    let applied = self.storage.apply_fill(&fill)?;
                    if applied.applied {
                        ingested += 1;
                        info!(
                            %symbol,
                            broker_order_id = %fill.id,
                            trade_id = applied.trade_id,
                            "externally-closed order ingested"
                        );
                    }
                }
                OrderStatus::Canceled => {
                    trades.upsert_broker_order(&fetched)?;
                    debug!(%symbol, broker_order_id = %fetched.id, "order marked canceled");
                }
                _ => {}
            }
        }

        Ok((mirrored, ingested))
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Returns true when a mismatch event was emitted.
    async fn reconcile_positions(&self, symbol: &Symbol) -> Result<bool> {
        let position = self.storage.positions().get(symbol)?;
        if !position.is_open() {
            return Ok(false);
        }

        let ticker = self
            .market_data
            .ticker(symbol)
            .await
            .context("ticker fetch failed")?;
        let unrealized = (ticker.last - position.avg_entry_price) * position.base_qty;
        debug!(
            %symbol,
            base_qty = %position.base_qty,
            last = %ticker.last,
            unrealized = %unrealized,
            "position re-priced"
        );

        let balance = self
            .broker
            .fetch_balance(symbol)
            .await
            .context("balance fetch failed")?;
        let divergence = (balance.free_base - position.base_qty).abs();
        if divergence > self.settings.reconcile_epsilon_base {
            let key_hint = symbol.to_string();
            warn!(
                %symbol,
                local = %position.base_qty,
                broker = %balance.free_base,
                "base balance diverges from local position"
            );
            self.bus
                .publish(
                    topics::RECONCILE_POSITION_MISMATCH,
                    json!({
                        "symbol": key_hint,
                        "local_base_qty": position.base_qty.to_string(),
                        "broker_free_base": balance.free_base.to_string(),
                        "divergence": divergence.to_string(),
                        "epsilon": self.settings.reconcile_epsilon_base.to_string(),
                    }),
                    Some(&key_hint),
                )
                .await;
            return Ok(true);
        }
        Ok(false)
    }

    // -------------------------------------------------------------------------
    // Balances
    // -------------------------------------------------------------------------

    async fn fetch_balances(&self, symbol: &Symbol) -> Result<serde_json::Value> {
        let balance = self
            .broker
            .fetch_balance(symbol)
            .await
            .context("balance fetch failed")?;
        Ok(json!({
            "free_base": balance.free_base.to_string(),
            "free_quote": balance.free_quote.to_string(),
        }))
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MarketSpec, PaperBroker};
    use crate::types::{now_ms, Order, OrderType, Side};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::time::Duration;

    fn sym() -> Symbol {
        Symbol::parse("BTC/USDT").unwrap()
    }

    fn reconciler(paper: Arc<PaperBroker>, storage: Storage) -> (Reconciler, EventBus) {
        let metrics = Arc::new(Metrics::new());
        let bus = EventBus::new(256, metrics.clone());
        bus.start();
        let r = Reconciler {
            settings: Arc::new(Settings::from_map(&HashMap::new()).unwrap()),
            storage,
            broker: paper.clone(),
            market_data: Arc::new(MarketData::new(paper, 0)),
            bus: bus.clone(),
            metrics,
        };
        (r, bus)
    }

    fn open_order(id: &str, coid: &str, amount: Decimal) -> Order {
        Order {
            id: id.to_string(),
            client_order_id: coid.to_string(),
            symbol: sym(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            amount,
            price: dec!(49000),
            filled: Decimal::ZERO,
            cost: Decimal::ZERO,
            fee_quote: Decimal::ZERO,
            status: OrderStatus::Open,
            ts_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn broker_open_orders_are_mirrored_locally() {
        let paper = Arc::new(PaperBroker::new(MarketSpec::default()));
        paper.set_price(&sym(), dec!(50000));
        paper.inject_open_order(open_order("X-1", "c-x1", dec!(0.001)));

        let storage = Storage::open_in_memory().unwrap();
        let (r, bus) = reconciler(paper, storage.clone());

        let summary = r.run_once(&sym()).await.unwrap();
        assert_eq!(summary.orders_mirrored, 1);

        let local = storage.trades().get_by_broker_order_id("X-1").unwrap().unwrap();
        assert_eq!(local.status, OrderStatus::Open);
        assert_eq!(local.client_order_id, "c-x1");
        bus.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn externally_closed_order_updates_position_exactly_once() {
        let paper = Arc::new(PaperBroker::new(MarketSpec::default()));
        paper.set_price(&sym(), dec!(50000));
        paper.inject_open_order(open_order("X-2", "c-x2", dec!(0.002)));

        let storage = Storage::open_in_memory().unwrap();
        let (r, bus) = reconciler(paper.clone(), storage.clone());

        // First cycle mirrors the open order.
        r.run_once(&sym()).await.unwrap();
        assert!(!storage.positions().get(&sym()).unwrap().is_open());

        // The order closes at the broker; the next cycle ingests the fill.
        paper.settle_open_order("X-2", dec!(49000));
        let summary = r.run_once(&sym()).await.unwrap();
        assert_eq!(summary.fills_ingested, 1);
        let pos = storage.positions().get(&sym()).unwrap();
        assert_eq!(pos.base_qty, dec!(0.002));

        // Replaying the cycle any number of times changes nothing.
        let again = r.run_once(&sym()).await.unwrap();
        assert_eq!(again.fills_ingested, 0);
        let pos2 = storage.positions().get(&sym()).unwrap();
        assert_eq!(pos2.base_qty, dec!(0.002));
        assert_eq!(pos2.version, pos.version);
        bus.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn base_balance_divergence_emits_mismatch_event() {
        let paper = Arc::new(PaperBroker::new(MarketSpec::default()));
        paper.set_price(&sym(), dec!(50000));
        // Local position says 0.002 BTC but the broker ledger holds none.
        let storage = Storage::open_in_memory().unwrap();
        let mut fill = open_order("X-3", "c-x3", dec!(0.002));
        fill.status = OrderStatus::Closed;
        fill.filled = dec!(0.002);
        fill.cost = dec!(100);
        storage.apply_fill(&fill).unwrap();

        let (r, bus) = reconciler(paper, storage);
        let seen = Arc::new(parking_lot::Mutex::new(0u32));
        let sink = seen.clone();
        bus.subscribe(topics::RECONCILE_POSITION_MISMATCH, "t", move |_ev| {
            let sink = sink.clone();
            async move {
                *sink.lock() += 1;
                Ok(())
            }
        });

        let summary = r.run_once(&sym()).await.unwrap();
        assert!(summary.position_mismatch);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock(), 1);

        // No automatic repair happened.
        assert_eq!(r.storage.positions().get(&sym()).unwrap().base_qty, dec!(0.002));
        bus.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cycle_prunes_expired_idempotency_records() {
        let paper = Arc::new(PaperBroker::new(MarketSpec::default()));
        paper.set_price(&sym(), dec!(50000));
        let storage = Storage::open_in_memory().unwrap();
        storage.idempotency().claim_at("stale", 1, 1_000).unwrap();

        let (r, bus) = reconciler(paper, storage.clone());
        let summary = r.run_once(&sym()).await.unwrap();
        assert_eq!(summary.idempotency_pruned, 1);

        // The cycle stamps its completion for restart diagnostics.
        assert!(storage.kv().get("reconcile.last_ms.BTC/USDT").unwrap().is_some());
        bus.stop(Duration::from_secs(1)).await;
    }
}
