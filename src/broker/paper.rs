// =============================================================================
// Paper Broker — deterministic local simulator with a balance ledger
// =============================================================================
//
// The simulator is the source of truth for its own orders: market orders fill
// instantly at the current book, fees are charged in quote currency, and the
// ledger never goes negative. The price feed is scripted by the embedding
// code (tests, backtest harness) via `set_price` / `set_book`.
//
// All broker-port contracts hold here exactly as they do against the live
// exchange: duplicate client ids resolve to the original order, and filter
// violations are typed rejections that never touch the ledger.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{Broker, MarketSpec};
use crate::errors::{BrokerError, RejectReason};
use crate::types::{
    now_ms, Balance, Candle, Order, OrderStatus, OrderType, Side, Symbol, Ticker,
};

/// Default taker fee (0.1 %).
const DEFAULT_FEE_RATE: &str = "0.001";
/// Default half-spread applied around the last price (0.05 %).
const DEFAULT_HALF_SPREAD: &str = "0.0005";
/// Price points retained per symbol for OHLCV synthesis.
const HISTORY_CAP: usize = 1_000;

#[derive(Default)]
struct PaperState {
    balances: HashMap<String, Decimal>,
    last_price: HashMap<Symbol, Decimal>,
    /// Explicit bid/ask override (takes precedence over the derived book).
    book: HashMap<Symbol, (Decimal, Decimal)>,
    history: HashMap<Symbol, Vec<(i64, Decimal)>>,
    orders_by_client: HashMap<String, Order>,
    orders_by_id: HashMap<String, Order>,
    /// Orders injected as `open` (simulating externally-placed limit orders).
    open_orders: Vec<Order>,
    next_id: u64,
}

/// Deterministic in-process exchange simulator.
pub struct PaperBroker {
    spec: MarketSpec,
    fee_rate: Decimal,
    half_spread: Decimal,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(spec: MarketSpec) -> Self {
        Self {
            spec,
            fee_rate: DEFAULT_FEE_RATE.parse().expect("valid fee constant"),
            half_spread: DEFAULT_HALF_SPREAD.parse().expect("valid spread constant"),
            state: Mutex::new(PaperState::default()),
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    // -------------------------------------------------------------------------
    // Scripting surface (tests / backtest harness)
    // -------------------------------------------------------------------------

    /// Credit `amount` of an asset to the ledger.
    pub fn deposit(&self, asset: &str, amount: Decimal) {
        let mut st = self.state.lock();
        *st.balances.entry(asset.to_uppercase()).or_insert(Decimal::ZERO) += amount;
        debug!(asset, %amount, "paper deposit");
    }

    /// Current free balance of an asset.
    pub fn balance_of(&self, asset: &str) -> Decimal {
        self.state
            .lock()
            .balances
            .get(&asset.to_uppercase())
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Advance the price feed for `symbol`.
    pub fn set_price(&self, symbol: &Symbol, price: Decimal) {
        let mut st = self.state.lock();
        st.last_price.insert(symbol.clone(), price);
        st.book.remove(symbol);
        let history = st.history.entry(symbol.clone()).or_default();
        history.push((now_ms(), price));
        if history.len() > HISTORY_CAP {
            history.remove(0);
        }
    }

    /// Pin an explicit bid/ask (overrides the derived book until the next
    /// `set_price`).
    pub fn set_book(&self, symbol: &Symbol, bid: Decimal, ask: Decimal) {
        let mut st = self.state.lock();
        st.last_price.insert(symbol.clone(), (bid + ask) / Decimal::TWO);
        st.book.insert(symbol.clone(), (bid, ask));
    }

    /// Number of orders the simulator has accepted.
    pub fn order_count(&self) -> usize {
        self.state.lock().orders_by_id.len()
    }

    /// Register an externally-open order (reconciliation scenarios).
    pub fn inject_open_order(&self, order: Order) {
        let mut st = self.state.lock();
        st.orders_by_id.insert(order.id.clone(), order.clone());
        if !order.client_order_id.is_empty() {
            st.orders_by_client.insert(order.client_order_id.clone(), order.clone());
        }
        st.open_orders.push(order);
    }

    /// Close an injected order with a full fill at `fill_price`.
    pub fn settle_open_order(&self, broker_order_id: &str, fill_price: Decimal) {
        let mut st = self.state.lock();
        st.open_orders.retain(|o| o.id != broker_order_id);
        if let Some(order) = st.orders_by_id.get_mut(broker_order_id) {
            order.status = OrderStatus::Closed;
            order.filled = order.amount;
            order.price = fill_price;
            order.cost = order.amount * fill_price;
            let updated = order.clone();
            if !updated.client_order_id.is_empty() {
                st.orders_by_client.insert(updated.client_order_id.clone(), updated);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn book_of(&self, st: &PaperState, symbol: &Symbol) -> Result<(Decimal, Decimal), BrokerError> {
        if let Some(&(bid, ask)) = st.book.get(symbol) {
            return Ok((bid, ask));
        }
        let last = st
            .last_price
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Data(format!("no price configured for {symbol}")))?;
        let bid = last * (Decimal::ONE - self.half_spread);
        let ask = last * (Decimal::ONE + self.half_spread);
        Ok((bid, ask))
    }

    fn next_order_id(st: &mut PaperState) -> String {
        st.next_id += 1;
        format!("P-{}", st.next_id)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, BrokerError> {
        let st = self.state.lock();
        let (bid, ask) = self.book_of(&st, symbol)?;
        let last = st
            .last_price
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Data(format!("no price configured for {symbol}")))?;
        Ok(Ticker {
            symbol: symbol.clone(),
            last,
            bid,
            ask,
            ts_ms: now_ms(),
        })
    }

    async fn fetch_balance(&self, symbol: &Symbol) -> Result<Balance, BrokerError> {
        let st = self.state.lock();
        Ok(Balance {
            free_base: st.balances.get(symbol.base()).copied().unwrap_or(Decimal::ZERO),
            free_quote: st.balances.get(symbol.quote()).copied().unwrap_or(Decimal::ZERO),
        })
    }

    async fn fetch_order(
        &self,
        _symbol: &Symbol,
        broker_order_id: &str,
    ) -> Result<Order, BrokerError> {
        let st = self.state.lock();
        st.orders_by_id
            .get(broker_order_id)
            .cloned()
            .ok_or_else(|| BrokerError::Data(format!("unknown order id {broker_order_id}")))
    }

    async fn fetch_open_orders(&self, symbol: &Symbol) -> Result<Vec<Order>, BrokerError> {
        let st = self.state.lock();
        Ok(st
            .open_orders
            .iter()
            .filter(|o| &o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn fetch_ohlcv(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Candle>, BrokerError> {
        let st = self.state.lock();
        let history = st.history.get(symbol).cloned().unwrap_or_default();
        let start = history.len().saturating_sub(limit);
        Ok(history[start..]
            .iter()
            .map(|&(ts_ms, p)| Candle {
                ts_ms,
                open: p,
                high: p,
                low: p,
                close: p,
                volume: Decimal::ZERO,
            })
            .collect())
    }

    async fn create_market_buy_quote(
        &self,
        symbol: &Symbol,
        quote_amount: Decimal,
        client_order_id: &str,
    ) -> Result<Order, BrokerError> {
        let mut st = self.state.lock();

        // Duplicate client ids resolve to the original fill.
        if let Some(existing) = st.orders_by_client.get(client_order_id) {
            debug!(client_order_id, "paper buy resolved existing order");
            return Ok(existing.clone());
        }

        let (_bid, ask) = self.book_of(&st, symbol)?;
        if quote_amount <= Decimal::ZERO || ask <= Decimal::ZERO {
            return Err(BrokerError::Data("non-positive amount or price".to_string()));
        }

        let base = self.spec.quantize_amount(quote_amount / ask);
        self.spec.validate(base, ask)?;

        let cost = base * ask;
        let fee = cost * self.fee_rate;
        let need = cost + fee;

        let free_quote = st.balances.get(symbol.quote()).copied().unwrap_or(Decimal::ZERO);
        if free_quote < need {
            return Err(BrokerError::rejected(
                RejectReason::InsufficientFunds,
                format!("need {need} {}, have {free_quote}", symbol.quote()),
            ));
        }

        *st.balances.entry(symbol.quote().to_string()).or_insert(Decimal::ZERO) -= need;
        *st.balances.entry(symbol.base().to_string()).or_insert(Decimal::ZERO) += base;

        let order = Order {
            id: Self::next_order_id(&mut st),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.clone(),
            side: Side::Buy,
            order_type: OrderType::Market,
            amount: base,
            price: ask,
            filled: base,
            cost,
            fee_quote: fee,
            status: OrderStatus::Closed,
            ts_ms: now_ms(),
        };
        st.orders_by_client.insert(client_order_id.to_string(), order.clone());
        st.orders_by_id.insert(order.id.clone(), order.clone());

        info!(
            %symbol,
            order_id = %order.id,
            %base,
            %cost,
            %fee,
            "paper market buy filled"
        );
        Ok(order)
    }

    async fn create_market_sell_base(
        &self,
        symbol: &Symbol,
        base_amount: Decimal,
        client_order_id: &str,
    ) -> Result<Order, BrokerError> {
        let mut st = self.state.lock();

        if let Some(existing) = st.orders_by_client.get(client_order_id) {
            debug!(client_order_id, "paper sell resolved existing order");
            return Ok(existing.clone());
        }

        let (bid, _ask) = self.book_of(&st, symbol)?;
        if base_amount <= Decimal::ZERO || bid <= Decimal::ZERO {
            return Err(BrokerError::Data("non-positive amount or price".to_string()));
        }

        let base = self.spec.quantize_amount(base_amount);
        self.spec.validate(base, bid)?;

        let free_base = st.balances.get(symbol.base()).copied().unwrap_or(Decimal::ZERO);
        if free_base < base {
            return Err(BrokerError::rejected(
                RejectReason::InsufficientFunds,
                format!("need {base} {}, have {free_base}", symbol.base()),
            ));
        }

        let proceeds = base * bid;
        let fee = proceeds * self.fee_rate;

        *st.balances.entry(symbol.base().to_string()).or_insert(Decimal::ZERO) -= base;
        *st.balances.entry(symbol.quote().to_string()).or_insert(Decimal::ZERO) +=
            proceeds - fee;

        let order = Order {
            id: Self::next_order_id(&mut st),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.clone(),
            side: Side::Sell,
            order_type: OrderType::Market,
            amount: base,
            price: bid,
            filled: base,
            cost: proceeds,
            fee_quote: fee,
            status: OrderStatus::Closed,
            ts_ms: now_ms(),
        };
        st.orders_by_client.insert(client_order_id.to_string(), order.clone());
        st.orders_by_id.insert(order.id.clone(), order.clone());

        info!(
            %symbol,
            order_id = %order.id,
            %base,
            %proceeds,
            %fee,
            "paper market sell filled"
        );
        Ok(order)
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("PaperBroker")
            .field("assets", &st.balances.len())
            .field("orders", &st.orders_by_id.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sym() -> Symbol {
        Symbol::parse("BTC/USDT").unwrap()
    }

    fn broker() -> PaperBroker {
        let b = PaperBroker::new(MarketSpec::default());
        b.deposit("USDT", dec!(1000));
        b
    }

    #[tokio::test]
    async fn buy_then_sell_roundtrip_charges_two_fees() {
        let b = broker();
        b.set_book(&sym(), dec!(50000), dec!(50000));

        let buy = b.create_market_buy_quote(&sym(), dec!(100), "c-buy").await.unwrap();
        assert_eq!(buy.filled, dec!(0.002));
        assert_eq!(buy.cost, dec!(100));
        assert_eq!(buy.fee_quote, dec!(0.1));
        assert_eq!(b.balance_of("USDT"), dec!(899.9));
        assert_eq!(b.balance_of("BTC"), dec!(0.002));

        let sell = b
            .create_market_sell_base(&sym(), buy.filled, "c-sell")
            .await
            .unwrap();
        assert_eq!(sell.filled, dec!(0.002));
        assert_eq!(sell.fee_quote, dec!(0.1));
        assert_eq!(b.balance_of("BTC"), Decimal::ZERO);
        // 1000 minus two 0.1 fees.
        assert_eq!(b.balance_of("USDT"), dec!(999.8));
    }

    #[tokio::test]
    async fn duplicate_client_order_id_resolves_original() {
        let b = broker();
        b.set_book(&sym(), dec!(50000), dec!(50000));

        let first = b.create_market_buy_quote(&sym(), dec!(100), "dup").await.unwrap();
        let second = b.create_market_buy_quote(&sym(), dec!(100), "dup").await.unwrap();

        assert_eq!(first.id, second.id);
        // The ledger moved only once.
        assert_eq!(b.balance_of("USDT"), dec!(899.9));
    }

    #[tokio::test]
    async fn min_notional_rejected_without_ledger_movement() {
        let b = broker();
        b.set_price(&sym(), dec!(50000));

        // 0.9 USDT buys enough base to clear min_amount but stays under the
        // 1 USDT notional floor.
        let err = b
            .create_market_buy_quote(&sym(), dec!(0.9), "tiny")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Rejected { reason: RejectReason::MinNotional, .. }
        ));
        assert_eq!(b.balance_of("USDT"), dec!(1000));
    }

    #[tokio::test]
    async fn dust_buy_rejected_as_min_amount() {
        let b = broker();
        b.set_price(&sym(), dec!(50000));

        let err = b
            .create_market_buy_quote(&sym(), dec!(0.2), "dust")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Rejected { reason: RejectReason::MinAmount, .. }
        ));
    }

    #[tokio::test]
    async fn insufficient_funds_rejected() {
        let b = broker();
        b.set_price(&sym(), dec!(50000));

        let err = b
            .create_market_buy_quote(&sym(), dec!(5000), "big")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Rejected { reason: RejectReason::InsufficientFunds, .. }
        ));
    }

    #[tokio::test]
    async fn sell_without_inventory_rejected() {
        let b = broker();
        b.set_price(&sym(), dec!(50000));
        let err = b
            .create_market_sell_base(&sym(), dec!(0.01), "no-inv")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Rejected { reason: RejectReason::InsufficientFunds, .. }
        ));
    }

    #[tokio::test]
    async fn ticker_without_price_is_a_data_error() {
        let b = broker();
        assert!(matches!(
            b.fetch_ticker(&sym()).await.unwrap_err(),
            BrokerError::Data(_)
        ));
    }

    #[tokio::test]
    async fn derived_book_straddles_last_price() {
        let b = broker();
        b.set_price(&sym(), dec!(50000));
        let t = b.fetch_ticker(&sym()).await.unwrap();
        assert!(t.bid < t.last && t.last < t.ask);
        assert_eq!(t.mid(), dec!(50000));
    }

    #[tokio::test]
    async fn injected_open_order_settles_to_closed() {
        let b = broker();
        b.set_price(&sym(), dec!(50000));
        let order = Order {
            id: "X-1".to_string(),
            client_order_id: "c-x".to_string(),
            symbol: sym(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            amount: dec!(0.001),
            price: dec!(49000),
            filled: Decimal::ZERO,
            cost: Decimal::ZERO,
            fee_quote: Decimal::ZERO,
            status: OrderStatus::Open,
            ts_ms: now_ms(),
        };
        b.inject_open_order(order);
        assert_eq!(b.fetch_open_orders(&sym()).await.unwrap().len(), 1);

        b.settle_open_order("X-1", dec!(49000));
        assert!(b.fetch_open_orders(&sym()).await.unwrap().is_empty());
        let settled = b.fetch_order(&sym(), "X-1").await.unwrap();
        assert_eq!(settled.status, OrderStatus::Closed);
        assert_eq!(settled.filled, dec!(0.001));
    }

    #[tokio::test]
    async fn ohlcv_reflects_scripted_prices() {
        let b = broker();
        for p in [dec!(100), dec!(101), dec!(102)] {
            b.set_price(&sym(), p);
        }
        let candles = b.fetch_ohlcv(&sym(), 2).await.unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, dec!(101));
        assert_eq!(candles[1].close, dec!(102));
    }
}
