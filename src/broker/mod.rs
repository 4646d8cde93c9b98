// =============================================================================
// Broker port — one async interface over the live exchange and the simulator
// =============================================================================
//
// Contracts every implementation must honor:
//   - `client_order_id` is echoed unchanged in the returned Order. If the
//     broker already knows that id, the existing order is resolved and
//     returned (duplicate creation is idempotent at the protocol layer).
//   - Quantization to market precision happens inside the adapter; amounts
//     that cannot be satisfied yield typed `min_amount` / `min_notional`
//     rejections, never a wire call.
//   - Network / 5xx / rate-limit failures surface as the `transient` kind so
//     retry policies above can distinguish them from rejections.
// =============================================================================

pub mod live;
pub mod paper;
pub mod rate_limit;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::{BrokerError, RejectReason};
use crate::settings::Settings;
use crate::types::{Balance, BrokerMode, Candle, Order, Symbol, Ticker};

pub use live::LiveBroker;
pub use paper::PaperBroker;

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Broker: Send + Sync {
    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, BrokerError>;

    async fn fetch_balance(&self, symbol: &Symbol) -> Result<Balance, BrokerError>;

    async fn fetch_order(&self, symbol: &Symbol, broker_order_id: &str)
        -> Result<Order, BrokerError>;

    async fn fetch_open_orders(&self, symbol: &Symbol) -> Result<Vec<Order>, BrokerError>;

    /// Recent OHLCV history, oldest first (feeds the strategy context).
    async fn fetch_ohlcv(&self, symbol: &Symbol, limit: usize)
        -> Result<Vec<Candle>, BrokerError>;

    /// Market-buy spending `quote_amount` of the quote currency.
    async fn create_market_buy_quote(
        &self,
        symbol: &Symbol,
        quote_amount: Decimal,
        client_order_id: &str,
    ) -> Result<Order, BrokerError>;

    /// Market-sell of `base_amount` base units.
    async fn create_market_sell_base(
        &self,
        symbol: &Symbol,
        base_amount: Decimal,
        client_order_id: &str,
    ) -> Result<Order, BrokerError>;
}

// ---------------------------------------------------------------------------
// Market spec / quantization
// ---------------------------------------------------------------------------

/// Exchange filters applied before any order leaves the adapter.
#[derive(Debug, Clone)]
pub struct MarketSpec {
    pub amount_precision: u32,
    pub price_precision: u32,
    pub min_amount: Decimal,
    pub min_notional: Decimal,
}

impl Default for MarketSpec {
    fn default() -> Self {
        Self {
            amount_precision: 8,
            price_precision: 2,
            min_amount: Decimal::new(1, 5), // 0.00001
            min_notional: Decimal::ONE,
        }
    }
}

impl MarketSpec {
    /// Truncate a base amount down to the market's step.
    pub fn quantize_amount(&self, amount: Decimal) -> Decimal {
        amount.trunc_with_scale(self.amount_precision)
    }

    /// Truncate a price down to the market's tick.
    pub fn quantize_price(&self, price: Decimal) -> Decimal {
        price.trunc_with_scale(self.price_precision)
    }

    /// Validate a quantized order against the exchange filters.
    pub fn validate(&self, amount: Decimal, price: Decimal) -> Result<(), BrokerError> {
        if amount < self.min_amount {
            return Err(BrokerError::rejected(
                RejectReason::MinAmount,
                format!("amount {amount} below minimum {}", self.min_amount),
            ));
        }
        let notional = amount * price;
        if notional < self.min_notional {
            return Err(BrokerError::rejected(
                RejectReason::MinNotional,
                format!("notional {notional} below minimum {}", self.min_notional),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the broker selected by `MODE`. Backtest shares the paper simulator;
/// the backtest harness drives its price feed externally.
pub fn build_broker(settings: &Settings) -> Result<Arc<dyn Broker>> {
    match settings.mode {
        BrokerMode::Live => Ok(Arc::new(LiveBroker::new(
            &settings.exchange,
            settings.credentials.clone(),
            settings.http_timeout_sec,
        )?)),
        BrokerMode::Paper | BrokerMode::Backtest => {
            let broker = PaperBroker::new(MarketSpec::default());
            for symbol in &settings.symbols {
                broker.deposit(symbol.quote(), Decimal::from(10_000));
            }
            Ok(Arc::new(broker))
        }
    }
}
