// =============================================================================
// Market Data — ticker / OHLCV access with a TTL cache over the broker
// =============================================================================
//
// The four per-symbol loops all want fresh-enough prices; the cache collapses
// their overlapping fetches into one broker call per TTL window. Entries are
// keyed per symbol, so symbols never share staleness.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::broker::Broker;
use crate::errors::BrokerError;
use crate::types::{now_ms, Candle, Symbol, Ticker};

/// Candle history depth requested from the broker.
const CANDLE_LIMIT: usize = 200;

/// TTL-cached market-data port.
pub struct MarketData {
    broker: Arc<dyn Broker>,
    ttl_ms: i64,
    tickers: Mutex<HashMap<Symbol, (i64, Ticker)>>,
    candles: Mutex<HashMap<Symbol, (i64, Vec<Candle>)>>,
}

impl MarketData {
    pub fn new(broker: Arc<dyn Broker>, ttl_ms: i64) -> Self {
        Self {
            broker,
            ttl_ms: ttl_ms.max(0),
            tickers: Mutex::new(HashMap::new()),
            candles: Mutex::new(HashMap::new()),
        }
    }

    /// Latest ticker, served from cache within the TTL.
    pub async fn ticker(&self, symbol: &Symbol) -> Result<Ticker, BrokerError> {
        let now = now_ms();
        if let Some((cached_at, ticker)) = self.tickers.lock().get(symbol) {
            if now - cached_at < self.ttl_ms {
                return Ok(ticker.clone());
            }
        }

        let ticker = self.broker.fetch_ticker(symbol).await?;
        self.tickers.lock().insert(symbol.clone(), (now, ticker.clone()));
        debug!(%symbol, last = %ticker.last, "ticker refreshed");
        Ok(ticker)
    }

    /// Recent OHLCV history (oldest first), served from cache within the TTL.
    pub async fn candles(&self, symbol: &Symbol) -> Result<Vec<Candle>, BrokerError> {
        let now = now_ms();
        if let Some((cached_at, candles)) = self.candles.lock().get(symbol) {
            if now - cached_at < self.ttl_ms {
                return Ok(candles.clone());
            }
        }

        let candles = self.broker.fetch_ohlcv(symbol, CANDLE_LIMIT).await?;
        self.candles.lock().insert(symbol.clone(), (now, candles.clone()));
        Ok(candles)
    }

    /// Drop cached entries for `symbol` (used after order execution so exits
    /// see post-trade prices immediately).
    pub fn invalidate(&self, symbol: &Symbol) {
        self.tickers.lock().remove(symbol);
        self.candles.lock().remove(symbol);
    }
}

impl std::fmt::Debug for MarketData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketData")
            .field("ttl_ms", &self.ttl_ms)
            .field("cached_tickers", &self.tickers.lock().len())
            .finish()
    }
}
