// =============================================================================
// Shared types used across the Borealis trading engine
// =============================================================================
//
// Money rule: every price, amount, cost, fee, and PnL value is a
// `rust_decimal::Decimal`. Floats never cross component boundaries; the only
// place a float may appear is inside a broker adapter while parsing wire JSON.
// =============================================================================

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as i64
}

// ---------------------------------------------------------------------------
// Symbol
// ---------------------------------------------------------------------------

/// Canonical trading pair in `BASE/QUOTE` form, always uppercase.
///
/// All public APIs speak this form; broker-specific spellings (`BTCUSDT`,
/// `BTC_USDT`, `BTC-USDT`) are produced and consumed only at the broker
/// boundary via [`Symbol::compact`], [`Symbol::dashed`] and
/// [`Symbol::parse_loose`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    /// Parse a strict canonical `BASE/QUOTE` string.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| format!("symbol '{s}' is not in BASE/QUOTE form"))?;
        Self::from_parts(base, quote)
    }

    /// Parse any of the accepted spellings: `BASE/QUOTE`, `BASE-QUOTE`,
    /// `BASE_QUOTE`, or compact `BASEQUOTE` (compact requires a known quote
    /// suffix such as USDT/USDC/BTC/ETH/EUR/USD).
    pub fn parse_loose(s: &str) -> Result<Self, String> {
        let s = s.trim();
        for sep in ['/', '-', '_'] {
            if let Some((base, quote)) = s.split_once(sep) {
                return Self::from_parts(base, quote);
            }
        }
        const KNOWN_QUOTES: [&str; 6] = ["USDT", "USDC", "BTC", "ETH", "EUR", "USD"];
        let upper = s.to_uppercase();
        for q in KNOWN_QUOTES {
            if upper.len() > q.len() && upper.ends_with(q) {
                return Self::from_parts(&upper[..upper.len() - q.len()], q);
            }
        }
        Err(format!("cannot derive BASE/QUOTE from '{s}'"))
    }

    fn from_parts(base: &str, quote: &str) -> Result<Self, String> {
        let base = base.trim().to_uppercase();
        let quote = quote.trim().to_uppercase();
        if base.is_empty() || quote.is_empty() {
            return Err("symbol base/quote must be non-empty".to_string());
        }
        if !base.chars().all(|c| c.is_ascii_alphanumeric())
            || !quote.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(format!("symbol '{base}/{quote}' contains invalid characters"));
        }
        Ok(Self { base, quote })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// `BASEQUOTE` spelling used by the exchange REST API.
    pub fn compact(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// `BASE-QUOTE` spelling used inside idempotency keys.
    pub fn dashed(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl TryFrom<String> for Symbol {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Symbol::parse(&s)
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> String {
        s.to_string()
    }
}

// ---------------------------------------------------------------------------
// Order primitives
// ---------------------------------------------------------------------------

/// Order direction. The engine is strictly long-only: sells can only reduce
/// an existing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(format!("unknown side '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

impl FromStr for OrderType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "market" => Ok(Self::Market),
            "limit" => Ok(Self::Limit),
            other => Err(format!("unknown order type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown order status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Market snapshots
// ---------------------------------------------------------------------------

/// Best bid/ask plus last trade price for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub ts_ms: i64,
}

impl Ticker {
    /// Midpoint of the current bid/ask.
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Free balances for the two legs of a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub free_base: Decimal,
    pub free_quote: Decimal,
}

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub ts_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

// ---------------------------------------------------------------------------
// Orders, trades, positions
// ---------------------------------------------------------------------------

/// An order as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Broker-assigned id.
    pub id: String,
    /// Caller-assigned, globally unique. Echoed unchanged by the broker.
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    /// Requested amount in base units.
    pub amount: Decimal,
    /// Limit price, or average fill price once known.
    pub price: Decimal,
    /// Filled amount in base units.
    pub filled: Decimal,
    /// Total cost in quote units.
    pub cost: Decimal,
    /// Fee charged, expressed in quote units.
    pub fee_quote: Decimal,
    pub status: OrderStatus,
    pub ts_ms: i64,
}

/// A persisted fill record. Same shape as [`Order`] plus the monotonic insert
/// timestamp assigned by storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub broker_order_id: String,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Decimal,
    pub filled: Decimal,
    pub cost: Decimal,
    pub fee_quote: Decimal,
    pub status: OrderStatus,
    pub ts_ms: i64,
    /// Insert timestamp (ms), monotonic per storage.
    pub inserted_ms: i64,
}

/// Long-only position, one row per symbol.
///
/// Invariant: `base_qty = 0` implies `avg_entry_price = 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub base_qty: Decimal,
    pub avg_entry_price: Decimal,
    /// Highest price observed since the position was opened (trailing anchor).
    pub max_price_since_entry: Decimal,
    /// Bumped on every mutation.
    pub version: i64,
}

impl Position {
    /// A flat (empty) position for `symbol`.
    pub fn flat(symbol: Symbol) -> Self {
        Self {
            symbol,
            base_qty: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            max_price_since_entry: Decimal::ZERO,
            version: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.base_qty > Decimal::ZERO
    }
}

// ---------------------------------------------------------------------------
// Strategy decisions
// ---------------------------------------------------------------------------

/// What the strategy wants to do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

/// A strategy decision with its confidence score and free-form metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub score: Decimal,
    pub meta: serde_json::Value,
}

impl Decision {
    pub fn hold(reason: &str) -> Self {
        Self {
            action: Action::Hold,
            score: Decimal::ZERO,
            meta: serde_json::json!({ "reason": reason }),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine modes
// ---------------------------------------------------------------------------

/// Which broker implementation backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    Paper,
    Live,
    Backtest,
}

impl std::fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
            Self::Backtest => write!(f, "backtest"),
        }
    }
}

impl FromStr for BrokerMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paper" => Ok(Self::Paper),
            "live" => Ok(Self::Live),
            "backtest" => Ok(Self::Backtest),
            other => Err(format!("unknown mode '{other}' (expected paper|live|backtest)")),
        }
    }
}
