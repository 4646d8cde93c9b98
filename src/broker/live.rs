// =============================================================================
// Live Broker — HMAC-SHA256 signed REST adapter
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry the API key as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against the exchange.
//
// Error mapping is the adapter's main job: HTTP 429/418/5xx and transport
// failures become `transient`, exchange business refusals become typed
// rejections, and a duplicate `client_order_id` is resolved by fetching the
// existing order so duplicate creation stays idempotent.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::{rate_limit::RateLimitTracker, Broker, MarketSpec};
use crate::errors::{BrokerError, RejectReason};
use crate::settings::Credentials;
use crate::types::{
    now_ms, Balance, Candle, Order, OrderStatus, OrderType, Side, Symbol, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

/// recvWindow sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Signed REST adapter over a Binance-compatible spot API.
pub struct LiveBroker {
    credentials: Credentials,
    base_url: String,
    client: reqwest::Client,
    spec: MarketSpec,
    limits: RateLimitTracker,
    timeout_ms: i64,
}

impl LiveBroker {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(exchange: &str, credentials: Credentials, http_timeout_sec: u64) -> Result<Self> {
        let base_url = match exchange.to_ascii_lowercase().as_str() {
            "binance" => "https://api.binance.com".to_string(),
            other => anyhow::bail!("unsupported exchange '{other}'"),
        };

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&credentials.api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(http_timeout_sec))
            .build()
            .context("failed to build HTTP client")?;

        debug!(exchange, base_url = %base_url, "live broker initialised");

        Ok(Self {
            credentials,
            base_url,
            client,
            spec: MarketSpec::default(),
            limits: RateLimitTracker::new(),
            timeout_ms: (http_timeout_sec * 1000) as i64,
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport with error mapping
    // -------------------------------------------------------------------------

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        weight: u32,
    ) -> Result<serde_json::Value, BrokerError> {
        if !self.limits.can_send_request(weight) {
            return Err(BrokerError::Transient("rate-limit budget exhausted".to_string()));
        }

        let resp = self
            .client
            .request(method, url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BrokerError::Timeout(self.timeout_ms)
                } else {
                    BrokerError::Transient(format!("request failed: {e}"))
                }
            })?;

        self.limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Data(format!("unparseable response body: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        if status.as_u16() == 429 || status.as_u16() == 418 || status.is_server_error() {
            return Err(BrokerError::Transient(format!("HTTP {status}: {body}")));
        }

        Err(Self::map_business_error(&body, status.as_u16()))
    }

    /// Map an exchange error payload `{code, msg}` to a typed rejection.
    fn map_business_error(body: &serde_json::Value, http_status: u16) -> BrokerError {
        let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
        let msg = body
            .get("msg")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let lower = msg.to_ascii_lowercase();

        if lower.contains("duplicate") {
            // Handled by the order-creation path; surfaced distinctly here.
            return BrokerError::Data(format!("duplicate client order id: {msg}"));
        }
        if code == -1121 || lower.contains("invalid symbol") {
            return BrokerError::rejected(RejectReason::InvalidSymbol, msg);
        }
        if lower.contains("insufficient") {
            return BrokerError::rejected(RejectReason::InsufficientFunds, msg);
        }
        if lower.contains("notional") {
            return BrokerError::rejected(RejectReason::MinNotional, msg);
        }
        if code == -1013 || lower.contains("lot_size") || lower.contains("min_qty") {
            return BrokerError::rejected(RejectReason::MinAmount, msg);
        }
        BrokerError::Transient(format!("HTTP {http_status} code {code}: {msg}"))
    }

    // -------------------------------------------------------------------------
    // Parsing helpers
    // -------------------------------------------------------------------------

    fn parse_dec(value: &serde_json::Value) -> Result<Decimal, BrokerError> {
        let raw = if let Some(s) = value.as_str() {
            s.to_string()
        } else if value.is_number() {
            value.to_string()
        } else {
            return Err(BrokerError::Data(format!("expected decimal, got {value}")));
        };
        raw.parse::<Decimal>()
            .map_err(|e| BrokerError::Data(format!("bad decimal '{raw}': {e}")))
    }

    fn parse_status(raw: &str) -> OrderStatus {
        match raw {
            "FILLED" => OrderStatus::Closed,
            "CANCELED" | "REJECTED" | "EXPIRED" => OrderStatus::Canceled,
            _ => OrderStatus::Open,
        }
    }

    fn parse_order(&self, body: &serde_json::Value, symbol: &Symbol) -> Result<Order, BrokerError> {
        let id = body
            .get("orderId")
            .map(|v| v.to_string().trim_matches('"').to_string())
            .filter(|s| !s.is_empty() && s != "null")
            .ok_or_else(|| BrokerError::Data("order response missing orderId".to_string()))?;

        let client_order_id = body
            .get("clientOrderId")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let side = match body.get("side").and_then(|v| v.as_str()) {
            Some("BUY") => Side::Buy,
            Some("SELL") => Side::Sell,
            other => {
                return Err(BrokerError::Data(format!("order response bad side: {other:?}")))
            }
        };

        let order_type = match body.get("type").and_then(|v| v.as_str()) {
            Some("LIMIT") => OrderType::Limit,
            _ => OrderType::Market,
        };

        let filled = Self::parse_dec(body.get("executedQty").unwrap_or(&serde_json::Value::Null))
            .unwrap_or(Decimal::ZERO);
        let cost = Self::parse_dec(
            body.get("cummulativeQuoteQty").unwrap_or(&serde_json::Value::Null),
        )
        .unwrap_or(Decimal::ZERO);
        let amount = Self::parse_dec(body.get("origQty").unwrap_or(&serde_json::Value::Null))
            .unwrap_or(filled);

        // Average fill price when filled, order price otherwise.
        let price = if filled > Decimal::ZERO && cost > Decimal::ZERO {
            cost / filled
        } else {
            Self::parse_dec(body.get("price").unwrap_or(&serde_json::Value::Null))
                .unwrap_or(Decimal::ZERO)
        };

        // Quote-denominated commission from the fills array, when present.
        let mut fee_quote = Decimal::ZERO;
        if let Some(fills) = body.get("fills").and_then(|v| v.as_array()) {
            for fill in fills {
                let asset = fill.get("commissionAsset").and_then(|v| v.as_str()).unwrap_or("");
                if asset == symbol.quote() {
                    if let Ok(c) =
                        Self::parse_dec(fill.get("commission").unwrap_or(&serde_json::Value::Null))
                    {
                        fee_quote += c;
                    }
                }
            }
        }

        let status = Self::parse_status(
            body.get("status").and_then(|v| v.as_str()).unwrap_or("NEW"),
        );

        Ok(Order {
            id,
            client_order_id,
            symbol: symbol.clone(),
            side,
            order_type,
            amount,
            price,
            filled,
            cost,
            fee_quote,
            status,
            ts_ms: body
                .get("transactTime")
                .or_else(|| body.get("updateTime"))
                .or_else(|| body.get("time"))
                .and_then(|v| v.as_i64())
                .unwrap_or_else(now_ms),
        })
    }

    /// Fetch an order by its original client id (duplicate resolution path).
    async fn fetch_order_by_client_id(
        &self,
        symbol: &Symbol,
        client_order_id: &str,
    ) -> Result<Order, BrokerError> {
        let qs = self.signed_query(&format!(
            "symbol={}&origClientOrderId={client_order_id}",
            symbol.compact()
        ));
        let url = format!("{}/api/v3/order?{qs}", self.base_url);
        let body = self.send(reqwest::Method::GET, &url, 4).await?;
        self.parse_order(&body, symbol)
    }

    async fn submit_order(
        &self,
        symbol: &Symbol,
        params: String,
        client_order_id: &str,
    ) -> Result<Order, BrokerError> {
        if !self.limits.can_place_order() {
            return Err(BrokerError::Transient("order rate budget exhausted".to_string()));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{qs}", self.base_url);
        self.limits.record_order_sent();

        match self.send(reqwest::Method::POST, &url, 1).await {
            Ok(body) => self.parse_order(&body, symbol),
            // A duplicate client id means the order already exists — resolve
            // and return it so callers cannot tell the difference.
            Err(BrokerError::Data(msg)) if msg.contains("duplicate client order id") => {
                warn!(client_order_id, "duplicate client order id — resolving existing order");
                self.fetch_order_by_client_id(symbol, client_order_id).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Broker for LiveBroker {
    #[instrument(skip(self), name = "live::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, BrokerError> {
        let compact = symbol.compact();

        let book_url = format!("{}/api/v3/ticker/bookTicker?symbol={compact}", self.base_url);
        let book = self.send(reqwest::Method::GET, &book_url, 2).await?;

        let last_url = format!("{}/api/v3/ticker/price?symbol={compact}", self.base_url);
        let last = self.send(reqwest::Method::GET, &last_url, 2).await?;

        Ok(Ticker {
            symbol: symbol.clone(),
            last: Self::parse_dec(last.get("price").unwrap_or(&serde_json::Value::Null))?,
            bid: Self::parse_dec(book.get("bidPrice").unwrap_or(&serde_json::Value::Null))?,
            ask: Self::parse_dec(book.get("askPrice").unwrap_or(&serde_json::Value::Null))?,
            ts_ms: now_ms(),
        })
    }

    #[instrument(skip(self), name = "live::fetch_balance")]
    async fn fetch_balance(&self, symbol: &Symbol) -> Result<Balance, BrokerError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{qs}", self.base_url);
        let body = self.send(reqwest::Method::GET, &url, 20).await?;

        let balances = body
            .get("balances")
            .and_then(|v| v.as_array())
            .ok_or_else(|| BrokerError::Data("account response missing balances".to_string()))?;

        let mut out = Balance {
            free_base: Decimal::ZERO,
            free_quote: Decimal::ZERO,
        };
        for b in balances {
            let asset = b.get("asset").and_then(|v| v.as_str()).unwrap_or("");
            if asset == symbol.base() {
                out.free_base =
                    Self::parse_dec(b.get("free").unwrap_or(&serde_json::Value::Null))
                        .unwrap_or(Decimal::ZERO);
            } else if asset == symbol.quote() {
                out.free_quote =
                    Self::parse_dec(b.get("free").unwrap_or(&serde_json::Value::Null))
                        .unwrap_or(Decimal::ZERO);
            }
        }
        Ok(out)
    }

    #[instrument(skip(self), name = "live::fetch_order")]
    async fn fetch_order(
        &self,
        symbol: &Symbol,
        broker_order_id: &str,
    ) -> Result<Order, BrokerError> {
        let qs = self.signed_query(&format!(
            "symbol={}&orderId={broker_order_id}",
            symbol.compact()
        ));
        let url = format!("{}/api/v3/order?{qs}", self.base_url);
        let body = self.send(reqwest::Method::GET, &url, 4).await?;
        self.parse_order(&body, symbol)
    }

    #[instrument(skip(self), name = "live::fetch_open_orders")]
    async fn fetch_open_orders(&self, symbol: &Symbol) -> Result<Vec<Order>, BrokerError> {
        let qs = self.signed_query(&format!("symbol={}", symbol.compact()));
        let url = format!("{}/api/v3/openOrders?{qs}", self.base_url);
        let body = self.send(reqwest::Method::GET, &url, 6).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| BrokerError::Data("openOrders response is not an array".to_string()))?;
        raw.iter().map(|o| self.parse_order(o, symbol)).collect()
    }

    #[instrument(skip(self), name = "live::fetch_ohlcv")]
    async fn fetch_ohlcv(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Candle>, BrokerError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval=1m&limit={limit}",
            self.base_url,
            symbol.compact()
        );
        let body = self.send(reqwest::Method::GET, &url, 2).await?;
        let raw = body
            .as_array()
            .ok_or_else(|| BrokerError::Data("klines response is not an array".to_string()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            candles.push(Candle {
                ts_ms: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_dec(&arr[1])?,
                high: Self::parse_dec(&arr[2])?,
                low: Self::parse_dec(&arr[3])?,
                close: Self::parse_dec(&arr[4])?,
                volume: Self::parse_dec(&arr[5])?,
            });
        }
        debug!(%symbol, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    #[instrument(skip(self, quote_amount), name = "live::market_buy")]
    async fn create_market_buy_quote(
        &self,
        symbol: &Symbol,
        quote_amount: Decimal,
        client_order_id: &str,
    ) -> Result<Order, BrokerError> {
        if quote_amount < self.spec.min_notional {
            return Err(BrokerError::rejected(
                RejectReason::MinNotional,
                format!("quote amount {quote_amount} below minimum {}", self.spec.min_notional),
            ));
        }
        let params = format!(
            "symbol={}&side=BUY&type=MARKET&quoteOrderQty={}&newClientOrderId={client_order_id}",
            symbol.compact(),
            quote_amount.normalize()
        );
        self.submit_order(symbol, params, client_order_id).await
    }

    #[instrument(skip(self, base_amount), name = "live::market_sell")]
    async fn create_market_sell_base(
        &self,
        symbol: &Symbol,
        base_amount: Decimal,
        client_order_id: &str,
    ) -> Result<Order, BrokerError> {
        let quantity = self.spec.quantize_amount(base_amount);
        if quantity < self.spec.min_amount {
            return Err(BrokerError::rejected(
                RejectReason::MinAmount,
                format!("amount {quantity} below minimum {}", self.spec.min_amount),
            ));
        }
        let params = format!(
            "symbol={}&side=SELL&type=MARKET&quantity={}&newClientOrderId={client_order_id}",
            symbol.compact(),
            quantity.normalize()
        );
        self.submit_order(symbol, params, client_order_id).await
    }
}

impl std::fmt::Debug for LiveBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBroker")
            .field("base_url", &self.base_url)
            .field("credentials", &"<redacted>")
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
    use serde_json::json;

    fn broker() -> LiveBroker {
        LiveBroker::new(
            "binance",
            Credentials {
                api_key: "k".to_string(),
                api_secret: "s".to_string(),
                api_password: None,
            },
            10,
        )
        .unwrap()
    }

    #[test]
    fn unsupported_exchange_is_rejected() {
        let err = LiveBroker::new("krakenish", Credentials::default(), 10);
        assert!(err.is_err());
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let b = broker();
        let sig = b.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, b.sign("symbol=BTCUSDT&side=BUY"));
        assert_ne!(sig, b.sign("symbol=BTCUSDT&side=SELL"));
    }

    #[test]
    fn business_errors_map_to_typed_kinds() {
        let insufficient = LiveBroker::map_business_error(
            &json!({"code": -2010, "msg": "Account has insufficient balance"}),
            400,
        );
        assert!(matches!(
            insufficient,
            BrokerError::Rejected { reason: RejectReason::InsufficientFunds, .. }
        ));

        let notional = LiveBroker::map_business_error(
            &json!({"code": -1013, "msg": "Filter failure: NOTIONAL"}),
            400,
        );
        assert!(matches!(
            notional,
            BrokerError::Rejected { reason: RejectReason::MinNotional, .. }
        ));

        let lot = LiveBroker::map_business_error(
            &json!({"code": -1013, "msg": "Filter failure: LOT_SIZE"}),
            400,
        );
        assert!(matches!(
            lot,
            BrokerError::Rejected { reason: RejectReason::MinAmount, .. }
        ));

        let symbol = LiveBroker::map_business_error(
            &json!({"code": -1121, "msg": "Invalid symbol."}),
            400,
        );
        assert!(matches!(
            symbol,
            BrokerError::Rejected { reason: RejectReason::InvalidSymbol, .. }
        ));
    }

    #[test]
    fn parse_order_derives_average_fill_price_and_quote_fee() {
        let b = broker();
        let sym = Symbol::parse("BTC/USDT").unwrap();
        let body = json!({
            "orderId": 12345,
            "clientOrderId": "c-1",
            "side": "BUY",
            "type": "MARKET",
            "origQty": "0.002",
            "executedQty": "0.002",
            "cummulativeQuoteQty": "100.0",
            "status": "FILLED",
            "transactTime": 1700000000000i64,
            "fills": [
                {"commission": "0.05", "commissionAsset": "USDT"},
                {"commission": "0.000001", "commissionAsset": "BNB"},
                {"commission": "0.05", "commissionAsset": "USDT"}
            ]
        });
        let order = b.parse_order(&body, &sym).unwrap();
        assert_eq!(order.id, "12345");
        assert_eq!(order.client_order_id, "c-1");
        assert_eq!(order.price, dec!(50000));
        assert_eq!(order.fee_quote, dec!(0.1));
        assert_eq!(order.status, OrderStatus::Closed);
    }

    #[test]
    fn parse_order_statuses() {
        assert_eq!(LiveBroker::parse_status("FILLED"), OrderStatus::Closed);
        assert_eq!(LiveBroker::parse_status("CANCELED"), OrderStatus::Canceled);
        assert_eq!(LiveBroker::parse_status("NEW"), OrderStatus::Open);
        assert_eq!(LiveBroker::parse_status("PARTIALLY_FILLED"), OrderStatus::Open);
    }

    #[test]
    fn tiny_buy_rejected_before_any_wire_call() {
        let b = broker();
        let sym = Symbol::parse("BTC/USDT").unwrap();
        let fut = b.create_market_buy_quote(&sym, dec!(0.5), "c");
        let err = tokio::runtime::Runtime::new().unwrap().block_on(fut).unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Rejected { reason: RejectReason::MinNotional, .. }
        ));
    }
}
