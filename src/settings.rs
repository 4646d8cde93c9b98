// =============================================================================
// Settings — immutable configuration snapshot loaded once at startup
// =============================================================================
//
// Every tunable is read from the environment exactly once; the resulting
// snapshot is shared immutably behind `Arc`. Seconds-based environment values
// are converted to milliseconds here, and nowhere else: repositories and loops
// only ever see `i64` milliseconds.
//
// Credentials may be supplied directly (`API_KEY`), from a file
// (`API_KEY_FILE`), or base64-encoded (`API_KEY_B64`). They are never logged;
// the Debug impl redacts them.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::{BrokerMode, Symbol};

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Protective-exit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitMode {
    Hard,
    Trailing,
    Both,
    Off,
}

impl FromStr for ExitMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hard" => Ok(Self::Hard),
            "trailing" => Ok(Self::Trailing),
            "both" => Ok(Self::Both),
            "off" => Ok(Self::Off),
            other => Err(format!("unknown exit mode '{other}'")),
        }
    }
}

/// What the dead-man's-switch does when evaluation stalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DmsAction {
    Close,
    Alert,
}

impl FromStr for DmsAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "close" => Ok(Self::Close),
            "alert" => Ok(Self::Alert),
            other => Err(format!("unknown DMS action '{other}'")),
        }
    }
}

/// Risk pipeline limits. All `*_pct` values are fractions (0.005 = 0.5 %).
/// A zero limit disables the corresponding rule.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSettings {
    pub max_drift_ms: i64,
    /// Optional UTC trading window `[start_hour, end_hour)`; `None` = always.
    pub trading_hours_utc: Option<(u32, u32)>,
    pub cooldown_sec: i64,
    pub max_spread_pct: Decimal,
    pub max_position_base: Decimal,
    pub max_orders_per_hour: u32,
    pub max_turnover_5m_quote: Decimal,
    pub max_loss_streak: u32,
    pub max_drawdown_pct: Decimal,
    pub daily_loss_limit_quote: Decimal,
    /// Correlation groups: each inner vec is a group of symbols that should
    /// not hold open positions simultaneously.
    pub correlation_groups: Vec<Vec<Symbol>>,
}

/// Protective-exit parameters. All `*_pct` values are fractions.
#[derive(Debug, Clone, Serialize)]
pub struct ExitSettings {
    pub mode: ExitMode,
    pub stop_pct: Decimal,
    pub take_pct: Decimal,
    pub trailing_pct: Decimal,
    pub min_base_to_exit: Decimal,
}

/// SLA thresholds driving watchdog auto-pause / auto-resume.
#[derive(Debug, Clone, Serialize)]
pub struct SlaSettings {
    pub pause_error_rate_5m: f64,
    pub resume_error_rate_5m: f64,
    pub pause_latency_ms_5m: f64,
    pub resume_latency_ms_5m: f64,
}

/// Exchange API credentials. Redacted in Debug output.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("api_password", &self.api_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Top-level immutable engine configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: BrokerMode,
    pub exchange: String,
    pub symbols: Vec<Symbol>,
    /// Quote amount spent per strategy buy.
    pub fixed_amount: Decimal,

    pub eval_interval_sec: f64,
    pub exits_interval_sec: f64,
    pub reconcile_interval_sec: f64,
    pub watchdog_interval_sec: f64,

    pub dms_timeout_ms: i64,
    pub dms_action: DmsAction,

    pub idempotency_bucket_ms: i64,
    pub idempotency_ttl_ms: i64,

    pub http_timeout_sec: u64,
    pub bus_capacity: usize,
    /// Base-balance divergence tolerated before a position mismatch event.
    pub reconcile_epsilon_base: Decimal,
    pub db_path: String,

    pub risk: RiskSettings,
    pub exits: ExitSettings,
    pub sla: SlaSettings,
    pub credentials: Credentials,
}

impl Settings {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    /// Load from an explicit map (test injection point).
    pub fn from_map(env: &HashMap<String, String>) -> Result<Self> {
        let r = Reader { env };

        let mode: BrokerMode = r
            .get("MODE", "paper")
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        let symbols = r
            .get_list("SYMBOLS", "BTC/USDT")
            .iter()
            .map(|s| Symbol::parse_loose(s).map_err(|e| anyhow::anyhow!(e)))
            .collect::<Result<Vec<_>>>()
            .context("invalid SYMBOLS")?;

        // The TTL is configured in seconds, storage works in milliseconds.
        // Setting both spellings is ambiguous and refused outright.
        if env.contains_key("IDEMPOTENCY_TTL_SEC") && env.contains_key("IDEMPOTENCY_TTL_MS") {
            bail!("both IDEMPOTENCY_TTL_SEC and IDEMPOTENCY_TTL_MS are set; pick one");
        }
        let idempotency_ttl_ms = match env.get("IDEMPOTENCY_TTL_MS") {
            Some(raw) => raw.parse::<i64>().context("invalid IDEMPOTENCY_TTL_MS")?,
            None => r.get_i64("IDEMPOTENCY_TTL_SEC", 300)? * 1000,
        };

        let trading_hours_utc = match (env.get("RISK_HOURS_START_UTC"), env.get("RISK_HOURS_END_UTC")) {
            (Some(start), Some(end)) => Some((
                start.parse::<u32>().context("invalid RISK_HOURS_START_UTC")?,
                end.parse::<u32>().context("invalid RISK_HOURS_END_UTC")?,
            )),
            (None, None) => None,
            _ => bail!("RISK_HOURS_START_UTC and RISK_HOURS_END_UTC must be set together"),
        };

        let correlation_groups = r
            .get("RISK_CORRELATION_GROUPS", "")
            .split(';')
            .filter(|g| !g.trim().is_empty())
            .map(|group| {
                group
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| Symbol::parse_loose(s).map_err(|e| anyhow::anyhow!(e)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()
            .context("invalid RISK_CORRELATION_GROUPS")?;

        let settings = Self {
            mode,
            exchange: r.get("EXCHANGE", "binance"),
            symbols,
            fixed_amount: r.get_dec("FIXED_AMOUNT", "50")?,

            eval_interval_sec: r.get_f64("EVAL_INTERVAL_SEC", 5.0)?,
            exits_interval_sec: r.get_f64("EXITS_INTERVAL_SEC", 5.0)?,
            reconcile_interval_sec: r.get_f64("RECONCILE_INTERVAL_SEC", 60.0)?,
            watchdog_interval_sec: r.get_f64("WATCHDOG_INTERVAL_SEC", 15.0)?,

            dms_timeout_ms: r.get_i64("DMS_TIMEOUT_MS", 120_000)?,
            dms_action: r
                .get("DMS_ACTION", "alert")
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?,

            idempotency_bucket_ms: r.get_i64("IDEMPOTENCY_BUCKET_MS", 60_000)?,
            idempotency_ttl_ms,

            http_timeout_sec: r.get_i64("HTTP_TIMEOUT_SEC", 10)? as u64,
            bus_capacity: r.get_i64("EVENT_BUS_CAPACITY", 1024)? as usize,
            reconcile_epsilon_base: r.get_dec("RECONCILE_EPSILON_BASE", "0.00001")?,
            db_path: r.get("DB_PATH", "borealis.db"),

            risk: RiskSettings {
                max_drift_ms: r.get_i64("RISK_MAX_DRIFT_MS", 5_000)?,
                trading_hours_utc,
                cooldown_sec: r.get_i64("RISK_COOLDOWN_SEC", 60)?,
                max_spread_pct: r.get_dec("RISK_MAX_SPREAD_PCT", "0.005")?,
                max_position_base: r.get_dec("RISK_MAX_POSITION_BASE", "0")?,
                max_orders_per_hour: r.get_i64("RISK_MAX_ORDERS_PER_HOUR", 0)? as u32,
                max_turnover_5m_quote: r.get_dec("RISK_MAX_TURNOVER_5M_QUOTE", "0")?,
                max_loss_streak: r.get_i64("RISK_MAX_LOSS_STREAK", 0)? as u32,
                max_drawdown_pct: r.get_dec("RISK_MAX_DRAWDOWN_PCT", "0")?,
                daily_loss_limit_quote: r.get_dec("RISK_DAILY_LOSS_LIMIT_QUOTE", "0")?,
                correlation_groups,
            },

            exits: ExitSettings {
                mode: r
                    .get("EXITS_MODE", "both")
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?,
                stop_pct: r.get_dec("EXITS_STOP_PCT", "0.05")?,
                take_pct: r.get_dec("EXITS_TAKE_PCT", "0")?,
                trailing_pct: r.get_dec("EXITS_TRAILING_PCT", "0.03")?,
                min_base_to_exit: r.get_dec("EXITS_MIN_BASE", "0")?,
            },

            sla: SlaSettings {
                pause_error_rate_5m: r.get_f64("AUTO_PAUSE_ERROR_RATE_5M", 0.50)?,
                resume_error_rate_5m: r.get_f64("AUTO_RESUME_ERROR_RATE_5M", 0.20)?,
                pause_latency_ms_5m: r.get_f64("AUTO_PAUSE_LATENCY_MS_5M", 2_000.0)?,
                resume_latency_ms_5m: r.get_f64("AUTO_RESUME_LATENCY_MS_5M", 1_000.0)?,
            },

            credentials: Credentials {
                api_key: r.get_secret("API_KEY")?,
                api_secret: r.get_secret("API_SECRET")?,
                api_password: {
                    let p = r.get_secret("API_PASSWORD")?;
                    (!p.is_empty()).then_some(p)
                },
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations the engine cannot run safely with.
    fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("SYMBOLS must list at least one trading pair");
        }
        if self.fixed_amount <= Decimal::ZERO {
            bail!("FIXED_AMOUNT must be positive");
        }
        for (name, v) in [
            ("EVAL_INTERVAL_SEC", self.eval_interval_sec),
            ("EXITS_INTERVAL_SEC", self.exits_interval_sec),
            ("RECONCILE_INTERVAL_SEC", self.reconcile_interval_sec),
            ("WATCHDOG_INTERVAL_SEC", self.watchdog_interval_sec),
        ] {
            if v <= 0.0 {
                bail!("{name} must be positive");
            }
        }
        if self.idempotency_bucket_ms <= 0 {
            bail!("IDEMPOTENCY_BUCKET_MS must be positive");
        }
        if self.idempotency_ttl_ms <= 0 {
            bail!("idempotency TTL must be positive");
        }
        if let Some((start, end)) = self.risk.trading_hours_utc {
            if start > 23 || end > 24 || start >= end {
                bail!("trading hours window [{start}, {end}) is not a valid UTC range");
            }
        }
        if self.mode == BrokerMode::Live
            && (self.credentials.api_key.is_empty() || self.credentials.api_secret.is_empty())
        {
            bail!("live mode requires API_KEY and API_SECRET");
        }
        if self.sla.resume_error_rate_5m > self.sla.pause_error_rate_5m {
            bail!("AUTO_RESUME_ERROR_RATE_5M must not exceed AUTO_PAUSE_ERROR_RATE_5M");
        }
        if self.sla.resume_latency_ms_5m > self.sla.pause_latency_ms_5m {
            bail!("AUTO_RESUME_LATENCY_MS_5M must not exceed AUTO_PAUSE_LATENCY_MS_5M");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Env reading helpers
// ---------------------------------------------------------------------------

struct Reader<'a> {
    env: &'a HashMap<String, String>,
}

impl Reader<'_> {
    fn get(&self, key: &str, default: &str) -> String {
        self.env
            .get(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn get_i64(&self, key: &str, default: i64) -> Result<i64> {
        match self.env.get(key).map(|s| s.trim()).filter(|s| !s.is_empty()) {
            Some(raw) => raw.parse().with_context(|| format!("invalid {key}: '{raw}'")),
            None => Ok(default),
        }
    }

    fn get_f64(&self, key: &str, default: f64) -> Result<f64> {
        match self.env.get(key).map(|s| s.trim()).filter(|s| !s.is_empty()) {
            Some(raw) => raw.parse().with_context(|| format!("invalid {key}: '{raw}'")),
            None => Ok(default),
        }
    }

    fn get_dec(&self, key: &str, default: &str) -> Result<Decimal> {
        let raw = self.get(key, default);
        Decimal::from_str(&raw).with_context(|| format!("invalid {key}: '{raw}'"))
    }

    fn get_list(&self, key: &str, default: &str) -> Vec<String> {
        self.get(key, default)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Secret with file / base64 indirection: `{key}` wins, then
    /// `{key}_FILE`, then `{key}_B64`. Missing everywhere = empty string.
    fn get_secret(&self, key: &str) -> Result<String> {
        if let Some(v) = self.env.get(key).filter(|s| !s.is_empty()) {
            return Ok(v.clone());
        }
        if let Some(path) = self.env.get(&format!("{key}_FILE")).filter(|s| !s.is_empty()) {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {key}_FILE at {path}"))?;
            return Ok(content.trim().to_string());
        }
        if let Some(b64) = self.env.get(&format!("{key}_B64")).filter(|s| !s.is_empty()) {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64.trim())
                .with_context(|| format!("{key}_B64 is not valid base64"))?;
            return Ok(String::from_utf8(bytes)
                .with_context(|| format!("{key}_B64 does not decode to UTF-8"))?
                .trim()
                .to_string());
        }
        Ok(String::new())
    }
}
