// =============================================================================
// Health Checker — component probes feeding the watchdog and the admin surface
// =============================================================================

use std::sync::Arc;

use serde::Serialize;

use crate::errors::BrokerError;
use crate::events::EventBus;
use crate::market_data::MarketData;
use crate::storage::Storage;
use crate::types::Symbol;

/// Component-level health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub db_ok: bool,
    pub broker_ok: bool,
    pub bus_ok: bool,
    pub ok: bool,
}

/// Per-symbol slice of the health summary.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolHealth {
    pub symbol: String,
    pub running: bool,
    pub paused: bool,
    pub last_tick_ms: i64,
}

/// The shape external adapters consume.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub ok: bool,
    pub components: ComponentHealth,
    pub per_symbol: Vec<SymbolHealth>,
}

impl HealthSummary {
    pub fn new(components: ComponentHealth, per_symbol: Vec<SymbolHealth>) -> Self {
        Self {
            ok: components.ok,
            components,
            per_symbol,
        }
    }
}

pub struct HealthChecker {
    storage: Storage,
    market_data: Arc<MarketData>,
    bus: EventBus,
}

impl HealthChecker {
    pub fn new(storage: Storage, market_data: Arc<MarketData>, bus: EventBus) -> Self {
        Self {
            storage,
            market_data,
            bus,
        }
    }

    /// Probe the three components. A broker `data` error (no price yet)
    /// still counts as reachable; only transport-level failures mark the
    /// broker unhealthy.
    pub async fn check(&self, symbol: &Symbol) -> ComponentHealth {
        let db_ok = self.storage.ping();
        let broker_ok = match self.market_data.ticker(symbol).await {
            Ok(_) => true,
            Err(BrokerError::Data(_)) => true,
            Err(_) => false,
        };
        let bus_ok = self.bus.is_running();

        ComponentHealth {
            db_ok,
            broker_ok,
            bus_ok,
            ok: db_ok && broker_ok && bus_ok,
        }
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker").finish_non_exhaustive()
    }
}
