// =============================================================================
// Borealis Spot Engine — Main Entry Point
// =============================================================================
//
// Startup order matters for the exit codes:
//   2  configuration invalid
//   1  instance lock held by another process
//   3  fatal startup error (database open, broker construction)
//   0  normal shutdown
//
// One orchestrator per symbol; every symbol gets the same shared subsystem
// wiring (storage, bus, broker, execution) and its own pause/heartbeat state.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod broker;
mod errors;
mod events;
mod execution;
mod exits;
mod health;
mod idempotency;
mod market_data;
mod metrics;
mod orchestrator;
mod reconcile;
mod risk;
mod settings;
mod storage;
mod strategy;
mod types;
mod watchdog;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{build_broker, MarketSpec};
use crate::events::EventBus;
use crate::execution::ExecutionEngine;
use crate::exits::{ExitManager, ExitsWorker};
use crate::health::{HealthChecker, HealthSummary, SymbolHealth};
use crate::market_data::MarketData;
use crate::metrics::Metrics;
use crate::orchestrator::{EvalWorker, Orchestrator};
use crate::reconcile::Reconciler;
use crate::risk::RiskManager;
use crate::settings::Settings;
use crate::storage::Storage;
use crate::strategy::StrategyManager;
use crate::watchdog::Watchdog;

/// Market-data cache TTL.
const MARKET_DATA_TTL_MS: i64 = 2_000;
/// Grace period for loop shutdown per symbol.
const STOP_GRACE: Duration = Duration::from_secs(10);
/// Grace period for the event bus drain.
const BUS_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Spot Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let settings = match Settings::from_env() {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "configuration invalid");
            std::process::exit(2);
        }
    };
    info!(
        mode = %settings.mode,
        exchange = %settings.exchange,
        symbols = ?settings.symbols.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        "configuration loaded"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let storage = match Storage::open(&settings.db_path) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "database open failed");
            std::process::exit(3);
        }
    };

    // ── 3. Instance lock ─────────────────────────────────────────────────
    let owner = uuid::Uuid::new_v4().to_string();
    let lock_ttl_ms = ((settings.watchdog_interval_sec * 4.0 * 1000.0) as i64).max(60_000);
    let lock = Arc::new(storage.instance_lock("borealis", &owner));
    match lock.acquire(lock_ttl_ms) {
        Ok(true) => {}
        Ok(false) => {
            error!("another engine instance already manages this store");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "instance lock acquisition failed");
            std::process::exit(3);
        }
    }

    // ── 4. Shared subsystems ─────────────────────────────────────────────
    let metrics = Arc::new(Metrics::new());
    let bus = EventBus::new(settings.bus_capacity, metrics.clone());
    bus.start();

    let broker = match build_broker(&settings) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "broker construction failed");
            std::process::exit(3);
        }
    };
    let market_data = Arc::new(MarketData::new(broker.clone(), MARKET_DATA_TTL_MS));
    let exits = Arc::new(ExitManager::new(settings.exits.clone()));

    let execution = Arc::new(ExecutionEngine::new(
        settings.clone(),
        storage.clone(),
        broker.clone(),
        market_data.clone(),
        bus.clone(),
        Arc::new(RiskManager::standard()),
        exits.clone(),
        metrics.clone(),
    ));

    let eval = Arc::new(EvalWorker {
        settings: settings.clone(),
        storage: storage.clone(),
        strategies: Arc::new(StrategyManager::standard()),
        execution: execution.clone(),
        market_data: market_data.clone(),
        metrics: metrics.clone(),
        bus: bus.clone(),
    });

    let exits_worker = Arc::new(ExitsWorker {
        exits: exits.clone(),
        execution: execution.clone(),
        market_data: market_data.clone(),
        storage: storage.clone(),
        bus: bus.clone(),
        market_spec: MarketSpec::default(),
        min_base_to_exit: settings.exits.min_base_to_exit,
    });

    let reconciler = Arc::new(Reconciler {
        settings: settings.clone(),
        storage: storage.clone(),
        broker: broker.clone(),
        market_data: market_data.clone(),
        bus: bus.clone(),
        metrics: metrics.clone(),
    });

    let health = Arc::new(HealthChecker::new(
        storage.clone(),
        market_data.clone(),
        bus.clone(),
    ));
    let watchdog = Arc::new(Watchdog {
        settings: settings.clone(),
        storage: storage.clone(),
        bus: bus.clone(),
        metrics: metrics.clone(),
        health: health.clone(),
        execution: execution.clone(),
        lock: lock.clone(),
        lock_ttl_ms,
    });

    // ── 5. Per-symbol orchestrators ──────────────────────────────────────
    let mut orchestrators = Vec::with_capacity(settings.symbols.len());
    for symbol in &settings.symbols {
        let orch = Orchestrator::new(
            symbol.clone(),
            settings.clone(),
            eval.clone(),
            exits_worker.clone(),
            reconciler.clone(),
            watchdog.clone(),
            metrics.clone(),
        );
        orch.start();
        orchestrators.push(orch);
    }
    info!(count = orchestrators.len(), "all symbol orchestrators running — press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    warn!("shutdown signal received — stopping gracefully");

    // Final health snapshot for the log, then tear everything down.
    let components = health.check(&settings.symbols[0]).await;
    let summary = HealthSummary::new(
        components,
        orchestrators
            .iter()
            .map(|o| {
                let s = o.status();
                SymbolHealth {
                    symbol: s.symbol,
                    running: s.loops.values().any(|l| l.running),
                    paused: s.paused,
                    last_tick_ms: s.loops.values().map(|l| l.last_tick_ms).max().unwrap_or(0),
                }
            })
            .collect(),
    );
    info!(ok = summary.ok, "final health summary");

    for orch in &orchestrators {
        orch.stop(STOP_GRACE).await;
    }
    bus.stop(BUS_DRAIN_GRACE).await;
    if let Err(e) = lock.release() {
        warn!(error = %e, "instance lock release failed");
    }

    info!("Borealis Spot Engine shut down complete.");
}
