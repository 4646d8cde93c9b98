// =============================================================================
// Orchestrator — four cooperative loops and lifecycle, one instance per symbol
// =============================================================================
//
// Loops: Eval, Exits, Reconcile, Watchdog. Each is (interval, pause gate,
// single-flight guard, work fn). Pause suppresses Eval and Exits work (the
// loops keep ticking and sleeping); Reconcile and Watchdog always run. A loop
// iteration that fails logs, bumps a counter, and sleeps — it never kills the
// loop.
//
// The orchestrator holds no business logic: sequencing and lifecycle only.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::errors::EngineError;
use crate::events::{topics, EventBus};
use crate::execution::{ExecuteRequest, ExecutionEngine};
use crate::exits::ExitsWorker;
use crate::idempotency::KeySource;
use crate::market_data::MarketData;
use crate::metrics::Metrics;
use crate::reconcile::Reconciler;
use crate::settings::Settings;
use crate::storage::Storage;
use crate::strategy::{StrategyCtx, StrategyManager};
use crate::types::{now_ms, Action, Side, Symbol};
use crate::watchdog::{DmsFuse, Heartbeat, Watchdog};

// ---------------------------------------------------------------------------
// Pause control
// ---------------------------------------------------------------------------

/// Shared pause flag for one symbol. Auto-pauses (SLA) may be auto-resumed by
/// the watchdog; manual/integrity pauses only clear on operator resume.
pub struct PauseControl {
    paused: AtomicBool,
    auto: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl PauseControl {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            auto: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub fn pause_auto(&self, reason: &str) {
        self.paused.store(true, Ordering::SeqCst);
        self.auto.store(true, Ordering::SeqCst);
        *self.reason.lock() = Some(reason.to_string());
    }

    pub fn pause_manual(&self, reason: &str) {
        self.paused.store(true, Ordering::SeqCst);
        self.auto.store(false, Ordering::SeqCst);
        *self.reason.lock() = Some(reason.to_string());
    }

    /// Watchdog path: clears only SLA-initiated pauses.
    pub fn resume_auto(&self) {
        if self.auto.swap(false, Ordering::SeqCst) {
            self.paused.store(false, Ordering::SeqCst);
            *self.reason.lock() = None;
        }
    }

    /// Operator path: clears any pause.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.auto.store(false, Ordering::SeqCst);
        *self.reason.lock() = None;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_auto_paused(&self) -> bool {
        self.is_paused() && self.auto.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

impl Default for PauseControl {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Evaluation worker
// ---------------------------------------------------------------------------

/// The work function behind the Eval loop: market snapshot -> strategy ->
/// execute-trade. Heartbeats after every successful iteration (the DMS input).
pub struct EvalWorker {
    pub settings: Arc<Settings>,
    pub storage: Storage,
    pub strategies: Arc<StrategyManager>,
    pub execution: Arc<ExecutionEngine>,
    pub market_data: Arc<MarketData>,
    pub metrics: Arc<Metrics>,
    pub bus: EventBus,
}

impl EvalWorker {
    pub async fn tick(
        &self,
        symbol: &Symbol,
        heartbeat: &Heartbeat,
        pause: &PauseControl,
    ) -> anyhow::Result<()> {
        let started = Instant::now();

        let ticker = match self.market_data.ticker(symbol).await {
            Ok(t) => t,
            Err(e) => {
                // A data gap is a hold, not a failure.
                debug!(%symbol, error = %e, "eval tick: no market data");
                heartbeat.beat();
                return Ok(());
            }
        };
        let candles = self.market_data.candles(symbol).await.unwrap_or_default();

        let ctx = StrategyCtx {
            symbol: symbol.clone(),
            ticker,
            candles,
            context: serde_json::Value::Null,
        };
        let decision = self.strategies.generate(&self.settings, &ctx);
        debug!(%symbol, action = %decision.action, score = %decision.score, "strategy decision");

        let (side, amount) = match decision.action {
            Action::Hold => {
                heartbeat.beat();
                self.metrics
                    .observe_call(true, started.elapsed().as_millis() as f64);
                return Ok(());
            }
            Action::Buy => (Side::Buy, self.settings.fixed_amount),
            Action::Sell => {
                let position = self.storage.positions().get(symbol)?;
                if !position.is_open() {
                    heartbeat.beat();
                    return Ok(());
                }
                (Side::Sell, position.base_qty)
            }
        };

        let result = self
            .execution
            .execute(ExecuteRequest {
                symbol: symbol.clone(),
                side,
                amount,
                source: KeySource::Order,
            })
            .await;

        match result {
            Ok(outcome) => {
                debug!(%symbol, executed = outcome.executed, reason = %outcome.reason, "eval tick done");
                heartbeat.beat();
                self.metrics
                    .observe_call(true, started.elapsed().as_millis() as f64);
                Ok(())
            }
            Err(EngineError::Integrity(msg)) => {
                // Invariant violations park the symbol until operator resume.
                error!(%symbol, error = %msg, "integrity violation — pausing evaluation");
                pause.pause_manual("integrity");
                let key_hint = symbol.to_string();
                self.bus
                    .publish(
                        topics::RISK_BLOCKED,
                        json!({ "symbol": key_hint, "reason": "integrity", "details": msg }),
                        Some(&key_hint),
                    )
                    .await;
                self.storage
                    .audit()
                    .append("integrity_pause", &json!({ "symbol": key_hint, "error": msg }))?;
                self.metrics
                    .observe_call(false, started.elapsed().as_millis() as f64);
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .observe_call(false, started.elapsed().as_millis() as f64);
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loop bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LoopKind {
    Eval,
    Exits,
    Reconcile,
    Watchdog,
}

impl LoopKind {
    const ALL: [LoopKind; 4] = [Self::Eval, Self::Exits, Self::Reconcile, Self::Watchdog];

    fn name(&self) -> &'static str {
        match self {
            Self::Eval => "eval",
            Self::Exits => "exits",
            Self::Reconcile => "reconcile",
            Self::Watchdog => "watchdog",
        }
    }

    /// Pause suppresses Eval and Exits only; Reconcile and Watchdog continue.
    fn pausable(&self) -> bool {
        matches!(self, Self::Eval | Self::Exits)
    }
}

/// Externally visible state of one loop.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LoopStatus {
    pub running: bool,
    pub last_tick_ms: i64,
    pub ticks: u64,
    pub skipped: u64,
    pub last_error: Option<String>,
}

/// Externally visible state of one symbol's orchestrator.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub loops: HashMap<&'static str, LoopStatus>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    symbol: Symbol,
    settings: Arc<Settings>,
    pub pause: Arc<PauseControl>,
    pub heartbeat: Arc<Heartbeat>,
    dms: Arc<DmsFuse>,

    eval: Arc<EvalWorker>,
    exits_worker: Arc<ExitsWorker>,
    reconciler: Arc<Reconciler>,
    watchdog: Arc<Watchdog>,
    metrics: Arc<Metrics>,

    stop_tx: tokio::sync::watch::Sender<bool>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    statuses: Arc<Mutex<HashMap<&'static str, LoopStatus>>>,
    flights: HashMap<&'static str, Arc<tokio::sync::Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        symbol: Symbol,
        settings: Arc<Settings>,
        eval: Arc<EvalWorker>,
        exits_worker: Arc<ExitsWorker>,
        reconciler: Arc<Reconciler>,
        watchdog: Arc<Watchdog>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (stop_tx, _) = tokio::sync::watch::channel(false);
        let mut statuses = HashMap::new();
        let mut flights = HashMap::new();
        for kind in LoopKind::ALL {
            statuses.insert(kind.name(), LoopStatus::default());
            flights.insert(kind.name(), Arc::new(tokio::sync::Mutex::new(())));
        }
        Arc::new(Self {
            symbol,
            settings,
            pause: Arc::new(PauseControl::new()),
            heartbeat: Arc::new(Heartbeat::new()),
            dms: Arc::new(DmsFuse::new()),
            eval,
            exits_worker,
            reconciler,
            watchdog,
            metrics,
            stop_tx,
            handles: Mutex::new(Vec::new()),
            statuses: Arc::new(Mutex::new(statuses)),
            flights,
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the four loops. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        for kind in LoopKind::ALL {
            handles.push(self.spawn_loop(kind));
        }
        info!(symbol = %self.symbol, "orchestrator started (4 loops)");
    }

    /// Cancel all loops and wait up to `grace` for in-flight work, then
    /// abandon.
    pub async fn stop(&self, grace: Duration) {
        let _ = self.stop_tx.send(true);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let deadline = Instant::now() + grace;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let abort = handle.abort_handle();
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!(symbol = %self.symbol, "loop missed the stop deadline — aborting");
                abort.abort();
            }
        }
        info!(symbol = %self.symbol, "orchestrator stopped");
    }

    pub fn pause(&self, reason: &str) {
        self.pause.pause_manual(reason);
        info!(symbol = %self.symbol, reason, "orchestrator paused");
    }

    pub fn resume(&self) {
        self.pause.resume();
        info!(symbol = %self.symbol, "orchestrator resumed");
    }

    pub fn status(&self) -> SymbolStatus {
        SymbolStatus {
            symbol: self.symbol.to_string(),
            paused: self.pause.is_paused(),
            pause_reason: self.pause.reason(),
            loops: self.statuses.lock().clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Loop machinery
    // -------------------------------------------------------------------------

    fn interval_of(&self, kind: LoopKind) -> Duration {
        let secs = match kind {
            LoopKind::Eval => self.settings.eval_interval_sec,
            LoopKind::Exits => self.settings.exits_interval_sec,
            LoopKind::Reconcile => self.settings.reconcile_interval_sec,
            LoopKind::Watchdog => self.settings.watchdog_interval_sec,
        };
        Duration::from_secs_f64(secs.max(0.01))
    }

    fn spawn_loop(self: &Arc<Self>, kind: LoopKind) -> tokio::task::JoinHandle<()> {
        let orch = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orch.interval_of(kind));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            orch.with_status(kind, |s| s.running = true);
            debug!(symbol = %orch.symbol, loop_name = kind.name(), "loop started");

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = ticker.tick() => {}
                }
                if *stop_rx.borrow() {
                    break;
                }

                if kind.pausable() && orch.pause.is_paused() {
                    orch.with_status(kind, |s| {
                        s.last_tick_ms = now_ms();
                        s.ticks += 1;
                    });
                    continue;
                }

                // Single-flight: a late previous iteration means this tick is
                // skipped and counted, never queued.
                let flight = orch.flights[kind.name()].clone();
                let Ok(_in_flight) = flight.try_lock() else {
                    orch.with_status(kind, |s| s.skipped += 1);
                    orch.metrics
                        .inc_labeled("loop_ticks_skipped_total", "loop", kind.name());
                    continue;
                };

                let result = orch.run_work(kind).await;
                orch.with_status(kind, |s| {
                    s.last_tick_ms = now_ms();
                    s.ticks += 1;
                    s.last_error = result.as_ref().err().map(|e| e.to_string());
                });
                if let Err(e) = result {
                    // Iteration failures never kill the loop.
                    error!(
                        symbol = %orch.symbol,
                        loop_name = kind.name(),
                        error = %e,
                        "loop iteration failed"
                    );
                    orch.metrics
                        .inc_labeled("loop_errors_total", "loop", kind.name());
                }
            }

            orch.with_status(kind, |s| s.running = false);
            debug!(symbol = %orch.symbol, loop_name = kind.name(), "loop stopped");
        })
    }

    async fn run_work(&self, kind: LoopKind) -> anyhow::Result<()> {
        match kind {
            LoopKind::Eval => {
                self.eval
                    .tick(&self.symbol, &self.heartbeat, &self.pause)
                    .await
            }
            LoopKind::Exits => self.exits_worker.tick(&self.symbol).await,
            LoopKind::Reconcile => self.reconciler.run_once(&self.symbol).await.map(|_| ()),
            LoopKind::Watchdog => {
                self.watchdog
                    .tick(&self.symbol, &self.pause, &self.heartbeat, &self.dms)
                    .await
            }
        }
    }

    fn with_status(&self, kind: LoopKind, f: impl FnOnce(&mut LoopStatus)) {
        let mut statuses = self.statuses.lock();
        if let Some(status) = statuses.get_mut(kind.name()) {
            f(status);
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("symbol", &self.symbol.to_string())
            .field("paused", &self.pause.is_paused())
            .finish()
    }
}
