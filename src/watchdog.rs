// =============================================================================
// Watchdog & Dead-Man's-Switch — heartbeat, SLA auto-pause, stall protection
// =============================================================================
//
// Each tick: probe component health, publish the heartbeat, renew the
// instance lock, check the DMS, and drive the SLA pause/resume decision from
// the rolling 5-minute error-rate and latency windows.
//
// DMS: the evaluation loop stamps `Heartbeat` after every successful
// iteration. Once `now - last_beat` exceeds the timeout, the configured
// action fires exactly once per stall — the fuse remembers which beat it
// fired for and re-arms only after evaluation resumes.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, warn};

use crate::events::{topics, EventBus};
use crate::execution::{ExecuteRequest, ExecutionEngine};
use crate::health::HealthChecker;
use crate::idempotency::KeySource;
use crate::metrics::Metrics;
use crate::orchestrator::PauseControl;
use crate::risk::pnl;
use crate::settings::{DmsAction, Settings};
use crate::storage::{InstanceLock, Storage};
use crate::types::{now_ms, Side, Symbol};

// ---------------------------------------------------------------------------
// Heartbeat + DMS fuse
// ---------------------------------------------------------------------------

/// Timestamp of the evaluation loop's last successful iteration.
pub struct Heartbeat {
    last: AtomicI64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(now_ms()),
        }
    }

    pub fn beat(&self) {
        self.last.store(now_ms(), Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.last.load(Ordering::Relaxed)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot-per-stall trigger memory.
pub struct DmsFuse {
    fired_at_beat: AtomicI64,
}

impl DmsFuse {
    pub fn new() -> Self {
        Self {
            fired_at_beat: AtomicI64::new(i64::MIN),
        }
    }

    /// True exactly once per distinct stalled beat value.
    pub fn should_fire(&self, beat: i64) -> bool {
        if self.fired_at_beat.load(Ordering::Relaxed) == beat {
            return false;
        }
        self.fired_at_beat.store(beat, Ordering::Relaxed);
        true
    }
}

impl Default for DmsFuse {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

pub struct Watchdog {
    pub settings: Arc<Settings>,
    pub storage: Storage,
    pub bus: EventBus,
    pub metrics: Arc<Metrics>,
    pub health: Arc<HealthChecker>,
    pub execution: Arc<ExecutionEngine>,
    pub lock: Arc<InstanceLock>,
    pub lock_ttl_ms: i64,
}

impl Watchdog {
    /// One watchdog tick for `symbol`.
    pub async fn tick(
        &self,
        symbol: &Symbol,
        pause: &PauseControl,
        heartbeat: &Heartbeat,
        dms: &DmsFuse,
    ) -> anyhow::Result<()> {
        // ------------------------------------------------------------------
        // Health + heartbeat
        // ------------------------------------------------------------------
        let health = self.health.check(symbol).await;
        let key_hint = symbol.to_string();
        self.bus
            .publish(
                topics::WATCHDOG_HEARTBEAT,
                json!({ "ok": health.ok, "symbol": key_hint, "ts_ms": now_ms() }),
                Some(&key_hint),
            )
            .await;
        self.bus
            .publish(
                topics::HEALTH_REPORT,
                json!({
                    "symbol": key_hint,
                    "db_ok": health.db_ok,
                    "broker_ok": health.broker_ok,
                    "bus_ok": health.bus_ok,
                }),
                Some(&key_hint),
            )
            .await;

        // ------------------------------------------------------------------
        // Instance lock renewal
        // ------------------------------------------------------------------
        match self.lock.renew(self.lock_ttl_ms) {
            Ok(true) => {}
            Ok(false) => {
                warn!("instance lock lost — another process may own the store");
                self.metrics.inc("instance_lock_lost_total");
            }
            Err(e) => {
                warn!(error = %e, "instance lock renewal failed");
                self.metrics.inc("instance_lock_renew_errors_total");
            }
        }

        // ------------------------------------------------------------------
        // Dead-man's-switch
        // ------------------------------------------------------------------
        let beat = heartbeat.value();
        let stalled_ms = now_ms() - beat;
        if stalled_ms > self.settings.dms_timeout_ms && dms.should_fire(beat) {
            self.fire_dms(symbol, stalled_ms).await?;
        }

        // ------------------------------------------------------------------
        // SLA auto-pause / auto-resume
        // ------------------------------------------------------------------
        let error_rate = self.metrics.error_rate_5m();
        let latency = self.metrics.avg_latency_ms_5m();
        let sla = &self.settings.sla;

        if !pause.is_paused()
            && (error_rate >= sla.pause_error_rate_5m || latency >= sla.pause_latency_ms_5m)
        {
            pause.pause_auto("sla_threshold_exceeded");
            let details = json!({
                "symbol": key_hint,
                "reason": "sla_threshold_exceeded",
                "error_rate_5m": format!("{error_rate:.4}"),
                "avg_latency_ms_5m": format!("{latency:.2}"),
            });
            warn!(%symbol, error_rate, latency, "SLA breached — auto-pausing");
            self.bus
                .publish(topics::ORCH_AUTO_PAUSED, details.clone(), Some(&key_hint))
                .await;
            self.storage.audit().append("auto_paused", &details)?;
        } else if pause.is_auto_paused()
            && error_rate <= sla.resume_error_rate_5m
            && latency <= sla.resume_latency_ms_5m
            && self.daily_budget_ok(symbol)?
        {
            pause.resume_auto();
            let details = json!({
                "symbol": key_hint,
                "reason": "sla_stabilized_and_budget_ok",
                "error_rate_5m": format!("{error_rate:.4}"),
                "avg_latency_ms_5m": format!("{latency:.2}"),
            });
            info!(%symbol, error_rate, latency, "SLA stabilized — auto-resuming");
            self.bus
                .publish(topics::ORCH_AUTO_RESUMED, details.clone(), Some(&key_hint))
                .await;
            self.storage.audit().append("auto_resumed", &details)?;
        }

        Ok(())
    }

    /// Daily budget gate for auto-resume: today's realized PnL must be above
    /// the configured loss limit.
    fn daily_budget_ok(&self, symbol: &Symbol) -> anyhow::Result<bool> {
        let limit = self.settings.risk.daily_loss_limit_quote;
        if limit <= Decimal::ZERO {
            return Ok(true);
        }
        let now = now_ms();
        let trades = self.storage.trades().list_today(symbol, now)?;
        if trades.is_empty() {
            return Ok(true);
        }
        let today = pnl::replay(&trades).realized_since(pnl::utc_day_start(now));
        Ok(today > -limit)
    }

    async fn fire_dms(&self, symbol: &Symbol, stalled_ms: i64) -> anyhow::Result<()> {
        let key_hint = symbol.to_string();
        warn!(
            %symbol,
            stalled_ms,
            action = ?self.settings.dms_action,
            "dead-man's-switch fired: evaluation loop stalled"
        );

        let mut closed_position = false;
        if self.settings.dms_action == DmsAction::Close {
            let position = self.storage.positions().get(symbol)?;
            if position.is_open() {
                let outcome = self
                    .execution
                    .execute(ExecuteRequest {
                        symbol: symbol.clone(),
                        side: Side::Sell,
                        amount: position.base_qty,
                        source: KeySource::Dms,
                    })
                    .await;
                match outcome {
                    Ok(o) => closed_position = o.executed,
                    Err(e) => warn!(%symbol, error = %e, "DMS close order failed"),
                }
            }
        }

        let details = json!({
            "symbol": key_hint,
            "stalled_ms": stalled_ms,
            "action": match self.settings.dms_action {
                DmsAction::Close => "close",
                DmsAction::Alert => "alert",
            },
            "closed_position": closed_position,
        });
        self.storage.audit().append("dms_triggered", &details)?;
        self.bus
            .publish(topics::DMS_TRIGGERED, details, Some(&key_hint))
            .await;
        self.metrics.inc("dms_triggered_total");
        Ok(())
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("lock_ttl_ms", &self.lock_ttl_ms)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_advances_on_beat() {
        let hb = Heartbeat::new();
        let before = hb.value();
        std::thread::sleep(std::time::Duration::from_millis(5));
        hb.beat();
        assert!(hb.value() >= before);
    }

    #[test]
    fn dms_fuse_fires_once_per_stall() {
        let fuse = DmsFuse::new();
        let beat = 1_000;
        assert!(fuse.should_fire(beat));
        // Same stall: suppressed.
        assert!(!fuse.should_fire(beat));
        // Evaluation resumed and stalled again later: re-armed.
        assert!(fuse.should_fire(2_000));
        assert!(!fuse.should_fire(2_000));
    }
}
