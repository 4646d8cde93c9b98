// =============================================================================
// Metrics Registry — counters + rolling SLA windows, explicitly injected
// =============================================================================
//
// One registry instance is created at startup and handed to every component
// that needs it (no global statics). Two families:
//
//   - Named counters, optionally labeled: `bus_drop_oldest_total{topic=...}`.
//   - A rolling 5-minute window of call outcomes feeding the watchdog's
//     SLA decisions: error_rate_5m and avg_latency_ms_5m.
//
// Window updates are O(1) amortized; reads prune expired samples first.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::types::now_ms;

/// Length of the SLA observation window.
const WINDOW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy)]
struct Sample {
    ts_ms: i64,
    ok: bool,
    latency_ms: f64,
}

/// Thread-safe metrics registry.
pub struct Metrics {
    counters: Mutex<HashMap<String, u64>>,
    window: Mutex<VecDeque<Sample>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            window: Mutex::new(VecDeque::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    /// Increment a counter by one.
    pub fn inc(&self, name: &str) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    /// Increment a labeled counter, e.g. `inc_labeled("bus_drop_oldest_total",
    /// "topic", "watchdog.heartbeat")`.
    pub fn inc_labeled(&self, name: &str, label: &str, value: &str) {
        let key = format!("{name}{{{label}={value}}}");
        *self.counters.lock().entry(key).or_insert(0) += 1;
    }

    /// Read a counter (zero if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Read a labeled counter.
    pub fn counter_labeled(&self, name: &str, label: &str, value: &str) -> u64 {
        self.counter(&format!("{name}{{{label}={value}}}"))
    }

    /// Snapshot of all counters (for the health/debug surface).
    pub fn counters_snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().clone()
    }

    // -------------------------------------------------------------------------
    // SLA window
    // -------------------------------------------------------------------------

    /// Record the outcome of one externally-visible call (broker, storage
    /// transaction, loop iteration).
    pub fn observe_call(&self, ok: bool, latency_ms: f64) {
        self.observe_call_at(now_ms(), ok, latency_ms);
    }

    /// Test seam: record with an explicit timestamp.
    pub fn observe_call_at(&self, ts_ms: i64, ok: bool, latency_ms: f64) {
        let mut w = self.window.lock();
        w.push_back(Sample { ts_ms, ok, latency_ms });
        Self::prune(&mut w, ts_ms);
    }

    /// Fraction of failed calls in the trailing window. Zero when empty.
    pub fn error_rate_5m(&self) -> f64 {
        self.error_rate_5m_at(now_ms())
    }

    pub fn error_rate_5m_at(&self, now: i64) -> f64 {
        let mut w = self.window.lock();
        Self::prune(&mut w, now);
        if w.is_empty() {
            return 0.0;
        }
        let failed = w.iter().filter(|s| !s.ok).count();
        failed as f64 / w.len() as f64
    }

    /// Average latency in the trailing window. Zero when empty.
    pub fn avg_latency_ms_5m(&self) -> f64 {
        self.avg_latency_ms_5m_at(now_ms())
    }

    pub fn avg_latency_ms_5m_at(&self, now: i64) -> f64 {
        let mut w = self.window.lock();
        Self::prune(&mut w, now);
        if w.is_empty() {
            return 0.0;
        }
        let total: f64 = w.iter().map(|s| s.latency_ms).sum();
        total / w.len() as f64
    }

    fn prune(w: &mut VecDeque<Sample>, now: i64) {
        let cutoff = now - WINDOW_MS;
        while w.front().is_some_and(|s| s.ts_ms < cutoff) {
            w.pop_front();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("counters", &self.counters.lock().len())
            .field("window_samples", &self.window.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_read_back() {
        let m = Metrics::new();
        m.inc("orders_total");
        m.inc("orders_total");
        m.inc_labeled("bus_drop_oldest_total", "topic", "health.report");
        assert_eq!(m.counter("orders_total"), 2);
        assert_eq!(
            m.counter_labeled("bus_drop_oldest_total", "topic", "health.report"),
            1
        );
        assert_eq!(m.counter("missing"), 0);
    }

    #[test]
    fn error_rate_counts_only_window_samples() {
        let m = Metrics::new();
        let t0 = 1_700_000_000_000;
        m.observe_call_at(t0, false, 100.0);
        m.observe_call_at(t0 + 1_000, true, 100.0);
        m.observe_call_at(t0 + 2_000, true, 100.0);
        m.observe_call_at(t0 + 3_000, true, 100.0);
        assert!((m.error_rate_5m_at(t0 + 4_000) - 0.25).abs() < 1e-9);

        // The failing sample ages out of the 5-minute window.
        assert_eq!(m.error_rate_5m_at(t0 + WINDOW_MS + 1_500), 0.0);
    }

    #[test]
    fn avg_latency_over_window() {
        let m = Metrics::new();
        let t0 = 1_700_000_000_000;
        m.observe_call_at(t0, true, 100.0);
        m.observe_call_at(t0 + 10, true, 300.0);
        assert!((m.avg_latency_ms_5m_at(t0 + 20) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_reports_zero() {
        let m = Metrics::new();
        assert_eq!(m.error_rate_5m(), 0.0);
        assert_eq!(m.avg_latency_ms_5m(), 0.0);
    }
}
