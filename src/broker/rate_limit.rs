// =============================================================================
// Rate-Limit Tracker — keeps the live adapter under the exchange's caps
// =============================================================================
//
// The exchange reports consumed request weight and order counts in response
// headers; the tracker mirrors them into atomic counters and refuses calls
// that would breach the hard ceilings. A refusal surfaces upstream as a
// `transient` broker error, so the normal backoff machinery takes over.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

/// Hard ceiling on request weight per minute (exchange limit is 1200; we stop
/// at 1000 to leave room for reconciliation traffic).
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 10;
/// Orders per day.
const ORDER_1D_LIMIT: u32 = 200_000;

/// Lock-free mirror of the exchange-reported usage counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1d: AtomicU32,
}

/// Serialisable snapshot for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_10s: u32,
    pub order_count_1d: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1d: AtomicU32::new(0),
        }
    }

    /// Mirror the usage headers from an exchange response.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u32>().ok())
        };
        if let Some(w) = read("X-MBX-USED-WEIGHT-1M") {
            self.used_weight_1m.store(w, Ordering::Relaxed);
            debug!(used_weight_1m = w, "rate-limit weight updated");
        }
        if let Some(c) = read("X-MBX-ORDER-COUNT-10S") {
            self.order_count_10s.store(c, Ordering::Relaxed);
        }
        if let Some(c) = read("X-MBX-ORDER-COUNT-1D") {
            self.order_count_1d.store(c, Ordering::Relaxed);
        }
    }

    /// True if `weight` more request weight fits under the hard ceiling.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let ok = current.saturating_add(weight) <= WEIGHT_HARD_LIMIT;
        if !ok {
            warn!(current, weight, limit = WEIGHT_HARD_LIMIT, "request refused by rate-limit budget");
        }
        ok
    }

    /// True if another order fits under both order-count windows.
    pub fn can_place_order(&self) -> bool {
        let c10 = self.order_count_10s.load(Ordering::Relaxed);
        let c1d = self.order_count_1d.load(Ordering::Relaxed);
        if c10 >= ORDER_10S_LIMIT || c1d >= ORDER_1D_LIMIT {
            warn!(c10, c1d, "order refused by rate-limit budget");
            return false;
        }
        true
    }

    /// Count an order locally before the exchange echoes updated headers.
    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
        self.order_count_1d.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            order_count_1d: self.order_count_1d.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_allows_everything() {
        let t = RateLimitTracker::new();
        assert!(t.can_send_request(10));
        assert!(t.can_place_order());
    }

    #[test]
    fn weight_ceiling_refuses_requests() {
        let t = RateLimitTracker::new();
        t.used_weight_1m.store(995, Ordering::Relaxed);
        assert!(t.can_send_request(5));
        assert!(!t.can_send_request(6));
    }

    #[test]
    fn order_counter_caps_at_window_limit() {
        let t = RateLimitTracker::new();
        for _ in 0..ORDER_10S_LIMIT {
            assert!(t.can_place_order());
            t.record_order_sent();
        }
        assert!(!t.can_place_order());
    }
}
