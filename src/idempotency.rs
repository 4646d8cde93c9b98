// =============================================================================
// Idempotency keys — one equivalence class per (source, symbol, side, bucket)
// =============================================================================
//
// Format: `{source}:{BASE-QUOTE}:{side}:{bucket_start_ms}` where the bucket
// start is current time floored to the bucket width. Two calls inside the
// same bucket map to the same key and collapse into one execution.
// =============================================================================

use crate::types::{Side, Symbol};

/// Who is asking for the execution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Strategy-driven order execution.
    Order,
    /// Evaluation collapse (equivalent evaluations share one slot).
    Eval,
    /// Protective-exit forced sell.
    Exit,
    /// Dead-man's-switch forced sell.
    Dms,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Eval => "eval",
            Self::Exit => "exit",
            Self::Dms => "dms",
        }
    }
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Floor `now_ms` to the start of its bucket.
pub fn bucket_start(now_ms: i64, bucket_ms: i64) -> i64 {
    let b = bucket_ms.max(1);
    (now_ms / b) * b
}

/// Build the canonical idempotency key for this moment.
pub fn build_key(
    source: KeySource,
    symbol: &Symbol,
    side: Side,
    bucket_ms: i64,
    now_ms: i64,
) -> String {
    format!(
        "{source}:{}:{side}:{}",
        symbol.dashed(),
        bucket_start(now_ms, bucket_ms)
    )
}

/// Check that a key matches `source:BASE-QUOTE:side:epoch_ms` with a
/// 13-digit millisecond bucket.
pub fn validate_key(key: &str) -> bool {
    let mut parts = key.split(':');
    let (Some(source), Some(symbol), Some(side), Some(bucket), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };

    matches!(source, "order" | "eval" | "exit" | "dms")
        && !symbol.is_empty()
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
        && matches!(side, "buy" | "sell")
        && bucket.len() == 13
        && bucket.chars().all(|c| c.is_ascii_digit())
}
