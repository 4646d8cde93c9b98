// =============================================================================
// In-process event bus: priority delivery, per-topic backpressure, DLQ
// =============================================================================

pub mod bus;
pub mod topics;

pub use bus::{DeadLetter, Event, EventBus};
