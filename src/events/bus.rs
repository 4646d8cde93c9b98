// =============================================================================
// Event Bus — in-process priority publish/subscribe with backpressure + DLQ
// =============================================================================
//
// Delivery model:
//   - One worker task drains a priority queue; lower priority number wins.
//   - Events carrying the same `key` are delivered in publish order even if
//     their topics map to different priorities. Across keys, only priority
//     order is guaranteed.
//   - Handler failures never propagate: each attempt runs in its own task
//     (panic isolation), failures are retried with exponential backoff up to
//     `max_attempts`, then the event is dead-lettered with the error cause.
//
// Backpressure when the queue is full at publish time, per topic policy:
//   - block       publisher awaits free space (fails-closed)
//   - to-DLQ      the new event is dead-lettered, never delivered
//   - drop-oldest the oldest same-priority event is evicted and counted
//
// `stop` drains with a bounded deadline; events still queued past the
// deadline are dead-lettered with cause "shutdown". Stopping twice is a no-op.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::events::topics::{self, FullQueuePolicy};
use crate::metrics::Metrics;
use crate::types::now_ms;

/// Default number of delivery attempts before an event is dead-lettered.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Base delay for handler retry backoff.
const RETRY_BASE_MS: u64 = 50;
/// Upper bound kept on the dead-letter store.
const DLQ_STORE_CAP: usize = 1024;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A bus event. `key` is a routing hint: same-key events are delivered in
/// publish order.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
    pub key: Option<String>,
    pub ts_ms: i64,
}

/// A dead-lettered event and why it ended up there.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub event: Event,
    pub cause: String,
    pub attempts: u32,
    pub ts_ms: i64,
}

type HandlerFn =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

struct Subscription {
    pattern: String,
    name: String,
    handler: HandlerFn,
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    /// Ordered by (priority, publish sequence).
    queue: BTreeMap<(u8, u64), Event>,
    /// Per-key pending events as (sequence, priority), oldest first.
    key_index: HashMap<String, BTreeSet<(u64, u8)>>,
}

impl QueueState {
    fn insert(&mut self, prio: u8, seq: u64, event: Event) {
        if let Some(k) = &event.key {
            self.key_index.entry(k.clone()).or_default().insert((seq, prio));
        }
        self.queue.insert((prio, seq), event);
    }

    fn remove(&mut self, prio: u8, seq: u64) -> Option<Event> {
        let ev = self.queue.remove(&(prio, seq))?;
        if let Some(k) = &ev.key {
            if let Some(set) = self.key_index.get_mut(k) {
                set.remove(&(seq, prio));
                if set.is_empty() {
                    self.key_index.remove(k);
                }
            }
        }
        Some(ev)
    }

    /// Pop the next deliverable event: globally by (priority, seq), but if
    /// the winner's key has an older pending event, deliver that one instead
    /// so per-key publish order is preserved.
    fn pop_next(&mut self) -> Option<Event> {
        let (&(prio, seq), ev) = self.queue.iter().next()?;
        if let Some(k) = ev.key.as_deref() {
            if let Some(&(min_seq, min_prio)) =
                self.key_index.get(k).and_then(|set| set.iter().next())
            {
                if min_seq < seq {
                    return self.remove(min_prio, min_seq);
                }
            }
        }
        self.remove(prio, seq)
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct BusInner {
    capacity: usize,
    max_attempts: u32,
    state: Mutex<QueueState>,
    subs: RwLock<Vec<Subscription>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    /// The event currently being dispatched, reclaimed if the worker is
    /// abandoned at the drain deadline.
    in_flight: Mutex<Option<Event>>,
    seq: AtomicU64,
    running: AtomicBool,
    stopping: AtomicBool,
    /// Wakes the worker when an event is queued (or stop is requested).
    push_signal: Notify,
    /// Wakes blocked publishers when the worker frees a slot.
    pop_signal: Notify,
    metrics: Arc<Metrics>,
}

/// Cloneable handle to the in-process event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
    worker: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl EventBus {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self::with_max_attempts(capacity, metrics, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(capacity: usize, metrics: Arc<Metrics>, max_attempts: u32) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                max_attempts: max_attempts.max(1),
                state: Mutex::new(QueueState::default()),
                subs: RwLock::new(Vec::new()),
                dead_letters: Mutex::new(VecDeque::new()),
                in_flight: Mutex::new(None),
                seq: AtomicU64::new(0),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                push_signal: Notify::new(),
                pop_signal: Notify::new(),
                metrics,
            }),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the worker task. Calling twice is a no-op.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            Self::run_worker(inner).await;
        });
        *self.worker.lock() = Some(handle);
        info!(capacity = self.inner.capacity, "event bus started");
    }

    /// Drain and stop. Events still queued after `grace` are dead-lettered
    /// with cause "shutdown". Idempotent.
    pub async fn stop(&self, grace: Duration) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.push_signal.notify_waiters();
        self.inner.pop_signal.notify_waiters();

        let handle = self.worker.lock().take();
        if let Some(h) = handle {
            let abort = h.abort_handle();
            if tokio::time::timeout(grace, h).await.is_err() {
                warn!(grace_ms = grace.as_millis() as u64, "bus drain deadline exceeded — abandoning worker");
                abort.abort();
                // The abandoned handler's event is dead-lettered like the rest.
                let orphan = self.inner.in_flight.lock().take();
                if let Some(ev) = orphan {
                    self.dead_letter(ev, "shutdown", 0).await;
                }
            }
        }

        // Whatever is still queued did not make the deadline.
        let leftovers: Vec<Event> = {
            let mut st = self.inner.state.lock();
            let mut out = Vec::new();
            while let Some(ev) = st.pop_next() {
                out.push(ev);
            }
            out
        };
        for ev in leftovers {
            self.dead_letter(ev, "shutdown", 0).await;
        }
        self.inner.running.store(false, Ordering::SeqCst);
        info!("event bus stopped");
    }

    /// True once started and not yet stopping.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.inner.stopping.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Subscribe
    // -------------------------------------------------------------------------

    /// Register a handler for `pattern`: an exact topic, a `family.*` prefix,
    /// or `*` for everything. Handlers run on the single bus worker.
    pub fn subscribe<F, Fut>(&self, pattern: &str, name: &str, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ev| Box::pin(handler(ev)));
        self.inner.subs.write().push(Subscription {
            pattern: pattern.to_string(),
            name: name.to_string(),
            handler,
        });
        debug!(pattern, name, "bus subscription registered");
    }

    fn pattern_matches(pattern: &str, topic: &str) -> bool {
        if pattern == "*" || pattern == topic {
            return true;
        }
        pattern
            .strip_suffix(".*")
            .is_some_and(|prefix| topic.starts_with(prefix) && topic.len() > prefix.len())
    }

    // -------------------------------------------------------------------------
    // Publish
    // -------------------------------------------------------------------------

    /// Publish an event. Suspends only for `block`-policy topics on a full
    /// queue; every other policy resolves immediately.
    pub async fn publish(&self, topic: &str, payload: serde_json::Value, key: Option<&str>) {
        let (prio, policy) = topics::policy_for(topic);
        let mut pending = Some(Event {
            topic: topic.to_string(),
            payload,
            key: key.map(str::to_string),
            ts_ms: now_ms(),
        });

        loop {
            // Scope the lock so it is never held across an await point. The
            // step tells us what to do with the event once the lock is gone.
            enum Step {
                Done,
                DeadLetter(Event, &'static str),
                Wait(Event),
            }

            let step = {
                let mut st = self.inner.state.lock();
                let event = pending.take().expect("pending event present");

                if self.inner.stopping.load(Ordering::SeqCst) {
                    Step::DeadLetter(event, "shutdown")
                } else if st.queue.len() < self.inner.capacity {
                    let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
                    st.insert(prio, seq, event);
                    self.inner.push_signal.notify_one();
                    Step::Done
                } else {
                    match policy {
                        FullQueuePolicy::Block => Step::Wait(event),
                        FullQueuePolicy::ToDlq => Step::DeadLetter(event, "backpressure"),
                        FullQueuePolicy::DropOldest => {
                            // Evict the oldest event at this priority; if none
                            // exists, the new event itself is the casualty.
                            let victim_slot = st
                                .queue
                                .range((prio, 0)..(prio, u64::MAX))
                                .next()
                                .map(|(&slot, _)| slot);
                            match victim_slot {
                                Some((p, s)) => {
                                    if let Some(victim) = st.remove(p, s) {
                                        self.inner.metrics.inc_labeled(
                                            "bus_drop_oldest_total",
                                            "topic",
                                            &victim.topic,
                                        );
                                        debug!(topic = %victim.topic, "bus evicted oldest same-priority event");
                                    }
                                    let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
                                    st.insert(prio, seq, event);
                                    self.inner.push_signal.notify_one();
                                }
                                None => {
                                    self.inner.metrics.inc_labeled(
                                        "bus_drop_oldest_total",
                                        "topic",
                                        &event.topic,
                                    );
                                    debug!(topic = %event.topic, "bus full with higher-priority events — new event dropped");
                                }
                            }
                            Step::Done
                        }
                    }
                }
            };

            match step {
                Step::Done => return,
                Step::DeadLetter(event, cause) => {
                    self.dead_letter(event, cause, 0).await;
                    return;
                }
                Step::Wait(event) => {
                    // Block policy: wait for the worker to free a slot.
                    pending = Some(event);
                    let notified = self.inner.pop_signal.notified();
                    {
                        let st = self.inner.state.lock();
                        if st.queue.len() < self.inner.capacity
                            || self.inner.stopping.load(Ordering::SeqCst)
                        {
                            continue;
                        }
                    }
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Worker
    // -------------------------------------------------------------------------

    async fn run_worker(inner: Arc<BusInner>) {
        loop {
            let next = { inner.state.lock().pop_next() };
            match next {
                Some(event) => {
                    inner.pop_signal.notify_waiters();
                    *inner.in_flight.lock() = Some(event.clone());
                    Self::dispatch(&inner, event).await;
                    *inner.in_flight.lock() = None;
                }
                None => {
                    if inner.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    let notified = inner.push_signal.notified();
                    let empty = inner.state.lock().queue.is_empty();
                    if !empty {
                        continue;
                    }
                    if inner.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    // The periodic wake bounds the window in which a stop
                    // request racing the notification could be missed.
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    }
                }
            }
        }
    }

    async fn dispatch(inner: &Arc<BusInner>, event: Event) {
        let matching: Vec<(String, HandlerFn)> = {
            let subs = inner.subs.read();
            subs.iter()
                .filter(|s| Self::pattern_matches(&s.pattern, &event.topic))
                .map(|s| (s.name.clone(), s.handler.clone()))
                .collect()
        };

        inner.metrics.inc_labeled("bus_delivered_total", "topic", &event.topic);

        for (name, handler) in matching {
            let mut last_error = String::new();
            let mut succeeded = false;

            for attempt in 1..=inner.max_attempts {
                // Each attempt runs in its own task so a panicking handler
                // cannot take the worker down with it.
                let h = handler.clone();
                let ev = event.clone();
                let outcome = tokio::spawn(async move { h(ev).await }).await;

                match outcome {
                    Ok(Ok(())) => {
                        succeeded = true;
                        break;
                    }
                    Ok(Err(msg)) => last_error = msg,
                    Err(join_err) => last_error = format!("handler panicked: {join_err}"),
                }

                inner.metrics.inc_labeled("bus_handler_failures_total", "handler", &name);
                warn!(
                    handler = %name,
                    topic = %event.topic,
                    attempt,
                    error = %last_error,
                    "bus handler failed"
                );

                if attempt < inner.max_attempts {
                    let delay = RETRY_BASE_MS.saturating_mul(1 << (attempt - 1)).min(1_000);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }

            if !succeeded {
                error!(
                    handler = %name,
                    topic = %event.topic,
                    attempts = inner.max_attempts,
                    "bus handler exhausted retries — dead-lettering event"
                );
                Self::dead_letter_inner(inner, event.clone(), &last_error, inner.max_attempts)
                    .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Dead letters
    // -------------------------------------------------------------------------

    async fn dead_letter(&self, event: Event, cause: &str, attempts: u32) {
        Self::dead_letter_inner(&self.inner, event, cause, attempts).await;
    }

    async fn dead_letter_inner(inner: &Arc<BusInner>, event: Event, cause: &str, attempts: u32) {
        inner.metrics.inc_labeled("bus_dlq_total", "topic", &event.topic);

        let letter = DeadLetter {
            event: event.clone(),
            cause: cause.to_string(),
            attempts,
            ts_ms: now_ms(),
        };
        {
            let mut store = inner.dead_letters.lock();
            if store.len() >= DLQ_STORE_CAP {
                store.pop_front();
            }
            store.push_back(letter);
        }

        // Notify DLQ subscribers directly (single attempt, best-effort) —
        // re-queueing dead letters could loop forever on a poisoned handler.
        let dlq_event = Event {
            topic: topics::DLQ.to_string(),
            payload: serde_json::json!({
                "original_topic": event.topic,
                "cause": cause,
                "attempts": attempts,
                "payload": event.payload,
            }),
            key: event.key.clone(),
            ts_ms: now_ms(),
        };
        let matching: Vec<HandlerFn> = {
            let subs = inner.subs.read();
            subs.iter()
                .filter(|s| Self::pattern_matches(&s.pattern, topics::DLQ))
                .map(|s| s.handler.clone())
                .collect()
        };
        for handler in matching {
            let ev = dlq_event.clone();
            let _ = tokio::spawn(async move { handler(ev).await }).await;
        }
    }

    /// Snapshot of the dead-letter store, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().iter().cloned().collect()
    }

    /// Number of events currently queued (diagnostic).
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("queued", &self.queued_len())
            .field("running", &self.is_running())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus(capacity: usize) -> EventBus {
        EventBus::new(capacity, Arc::new(Metrics::new()))
    }

    /// Subscribe a collector that appends delivered topics to a shared list.
    fn collect_topics(bus: &EventBus, pattern: &str) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(pattern, "collector", move |ev: Event| {
            let sink = sink.clone();
            async move {
                sink.lock().push(ev.topic);
                Ok(())
            }
        });
        seen
    }

    async fn settle(bus: &EventBus) {
        for _ in 0..200 {
            if bus.queued_len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // One extra tick so the in-flight dispatch finishes.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn priority_order_beats_publish_order() {
        let b = bus(16);
        let seen = collect_topics(&b, "*");

        // Queue before starting the worker so ordering is observable.
        b.publish(topics::HEALTH_REPORT, json!({}), None).await;
        b.publish(topics::ORDER_EXECUTED, json!({}), None).await;
        b.publish(topics::RISK_BLOCKED, json!({}), None).await;
        b.start();
        settle(&b).await;

        assert_eq!(
            *seen.lock(),
            vec![
                topics::ORDER_EXECUTED.to_string(),
                topics::RISK_BLOCKED.to_string(),
                topics::HEALTH_REPORT.to_string(),
            ]
        );
        b.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn same_key_events_keep_publish_order_across_priorities() {
        let b = bus(16);
        let seen = collect_topics(&b, "*");

        // Low-priority first, then high-priority with the same key: the
        // low-priority one must still be delivered first.
        b.publish("position.changed", json!({"n": 1}), Some("BTC/USDT")).await;
        b.publish(topics::ORDER_EXECUTED, json!({"n": 2}), Some("BTC/USDT")).await;
        b.start();
        settle(&b).await;

        assert_eq!(
            *seen.lock(),
            vec!["position.changed".to_string(), topics::ORDER_EXECUTED.to_string()]
        );
        b.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn drop_oldest_evicts_and_counts() {
        let metrics = Arc::new(Metrics::new());
        let b = EventBus::new(2, metrics.clone());
        let seen = collect_topics(&b, "*");

        b.publish(topics::WATCHDOG_HEARTBEAT, json!({"n": 1}), None).await;
        b.publish(topics::HEALTH_REPORT, json!({"n": 2}), None).await;
        // Queue is full; drop-oldest evicts the heartbeat.
        b.publish(topics::HEALTH_REPORT, json!({"n": 3}), None).await;

        assert_eq!(
            metrics.counter_labeled("bus_drop_oldest_total", "topic", topics::WATCHDOG_HEARTBEAT),
            1
        );

        b.start();
        settle(&b).await;
        assert_eq!(
            *seen.lock(),
            vec![topics::HEALTH_REPORT.to_string(), topics::HEALTH_REPORT.to_string()]
        );
        b.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn to_dlq_policy_dead_letters_new_event_on_full_queue() {
        let b = bus(2);
        let seen = collect_topics(&b, "order.*");

        b.publish(topics::ORDER_EXECUTED, json!({"n": 1}), None).await;
        b.publish(topics::ORDER_EXECUTED, json!({"n": 2}), None).await;
        b.publish(topics::ORDER_EXECUTED, json!({"n": 3}), None).await;

        let letters = b.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].cause, "backpressure");
        assert_eq!(letters[0].event.payload["n"], 3);

        b.start();
        settle(&b).await;
        assert_eq!(seen.lock().len(), 2);
        b.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failing_handler_retries_then_dead_letters() {
        let metrics = Arc::new(Metrics::new());
        let b = EventBus::with_max_attempts(16, metrics.clone(), 2);

        let calls = Arc::new(Mutex::new(0u32));
        let counter = calls.clone();
        b.subscribe(topics::TRADE_COMPLETED, "flaky", move |_ev| {
            let counter = counter.clone();
            async move {
                *counter.lock() += 1;
                Err("boom".to_string())
            }
        });

        b.start();
        b.publish(topics::TRADE_COMPLETED, json!({}), None).await;
        settle(&b).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*calls.lock(), 2);
        assert_eq!(metrics.counter_labeled("bus_handler_failures_total", "handler", "flaky"), 2);
        let letters = b.dead_letters();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].cause.contains("boom"));
        b.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn dlq_subscriber_sees_dead_letters() {
        let b = bus(16);
        let dlq_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = dlq_seen.clone();
        b.subscribe(topics::DLQ, "dlq-watch", move |ev: Event| {
            let sink = sink.clone();
            async move {
                sink.lock().push(ev.payload["original_topic"].as_str().unwrap_or("").to_string());
                Ok(())
            }
        });
        b.subscribe(topics::TRADE_COMPLETED, "always-fails", |_ev| async {
            Err("nope".to_string())
        });

        b.start();
        b.publish(topics::TRADE_COMPLETED, json!({}), None).await;
        settle(&b).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(*dlq_seen.lock(), vec![topics::TRADE_COMPLETED.to_string()]);
        b.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_drains_queued_events_and_is_idempotent() {
        let b = bus(16);
        let seen = collect_topics(&b, "*");
        b.start();
        for n in 0..5 {
            b.publish(topics::HEALTH_REPORT, json!({"n": n}), None).await;
        }
        b.stop(Duration::from_secs(2)).await;
        assert_eq!(seen.lock().len(), 5);

        // Second stop is a no-op.
        b.stop(Duration::from_secs(2)).await;
        assert!(!b.is_running());
    }

    #[tokio::test]
    async fn publish_after_stop_goes_to_dlq_with_shutdown_cause() {
        let b = bus(16);
        b.start();
        b.stop(Duration::from_secs(1)).await;
        b.publish(topics::ORDER_EXECUTED, json!({}), None).await;
        let letters = b.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].cause, "shutdown");
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated_and_dead_lettered() {
        let b = EventBus::with_max_attempts(16, Arc::new(Metrics::new()), 1);
        b.subscribe(topics::TRADE_COMPLETED, "panicky", |_ev| async {
            if now_ms() > 0 {
                panic!("handler bug");
            }
            Ok(())
        });
        let seen = collect_topics(&b, topics::HEALTH_REPORT);

        b.start();
        b.publish(topics::TRADE_COMPLETED, json!({}), None).await;
        b.publish(topics::HEALTH_REPORT, json!({}), None).await;
        settle(&b).await;

        // The worker survived the panic and delivered the next event.
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(b.dead_letters().len(), 1);
        b.stop(Duration::from_secs(1)).await;
    }
}
