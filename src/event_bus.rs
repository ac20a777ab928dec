// =============================================================================
// Event Bus — typed pub/sub between the engine core and external consumers
// =============================================================================
//
// Every payload is a tagged `EngineEvent` variant; there are no untyped maps
// on the bus.  Each subscriber owns a bounded queue:
//
//   publish  -> push onto every matching queue (drop-oldest when full),
//               wake the dispatch worker, return immediately
//   dispatch -> single worker thread drains queues in FIFO order and invokes
//               handlers; a panicking handler is logged and isolated
//
// Publishers never block and never observe handler failures.  `stop()`
// drains pending events up to a timeout, then discards the rest; it is safe
// to call repeatedly and with full queues.
// =============================================================================

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ledger::{CloseReason, LedgerSnapshot, Position, Sidebet, SidebetOutcome};
use crate::types::{GameSummary, GameTick};

// ---------------------------------------------------------------------------
// Event kinds and payloads
// ---------------------------------------------------------------------------

/// Discriminant used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    GameTick,
    GameStart,
    GameEnd,
    RugDetected,
    StateChanged,
    PositionOpened,
    PositionClosed,
    SidebetPlaced,
    SidebetResolved,
    BalanceChanged,
    UiUpdate,
    Error,
}

/// A fully-typed event published by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    GameStart {
        game_id: String,
        timestamp: DateTime<Utc>,
    },
    GameTick {
        tick: GameTick,
    },
    GameEnd {
        summary: GameSummary,
    },
    RugDetected {
        game_id: String,
        tick: u64,
        price: Decimal,
    },
    StateChanged {
        snapshot: LedgerSnapshot,
    },
    PositionOpened {
        position: Position,
    },
    PositionClosed {
        position: Position,
        reason: CloseReason,
    },
    SidebetPlaced {
        sidebet: Sidebet,
    },
    SidebetResolved {
        sidebet: Sidebet,
        outcome: SidebetOutcome,
    },
    BalanceChanged {
        old: Decimal,
        new: Decimal,
    },
    /// Reserved for external consumers (the GUI republished state digests
    /// through this channel upstream); the core never emits it.
    UiUpdate {
        message: String,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl EngineEvent {
    /// The subscription discriminant for this payload.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::GameStart { .. } => EventKind::GameStart,
            Self::GameTick { .. } => EventKind::GameTick,
            Self::GameEnd { .. } => EventKind::GameEnd,
            Self::RugDetected { .. } => EventKind::RugDetected,
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::PositionOpened { .. } => EventKind::PositionOpened,
            Self::PositionClosed { .. } => EventKind::PositionClosed,
            Self::SidebetPlaced { .. } => EventKind::SidebetPlaced,
            Self::SidebetResolved { .. } => EventKind::SidebetResolved,
            Self::BalanceChanged { .. } => EventKind::BalanceChanged,
            Self::UiUpdate { .. } => EventKind::UiUpdate,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

type Handler = Box<dyn Fn(&EngineEvent) + Send + Sync + 'static>;

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
    /// FIFO of `(publish sequence, event)`; the dispatch worker replays
    /// queues in global sequence order.
    queue: Mutex<VecDeque<(u64, EngineEvent)>>,
    dropped: AtomicU64,
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct BusShared {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    /// Guards wakeup signalling between publish and the dispatch worker.
    signal: Mutex<()>,
    cond: Condvar,
    stopping: AtomicBool,
    drain_deadline: Mutex<Option<Instant>>,
    queue_capacity: usize,
    published_total: AtomicU64,
    dispatched_total: AtomicU64,
}

/// Typed publish/subscribe hub with one dispatch worker.
pub struct EventBus {
    shared: Arc<BusShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create the bus and start its dispatch worker.
    pub fn new(queue_capacity: usize) -> Self {
        let shared = Arc::new(BusShared {
            subscribers: RwLock::new(Vec::new()),
            signal: Mutex::new(()),
            cond: Condvar::new(),
            stopping: AtomicBool::new(false),
            drain_deadline: Mutex::new(None),
            queue_capacity: queue_capacity.max(1),
            published_total: AtomicU64::new(0),
            dispatched_total: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("event-bus".to_string())
            .spawn(move || dispatch_loop(worker_shared))
            .expect("failed to spawn event-bus worker");

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a handler for one event kind. Returns the subscription id.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        let sub = Arc::new(Subscriber {
            id,
            kind,
            handler: Box::new(handler),
            queue: Mutex::new(VecDeque::with_capacity(self.shared.queue_capacity)),
            dropped: AtomicU64::new(0),
        });
        self.shared.subscribers.write().push(sub);
        debug!(?kind, "subscriber registered");
        id
    }

    /// Remove a subscriber; pending events in its queue are discarded.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.subscribers.write().retain(|s| s.id != id);
    }

    /// Publish an event to every matching subscriber queue.
    ///
    /// Never blocks: a full queue drops its oldest entry to make room, and
    /// handler execution happens on the dispatch worker.
    pub fn publish(&self, event: EngineEvent) {
        if self.shared.stopping.load(Ordering::Acquire) {
            debug!(kind = ?event.kind(), "publish after stop ignored");
            return;
        }

        let seq = self.shared.published_total.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();
        let subscribers = self.shared.subscribers.read();
        for sub in subscribers.iter().filter(|s| s.kind == kind) {
            let mut queue = sub.queue.lock();
            if queue.len() >= self.shared.queue_capacity {
                queue.pop_front();
                sub.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back((seq, event.clone()));
        }
        drop(subscribers);

        // Take the signal lock so a concurrently-waiting worker cannot miss
        // the notification between its emptiness check and its wait.
        let _g = self.shared.signal.lock();
        self.shared.cond.notify_one();
    }

    /// Total events dropped across all subscriber queues.
    pub fn dropped_events(&self) -> u64 {
        self.shared
            .subscribers
            .read()
            .iter()
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .sum()
    }

    /// Total events accepted by `publish`.
    pub fn published_events(&self) -> u64 {
        self.shared.published_total.load(Ordering::Relaxed)
    }

    /// Total handler invocations completed by the dispatch worker.
    pub fn dispatched_events(&self) -> u64 {
        self.shared.dispatched_total.load(Ordering::Relaxed)
    }

    /// Stop the dispatch worker, draining pending events for at most
    /// `timeout`, then discarding whatever remains. Idempotent.
    pub fn stop(&self, timeout: Duration) {
        *self.shared.drain_deadline.lock() = Some(Instant::now() + timeout);
        self.shared.stopping.store(true, Ordering::Release);
        {
            let _g = self.shared.signal.lock();
            self.shared.cond.notify_all();
        }

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("event-bus worker panicked during shutdown");
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop(Duration::from_millis(200));
    }
}

// ---------------------------------------------------------------------------
// Dispatch worker
// ---------------------------------------------------------------------------

fn dispatch_loop(shared: Arc<BusShared>) {
    loop {
        let drained = drain_once(&shared);

        if shared.stopping.load(Ordering::Acquire) {
            let deadline = (*shared.drain_deadline.lock()).unwrap_or_else(Instant::now);
            let empty = queues_empty(&shared);
            if empty || Instant::now() >= deadline {
                if !empty {
                    let discarded = discard_all(&shared);
                    warn!(discarded, "event-bus stopped with undelivered events");
                }
                return;
            }
            continue;
        }

        if drained == 0 {
            let mut g = shared.signal.lock();
            // Re-check under the signal lock so a publish between drain and
            // wait cannot be lost; the timeout is a backstop only.
            if queues_empty(&shared) && !shared.stopping.load(Ordering::Acquire) {
                shared
                    .cond
                    .wait_for(&mut g, Duration::from_millis(50));
            }
        }
    }
}

fn drain_once(shared: &Arc<BusShared>) -> usize {
    let subscribers: Vec<Arc<Subscriber>> = shared.subscribers.read().clone();
    let mut handled = 0;

    // Dispatch strictly in publish order across all queues so that a
    // consumer subscribed to several kinds observes the same sequence the
    // engine emitted.
    loop {
        let mut best: Option<(usize, u64)> = None;
        for (idx, sub) in subscribers.iter().enumerate() {
            if let Some((seq, _)) = sub.queue.lock().front() {
                if best.map_or(true, |(_, s)| *seq < s) {
                    best = Some((idx, *seq));
                }
            }
        }
        let Some((idx, _)) = best else { break };
        let sub = &subscribers[idx];
        let Some((_, event)) = sub.queue.lock().pop_front() else {
            continue;
        };

        let result = catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event)));
        if result.is_err() {
            warn!(kind = ?event.kind(), "event handler panicked; subscriber kept");
        }
        shared.dispatched_total.fetch_add(1, Ordering::Relaxed);
        handled += 1;
    }

    handled
}

fn queues_empty(shared: &Arc<BusShared>) -> bool {
    shared
        .subscribers
        .read()
        .iter()
        .all(|s| s.queue.lock().is_empty())
}

fn discard_all(shared: &Arc<BusShared>) -> usize {
    let mut discarded = 0;
    for sub in shared.subscribers.read().iter() {
        let mut queue = sub.queue.lock();
        discarded += queue.len();
        queue.clear();
    }
    discarded
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn error_event(message: &str) -> EngineEvent {
        EngineEvent::Error {
            kind: "Test".to_string(),
            message: message.to_string(),
        }
    }

    fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn subscriber_receives_matching_kind_only() {
        let bus = EventBus::new(16);
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        bus.subscribe(EventKind::Error, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(error_event("one"));
        bus.publish(EngineEvent::BalanceChanged {
            old: Decimal::ONE,
            new: Decimal::TWO,
        });

        assert!(wait_until(1_000, || hits.load(Ordering::SeqCst) == 1));
        bus.stop(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn full_queue_drops_oldest_and_counts() {
        let bus = EventBus::new(2);
        let seen = Arc::new(Mutex::new(Vec::new()));

        // Park the dispatcher behind a slow first handler call so the queue
        // can actually fill.
        let s = seen.clone();
        bus.subscribe(EventKind::Error, move |e| {
            if let EngineEvent::Error { message, .. } = e {
                std::thread::sleep(Duration::from_millis(30));
                s.lock().push(message.clone());
            }
        });

        for i in 0..6 {
            bus.publish(error_event(&format!("m{i}")));
        }
        bus.stop(Duration::from_secs(2));

        let seen = seen.lock();
        // The first event may already be in-flight; everything else is
        // bounded by the queue, so at most capacity + 1 deliveries.
        assert!(seen.len() <= 3, "delivered {seen:?}");
        assert_eq!(seen.last().unwrap(), "m5", "newest event must survive");
        assert!(bus.dropped_events() >= 3);
    }

    #[test]
    fn handler_panic_does_not_reach_publisher() {
        let bus = EventBus::new(8);
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::Error, |_| panic!("boom"));
        let h = hits.clone();
        bus.subscribe(EventKind::Error, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(error_event("x"));
        assert!(wait_until(1_000, || hits.load(Ordering::SeqCst) == 1));
        bus.stop(Duration::from_millis(200));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(8);
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let id = bus.subscribe(EventKind::Error, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(error_event("a"));
        assert!(wait_until(1_000, || hits.load(Ordering::SeqCst) == 1));

        bus.unsubscribe(id);
        bus.publish(error_event("b"));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        bus.stop(Duration::from_millis(200));
    }

    #[test]
    fn stop_twice_is_a_noop() {
        let bus = EventBus::new(8);
        bus.subscribe(EventKind::Error, |_| {});
        bus.publish(error_event("x"));
        bus.stop(Duration::from_millis(200));
        bus.stop(Duration::from_millis(200));
        // Publishing after stop is ignored rather than queueing forever.
        bus.publish(error_event("y"));
        assert_eq!(bus.published_events(), 1);
        assert_eq!(bus.dispatched_events(), 1);
    }

    #[test]
    fn events_dispatch_in_publish_order() {
        let bus = EventBus::new(64);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        bus.subscribe(EventKind::Error, move |e| {
            if let EngineEvent::Error { message, .. } = e {
                s.lock().push(message.clone());
            }
        });

        for i in 0..20 {
            bus.publish(error_event(&format!("{i}")));
        }
        bus.stop(Duration::from_secs(2));

        let seen = seen.lock();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(*seen, expected);
    }
}
