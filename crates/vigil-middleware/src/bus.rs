//! Synchronous, typed, kind-routed publish/subscribe event bus.
//!
//! Unlike a channel-based bus there is no dispatch thread: [`EventBus::publish`]
//! invokes every handler registered for the event's [`EventKind`] on the
//! calling thread, in subscription order, before returning.  Handlers must
//! therefore be fast and must not block.
//!
//! A handler that returns an error *or panics* is logged and counted as a
//! failure; the remaining handlers still run.
//!
//! # Kinds
//!
//! | Kind | Typical publisher |
//! |---|---|
//! | [`EventKind::HeartbeatMissed`] / [`EventKind::HeartbeatRecovered`] | watchdog tick |
//! | [`EventKind::EscalationTriggered`] | watchdog escalation sequence |
//! | [`EventKind::SafetyModeChanged`] | watchdog, supervisor |
//! | [`EventKind::TrustScoreChanged`] | supervisor |
//! | [`EventKind::OperationCompleted`] / [`EventKind::OperationRefused`] | supervisor |
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use vigil_middleware::EventBus;
//! use vigil_types::EventKind;
//!
//! let bus = EventBus::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//! let seen_in_handler = seen.clone();
//! bus.subscribe(EventKind::HeartbeatMissed, move |_event| {
//!     seen_in_handler.fetch_add(1, Ordering::SeqCst);
//!     Ok(())
//! });
//!
//! let summary = bus.publish(EventKind::HeartbeatMissed, serde_json::json!({}), "doc");
//! assert_eq!(summary.delivered, 1);
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! ```

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error};
use vigil_types::{Event, EventKind};

/// Error a handler may return to report that it could not process an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of a single [`EventBus::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Handlers that returned `Ok(())`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
}

/// Shared event bus.  Clone it cheaply – all clones share the same
/// subscriber registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read();
        let total: usize = registry.by_kind.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("subscribers", &total)
            .finish()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    ///
    /// Handlers for the same kind run in the order they were subscribed.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .write()
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler.  Returns `false` when the id is
    /// unknown (already removed or cleared).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.write();
        for handlers in registry.by_kind.values_mut() {
            if let Some(pos) = handlers.iter().position(|(hid, _)| *hid == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Publish an event of `kind` to every handler subscribed to it.
    ///
    /// The handler list is snapshotted before dispatch, so a handler may
    /// subscribe, unsubscribe or publish without deadlocking.  Handlers added
    /// during dispatch see the next event, not this one.
    pub fn publish(
        &self,
        kind: EventKind,
        data: serde_json::Value,
        source: &str,
    ) -> DispatchSummary {
        self.publish_event(&Event::new(kind, data, source))
    }

    /// Publish an already-built [`Event`].
    pub fn publish_event(&self, event: &Event) -> DispatchSummary {
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .registry
            .read()
            .by_kind
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        let mut summary = DispatchSummary::default();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => summary.delivered += 1,
                Ok(Err(e)) => {
                    summary.failed += 1;
                    error!(kind = %event.kind, subscription = id.0, error = %e, "event handler failed");
                }
                Err(panic) => {
                    summary.failed += 1;
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    error!(kind = %event.kind, subscription = id.0, panic = %msg, "event handler panicked");
                }
            }
        }
        debug!(
            kind = %event.kind,
            source = %event.source,
            delivered = summary.delivered,
            failed = summary.failed,
            "event published"
        );
        summary
    }

    /// Number of handlers currently subscribed to `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry
            .read()
            .by_kind
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop every subscription.  Intended for test isolation.
    pub fn clear_subscribers(&self) {
        self.registry.write().by_kind.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder(bus: &EventBus, kind: EventKind, label: &'static str, log: &Arc<Mutex<Vec<String>>>) {
        let log = log.clone();
        bus.subscribe(kind, move |event| {
            log.lock().push(format!("{label}:{}", event.data["n"]));
            Ok(())
        });
    }

    #[test]
    fn publish_with_no_subscribers_is_a_noop() {
        let bus = EventBus::new();
        let summary = bus.publish(EventKind::SystemStart, json!({}), "test");
        assert_eq!(summary, DispatchSummary::default());
    }

    #[test]
    fn every_subscriber_runs_once_per_event_in_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, EventKind::HeartbeatMissed, "a", &log);
        recorder(&bus, EventKind::HeartbeatMissed, "b", &log);
        recorder(&bus, EventKind::HeartbeatMissed, "c", &log);

        for n in 0..3 {
            let summary = bus.publish(EventKind::HeartbeatMissed, json!({ "n": n }), "test");
            assert_eq!(summary.delivered, 3);
        }

        let log = log.lock();
        assert_eq!(
            *log,
            vec!["a:0", "b:0", "c:0", "a:1", "b:1", "c:1", "a:2", "b:2", "c:2"]
        );
    }

    #[test]
    fn failing_handler_does_not_block_later_handlers() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, EventKind::ErrorOccurred, "first", &log);
        bus.subscribe(EventKind::ErrorOccurred, |_| Err(HandlerError::new("boom")));
        recorder(&bus, EventKind::ErrorOccurred, "third", &log);

        let summary = bus.publish(EventKind::ErrorOccurred, json!({ "n": 1 }), "test");
        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(*log.lock(), vec!["first:1", "third:1"]);
    }

    #[test]
    fn panicking_handler_does_not_block_later_handlers() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::ErrorOccurred, |_| panic!("handler exploded"));
        recorder(&bus, EventKind::ErrorOccurred, "after", &log);

        let summary = bus.publish(EventKind::ErrorOccurred, json!({ "n": 7 }), "test");
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(*log.lock(), vec!["after:7"]);
    }

    #[test]
    fn subscribers_only_see_their_kind() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, EventKind::SafetyModeChanged, "safety", &log);

        bus.publish(EventKind::TrustScoreChanged, json!({ "n": 1 }), "test");
        assert!(log.lock().is_empty());

        bus.publish(EventKind::SafetyModeChanged, json!({ "n": 2 }), "test");
        assert_eq!(*log.lock(), vec!["safety:2"]);
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_a = log.clone();
        let id = bus.subscribe(EventKind::SnapshotCreated, move |_| {
            log_a.lock().push("a".to_string());
            Ok(())
        });
        recorder(&bus, EventKind::SnapshotCreated, "b", &log);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(EventKind::SnapshotCreated, json!({ "n": 0 }), "test");
        assert_eq!(*log.lock(), vec!["b:0"]);
    }

    #[test]
    fn clear_subscribers_empties_registry() {
        let bus = EventBus::new();
        bus.subscribe(EventKind::SystemStart, |_| Ok(()));
        bus.subscribe(EventKind::SystemShutdown, |_| Ok(()));
        bus.clear_subscribers();
        assert_eq!(bus.subscriber_count(EventKind::SystemStart), 0);
        assert_eq!(bus.subscriber_count(EventKind::SystemShutdown), 0);
    }

    #[test]
    fn handler_may_publish_reentrantly() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, EventKind::SafetyModeChanged, "inner", &log);

        let inner_bus = bus.clone();
        bus.subscribe(EventKind::EscalationTriggered, move |_| {
            inner_bus.publish(EventKind::SafetyModeChanged, json!({ "n": 9 }), "nested");
            Ok(())
        });

        let summary = bus.publish(EventKind::EscalationTriggered, json!({}), "test");
        assert_eq!(summary.delivered, 1);
        assert_eq!(*log.lock(), vec!["inner:9"]);
    }

    #[test]
    fn clones_share_subscribers() {
        let bus = EventBus::new();
        let clone = bus.clone();
        clone.subscribe(EventKind::SystemStart, |_| Ok(()));
        assert_eq!(bus.subscriber_count(EventKind::SystemStart), 1);
    }

    #[test]
    fn concurrent_publishers_each_reach_every_handler() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        bus.subscribe(EventKind::HeartbeatMissed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        bus.publish(EventKind::HeartbeatMissed, json!({}), "thread");
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("publisher thread");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }
}
