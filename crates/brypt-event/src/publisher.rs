//! The event publisher.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::warn;

use crate::{Event, EventKind};

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Collects subscriptions during startup, then dispatches published
/// events to them in insertion order.
///
/// Lifecycle: construct on the subscriber thread, `advertise` the kinds
/// the runtime will emit, `subscribe` listeners for each, then
/// `suspend_subscriptions` before any thread publishes. After suspension
/// the listener table is frozen and dispatch reads it without locking.
pub struct EventPublisher {
    subscriber_thread: ThreadId,
    suspended: AtomicBool,
    pending: Mutex<PendingSubscriptions>,
    listeners: OnceLock<HashMap<EventKind, Vec<Listener>>>,
    advertised: OnceLock<HashSet<EventKind>>,
    events: Mutex<VecDeque<Event>>,
}

#[derive(Default)]
struct PendingSubscriptions {
    listeners: HashMap<EventKind, Vec<Listener>>,
    advertised: HashSet<EventKind>,
    listener_count: usize,
}

impl EventPublisher {
    /// Construct on the thread that will perform all subscriptions.
    pub fn new() -> Self {
        Self {
            subscriber_thread: thread::current().id(),
            suspended: AtomicBool::new(false),
            pending: Mutex::new(PendingSubscriptions::default()),
            listeners: OnceLock::new(),
            advertised: OnceLock::new(),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Declare an event kind the runtime will emit.
    pub fn advertise(&self, kind: EventKind) {
        assert!(
            !self.is_suspended(),
            "advertisements must precede suspension"
        );
        self.pending.lock().advertised.insert(kind);
    }

    /// Register a listener for an event kind.
    ///
    /// Returns whether the subscription was accepted. Only the
    /// constructing thread may subscribe, and only before suspension.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> bool
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        assert_eq!(
            thread::current().id(),
            self.subscriber_thread,
            "subscriptions are restricted to the constructing thread"
        );
        if self.is_suspended() {
            warn!(?kind, "Rejecting subscription after suspension");
            return false;
        }

        let mut pending = self.pending.lock();
        pending
            .listeners
            .entry(kind)
            .or_default()
            .push(Box::new(listener));
        pending.listener_count += 1;
        true
    }

    /// Freeze the listener table. Must run before the first dispatch.
    ///
    /// Verifies the startup contract: every advertised kind has at least
    /// one listener and no listener watches an unadvertised kind.
    pub fn suspend_subscriptions(&self) -> bool {
        assert_eq!(
            thread::current().id(),
            self.subscriber_thread,
            "suspension is restricted to the constructing thread"
        );
        if self.suspended.swap(true, Ordering::SeqCst) {
            return true;
        }

        let pending = std::mem::take(&mut *self.pending.lock());
        let matched = pending
            .advertised
            .iter()
            .all(|kind| pending.listeners.contains_key(kind))
            && pending
                .listeners
                .keys()
                .all(|kind| pending.advertised.contains(kind));
        if !matched {
            warn!(
                advertised = pending.advertised.len(),
                subscribed = pending.listeners.len(),
                "Advertised event kinds do not match the listener set"
            );
        }

        let _ = self.listeners.set(pending.listeners);
        let _ = self.advertised.set(pending.advertised);
        matched
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        match self.listeners.get() {
            Some(listeners) => listeners.contains_key(&kind),
            None => self.pending.lock().listeners.contains_key(&kind),
        }
    }

    pub fn is_advertised(&self, kind: EventKind) -> bool {
        match self.advertised.get() {
            Some(advertised) => advertised.contains(&kind),
            None => self.pending.lock().advertised.contains(&kind),
        }
    }

    /// Number of distinct advertised kinds.
    pub fn advertised_count(&self) -> usize {
        match self.advertised.get() {
            Some(advertised) => advertised.len(),
            None => self.pending.lock().advertised.len(),
        }
    }

    /// Number of registered listeners across all kinds.
    pub fn listener_count(&self) -> usize {
        match self.listeners.get() {
            Some(listeners) => listeners.values().map(Vec::len).sum(),
            None => self.pending.lock().listener_count,
        }
    }

    /// Number of events waiting for dispatch.
    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Queue an event for the next dispatch. Callable from any thread.
    pub fn publish(&self, event: Event) {
        self.events.lock().push_back(event);
    }

    /// Deliver every queued event to its listeners, in publication order.
    /// Returns the number of events delivered.
    pub fn dispatch(&self) -> usize {
        assert!(
            self.is_suspended(),
            "subscriptions must be suspended before dispatch"
        );
        let Some(listeners) = self.listeners.get() else {
            return 0;
        };

        let mut delivered = 0;
        loop {
            // Pop one event at a time so listeners may publish follow-ups
            // without deadlocking on the queue mutex.
            let Some(event) = self.events.lock().pop_front() else {
                break;
            };
            if let Some(registered) = listeners.get(&event.kind()) {
                for listener in registered {
                    listener(&event);
                }
            }
            delivered += 1;
        }
        delivered
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_dispatch_delivers_in_order() {
        let publisher = EventPublisher::new();
        publisher.advertise(EventKind::RuntimeStarted);
        publisher.advertise(EventKind::RuntimeStopped);

        let order = Arc::new(Mutex::new(Vec::new()));
        let started = order.clone();
        publisher.subscribe(EventKind::RuntimeStarted, move |_| {
            started.lock().push("started");
        });
        let stopped = order.clone();
        publisher.subscribe(EventKind::RuntimeStopped, move |_| {
            stopped.lock().push("stopped");
        });

        assert!(publisher.suspend_subscriptions());

        publisher.publish(Event::RuntimeStarted);
        publisher.publish(Event::RuntimeStopped);
        assert_eq!(publisher.event_count(), 2);
        assert_eq!(publisher.dispatch(), 2);
        assert_eq!(*order.lock(), vec!["started", "stopped"]);
        assert_eq!(publisher.event_count(), 0);
    }

    #[test]
    fn test_listener_and_advertised_parity() {
        let publisher = EventPublisher::new();
        publisher.advertise(EventKind::RuntimeStarted);
        publisher.subscribe(EventKind::RuntimeStarted, |_| {});
        assert_eq!(publisher.advertised_count(), 1);
        assert_eq!(publisher.listener_count(), 1);
        assert!(publisher.suspend_subscriptions());
    }

    #[test]
    fn test_unmatched_advertisement_detected() {
        let publisher = EventPublisher::new();
        publisher.advertise(EventKind::RuntimeStarted);
        publisher.advertise(EventKind::RuntimeStopped);
        publisher.subscribe(EventKind::RuntimeStarted, |_| {});
        assert!(!publisher.suspend_subscriptions());
    }

    #[test]
    fn test_subscription_rejected_after_suspension() {
        let publisher = EventPublisher::new();
        publisher.suspend_subscriptions();
        assert!(!publisher.subscribe(EventKind::RuntimeStarted, |_| {}));
    }

    #[test]
    fn test_dispatch_counts_multiple_listeners_once_per_event() {
        let publisher = EventPublisher::new();
        publisher.advertise(EventKind::RuntimeStarted);

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            publisher.subscribe(EventKind::RuntimeStarted, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        publisher.suspend_subscriptions();

        publisher.publish(Event::RuntimeStarted);
        assert_eq!(publisher.dispatch(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unsubscribed_kind_still_drains() {
        let publisher = EventPublisher::new();
        publisher.advertise(EventKind::RuntimeStarted);
        publisher.subscribe(EventKind::RuntimeStarted, |_| {});
        publisher.suspend_subscriptions();

        publisher.publish(Event::RuntimeStopped);
        assert_eq!(publisher.dispatch(), 1);
        assert_eq!(publisher.event_count(), 0);
    }
}
