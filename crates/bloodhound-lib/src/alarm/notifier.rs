//! Alarm event delivery
//!
//! Listeners either register a handler for one event kind or take a broadcast
//! receiver carrying every event. Handlers run on the tick that produced the
//! event, after the engine lock has been released, so a handler may call back
//! into the engine or stop the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::{AlarmEvent, AlarmEventKind};

/// Default capacity of the broadcast event channel
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

type Handler = Arc<dyn Fn(&AlarmEvent) + Send + Sync>;

/// Returned by [`AlarmNotifier::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: AlarmEventKind,
    handler: Handler,
}

/// Fan-out point for alarm events
pub struct AlarmNotifier {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    events_tx: broadcast::Sender<AlarmEvent>,
}

impl AlarmNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a notifier whose broadcast channel holds `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            events_tx,
        }
    }

    /// Register `handler` for every event of `kind`
    pub fn subscribe<F>(&self, kind: AlarmEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&AlarmEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a handler; returns false if it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Receiver for all events published after this call
    pub fn events(&self) -> broadcast::Receiver<AlarmEvent> {
        self.events_tx.subscribe()
    }

    pub fn handler_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Deliver `events` in order to handlers and channel receivers
    pub fn publish(&self, events: &[AlarmEvent]) {
        for event in events {
            // Snapshot the handlers so they can (un)subscribe while running
            let handlers: Vec<Handler> = self
                .subscriptions
                .read()
                .iter()
                .filter(|s| s.kind == event.kind)
                .map(|s| Arc::clone(&s.handler))
                .collect();

            for handler in handlers {
                handler(event);
            }

            if self.events_tx.send(event.clone()).is_err() {
                trace!(key = %event.key, kind = %event.kind, "No channel receivers for alarm event");
            }
        }
    }
}

impl Default for AlarmNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handlers_receive_only_their_kind() {
        let notifier = AlarmNotifier::new();
        let triggered = Arc::new(AtomicUsize::new(0));
        let resolved = Arc::new(AtomicUsize::new(0));

        let t = triggered.clone();
        notifier.subscribe(AlarmEventKind::Triggered, move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });
        let r = resolved.clone();
        notifier.subscribe(AlarmEventKind::Resolved, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let now = Utc::now();
        notifier.publish(&[
            AlarmEvent::triggered("a", 30.0, now),
            AlarmEvent::triggered("b", 25.0, now),
            AlarmEvent::resolved("a", 5.0, now),
        ]);

        assert_eq!(triggered.load(Ordering::SeqCst), 2);
        assert_eq!(resolved.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let notifier = AlarmNotifier::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = notifier.subscribe(AlarmEventKind::Triggered, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        notifier.publish(&[AlarmEvent::triggered("a", 30.0, Utc::now())]);
        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        notifier.publish(&[AlarmEvent::triggered("a", 30.0, Utc::now())]);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.handler_count(), 0);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let notifier = Arc::new(AlarmNotifier::new());
        let slot: Arc<RwLock<Option<SubscriptionId>>> = Arc::new(RwLock::new(None));

        let n = Arc::downgrade(&notifier);
        let s = slot.clone();
        let id = notifier.subscribe(AlarmEventKind::Resolved, move |_| {
            if let (Some(notifier), Some(id)) = (n.upgrade(), *s.read()) {
                notifier.unsubscribe(id);
            }
        });
        *slot.write() = Some(id);

        notifier.publish(&[AlarmEvent::resolved("a", 1.0, Utc::now())]);
        assert_eq!(notifier.handler_count(), 0);
    }

    #[test]
    fn test_channel_receives_events_in_order() {
        let notifier = AlarmNotifier::new();
        let mut rx = notifier.events();

        let now = Utc::now();
        notifier.publish(&[
            AlarmEvent::triggered("first", 40.0, now),
            AlarmEvent::resolved("second", 1.0, now),
        ]);

        assert_eq!(rx.try_recv().unwrap().key, "first");
        assert_eq!(rx.try_recv().unwrap().key, "second");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_receivers_is_fine() {
        let notifier = AlarmNotifier::new();
        notifier.publish(&[AlarmEvent::triggered("a", 30.0, Utc::now())]);
    }
}
