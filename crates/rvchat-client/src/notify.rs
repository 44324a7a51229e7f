//! The typed notification bus.
//!
//! Consumers register for [`ClientEvent`]s in one of two modes:
//!
//! - **Synchronous** handlers run serially on the publishing task and
//!   must not block.
//! - **Asynchronous** subscribers receive clones through a bounded
//!   queue; when the queue is full the oldest event is dropped and a
//!   per-subscriber counter incremented.
//!
//! Registration and removal are safe under concurrency. Removal marks
//! the subscriber; a handler removed during its own invocation finishes
//! the current call and is never invoked again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rvchat_types::event::ClientEvent;
use tokio::sync::Notify;

/// Synchronous handler signature.
pub type SyncHandler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Opaque subscription identifier, used for removal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

// ---------------------------------------------------------------------------
// Async queue
// ---------------------------------------------------------------------------

struct AsyncQueue {
    events: Mutex<VecDeque<ClientEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Receiving half of an asynchronous subscription.
pub struct AsyncSubscription {
    id: SubscriptionId,
    queue: Arc<AsyncQueue>,
}

impl AsyncSubscription {
    /// The subscription's identifier.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Number of events dropped because this subscriber was slow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Awaits the next event. Returns `None` once the subscription has
    /// been removed and the queue drained, or if the queue lock was
    /// poisoned by a panicking publisher.
    pub async fn recv(&self) -> Option<ClientEvent> {
        loop {
            {
                let mut events = match self.queue.events.lock() {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(error = %e, "notification queue lock poisoned");
                        return None;
                    }
                };
                if let Some(event) = events.pop_front() {
                    return Some(event);
                }
                if self.queue.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber bookkeeping
// ---------------------------------------------------------------------------

enum Sink {
    Sync(SyncHandler),
    Async(Arc<AsyncQueue>),
}

struct Subscriber {
    id: SubscriptionId,
    removed: Arc<AtomicBool>,
    sink: Sink,
}

// ---------------------------------------------------------------------------
// NotifyBus
// ---------------------------------------------------------------------------

/// The event bus. Cheap to clone via `Arc`.
pub struct NotifyBus {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl Default for NotifyBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a synchronous handler. It runs on the publishing task
    /// and must not block.
    pub fn register_sync(&self, handler: SyncHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(Arc::new(Subscriber {
                id,
                removed: Arc::new(AtomicBool::new(false)),
                sink: Sink::Sync(handler),
            })),
            Err(e) => {
                tracing::warn!(error = %e, "notify bus lock poisoned, handler not registered");
            }
        }
        id
    }

    /// Registers an asynchronous subscriber with a bounded queue.
    pub fn register_async(&self, capacity: usize) -> AsyncSubscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(AsyncQueue {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(Arc::new(Subscriber {
                id,
                removed: Arc::new(AtomicBool::new(false)),
                sink: Sink::Async(queue.clone()),
            })),
            Err(e) => {
                // The subscription is returned but will never fire.
                queue.closed.store(true, Ordering::Release);
                tracing::warn!(error = %e, "notify bus lock poisoned, subscriber not registered");
            }
        }
        AsyncSubscription { id, queue }
    }

    /// Removes a subscription. If its handler is currently running, the
    /// in-flight call completes; no further calls happen.
    pub fn unregister(&self, id: SubscriptionId) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers,
            Err(e) => {
                tracing::warn!(error = %e, "notify bus lock poisoned during unregister");
                return;
            }
        };
        if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
            let subscriber = subscribers.remove(pos);
            subscriber.removed.store(true, Ordering::Release);
            if let Sink::Async(queue) = &subscriber.sink {
                queue.closed.store(true, Ordering::Release);
                queue.notify.notify_waiters();
            }
        }
    }

    /// Publishes an event to all live subscribers.
    pub fn publish(&self, event: &ClientEvent) {
        // Copy-on-read snapshot; handlers run outside the lock.
        let snapshot: Vec<Arc<Subscriber>> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "notify bus lock poisoned, dropping event");
                return;
            }
        };

        for subscriber in snapshot {
            if subscriber.removed.load(Ordering::Acquire) {
                continue;
            }
            match &subscriber.sink {
                Sink::Sync(handler) => handler(event),
                Sink::Async(queue) => {
                    let mut events = match queue.events.lock() {
                        Ok(events) => events,
                        Err(e) => {
                            queue.dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(error = %e, "notification queue poisoned, dropping event");
                            continue;
                        }
                    };
                    if events.len() >= queue.capacity {
                        events.pop_front();
                        queue.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    events.push_back(event.clone());
                    drop(events);
                    queue.notify.notify_one();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn connectivity(reason: &str) -> ClientEvent {
        ClientEvent::Connectivity {
            connected: true,
            reason: reason.into(),
        }
    }

    #[test]
    fn sync_handler_sees_events() {
        let bus = NotifyBus::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        bus.register_sync(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(&connectivity("a"));
        bus.publish(&connectivity("b"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregistered_sync_handler_not_called() {
        let bus = NotifyBus::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let id = bus.register_sync(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(&connectivity("a"));
        bus.unregister(id);
        bus.publish(&connectivity("b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_subscriber_receives_in_order() {
        let bus = NotifyBus::new();
        let sub = bus.register_async(8);

        bus.publish(&connectivity("first"));
        bus.publish(&connectivity("second"));

        match sub.recv().await.unwrap() {
            ClientEvent::Connectivity { reason, .. } => assert_eq!(reason, "first"),
            other => panic!("unexpected event {other:?}"),
        }
        match sub.recv().await.unwrap() {
            ClientEvent::Connectivity { reason, .. } => assert_eq!(reason, "second"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = NotifyBus::new();
        let sub = bus.register_async(2);

        bus.publish(&connectivity("one"));
        bus.publish(&connectivity("two"));
        bus.publish(&connectivity("three"));

        assert_eq!(sub.dropped(), 1);
        match sub.recv().await.unwrap() {
            ClientEvent::Connectivity { reason, .. } => assert_eq!(reason, "two"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregister_closes_async_subscription() {
        let bus = NotifyBus::new();
        let sub = bus.register_async(4);

        bus.publish(&connectivity("last"));
        bus.unregister(sub.id());

        // Queued event drains, then the stream ends.
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
