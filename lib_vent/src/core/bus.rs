//! # Typed Topic Event Bus
//!
//! The only channel through which the control plane's actors talk to each other.
//!
//! ## Contract:
//!
//! 1.  **One strongly typed topic per event shape**: [`EventBus`] exposes a
//!     [`Topic<T>`] for every kind of event, so subscribers never inspect payload
//!     types at runtime.
//!
//! 2.  **Bounded queues, blocking publish**: every persistent subscriber owns a queue
//!     of `capacity` entries (10 by default). [`Topic::publish`] waits for room in
//!     each subscriber's queue in turn, so a slow subscriber throttles the publisher
//!     and, transitively, the whole bus. Subscribers must drain promptly.
//!
//! 3.  **One-shot subscriptions**: [`Topic::subscribe_once`] returns a receiver that
//!     fires at most once and is detached by the publish that fills it.
//!
//! 4.  **Cooperative shutdown**: the `shutdown` topic is published exactly once at
//!     teardown ([`EventBus::shutdown`]); every actor holds a one-shot subscription
//!     from [`EventBus::on_shutdown`] and leaves its loop on receipt. Subscriptions
//!     taken after teardown began fire immediately.
//!
//! Subscribers whose receiving half was dropped are pruned on the next publish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};

use crate::core::model::{ChangeRequest, LockChange, VentilationState};

/// Per-subscriber queue capacity used by [`EventBus::new`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

enum SubscriberSender<T> {
    Persistent(mpsc::Sender<T>),
    Once(oneshot::Sender<T>),
}

struct SubscriberHandle<T> {
    id: u64,
    sender: SubscriberSender<T>,
}

/// # Topic
///
/// A named fan-out point for values of one type.
pub struct Topic<T> {
    name: &'static str,
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<SubscriberHandle<T>>>,
}

/// The receiving end of a persistent subscription.
///
/// Hand it back to [`Topic::unsubscribe`] to stop delivery; dropping it has the same
/// effect from the next publish on.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Waits for the next value. `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Takes a queued value without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Topic<T> {
    /// Creates an empty topic whose subscribers get queues of `capacity` entries.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SubscriberHandle<T>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a persistent subscriber with a bounded queue.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(SubscriberHandle { id, sender: SubscriberSender::Persistent(tx) });
        log::debug!("bus: subscriber {} attached to '{}'", id, self.name);
        Subscription { id, rx }
    }

    /// Registers a subscriber that receives at most one value and then detaches.
    pub fn subscribe_once(&self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(SubscriberHandle { id, sender: SubscriberSender::Once(tx) });
        rx
    }

    /// Stops delivery to `subscription`.
    pub fn unsubscribe(&self, subscription: Subscription<T>) {
        self.lock().retain(|s| s.id != subscription.id);
        log::debug!("bus: subscriber {} detached from '{}'", subscription.id, self.name);
    }

    /// Number of attached subscribers, one-shot ones included.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

impl<T: Clone> Topic<T> {
    /// # Publish
    ///
    /// Delivers `value` to every current subscriber and returns how many received it.
    ///
    /// One-shot subscribers are served first and detached. Persistent subscribers are
    /// served in registration order; when a queue is full this call waits until that
    /// subscriber drains an entry. Subscribers that went away are removed.
    pub async fn publish(&self, value: T) -> usize {
        let mut once = Vec::new();
        let mut persistent = Vec::new();
        {
            let mut subs = self.lock();
            for handle in std::mem::take(&mut *subs) {
                match handle.sender {
                    SubscriberSender::Once(tx) => once.push(tx),
                    SubscriberSender::Persistent(tx) => {
                        persistent.push((handle.id, tx.clone()));
                        subs.push(SubscriberHandle {
                            id: handle.id,
                            sender: SubscriberSender::Persistent(tx),
                        });
                    }
                }
            }
        }

        let mut delivered = 0;
        for tx in once {
            if tx.send(value.clone()).is_ok() {
                delivered += 1;
            }
        }

        let mut gone = Vec::new();
        for (id, tx) in persistent {
            match tx.send(value.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => gone.push(id),
            }
        }

        if !gone.is_empty() {
            self.lock().retain(|s| !gone.contains(&s.id));
            log::debug!("bus: pruned {} closed subscriber(s) from '{}'", gone.len(), self.name);
        }
        delivered
    }
}

/// # Event Bus
///
/// The set of topics shared by every actor. Cheap to share behind an `Arc`.
pub struct EventBus {
    /// Proposed ventilation states, consumed by the arbitration engine.
    pub change_requests: Topic<ChangeRequest>,
    /// Proposed lock changes, consumed by the arbitration engine.
    pub lock_changes: Topic<LockChange>,
    /// Every accepted canonical state, lock flags embedded.
    pub state_changed: Topic<VentilationState>,
    /// Pre-encoded JSON for every connected websocket client.
    pub json_to_all: Topic<Arc<str>>,
    /// New clients ask for the last broadcast snapshot by publishing a sink here.
    pub snapshot_requests: Topic<mpsc::Sender<Arc<str>>>,
    /// Published exactly once at process teardown.
    pub shutdown: Topic<()>,
    shutdown_sent: AtomicBool,
}

impl EventBus {
    /// A bus with the default queue capacity of 10 per subscriber.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// A bus whose subscribers get queues of `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            change_requests: Topic::new("changerequest", capacity),
            lock_changes: Topic::new("lockchange", capacity),
            state_changed: Topic::new("stateschanged", capacity),
            json_to_all: Topic::new("jsontoall", capacity),
            snapshot_requests: Topic::new("initialbytes", capacity),
            shutdown: Topic::new("shutdown", capacity),
            shutdown_sent: AtomicBool::new(false),
        }
    }

    /// Publishes the shutdown signal. Only the first call has an effect.
    pub async fn shutdown(&self) {
        if self.shutdown_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let n = self.shutdown.publish(()).await;
        log::info!("bus: shutdown delivered to {} actor(s)", n);
    }

    /// One-shot subscription to the shutdown signal. Resolves at once when
    /// [`EventBus::shutdown`] has already been called.
    pub fn on_shutdown(&self) -> oneshot::Receiver<()> {
        let rx = self.shutdown.subscribe_once();
        if !self.shutdown_sent.load(Ordering::SeqCst) {
            return rx;
        }
        let (tx, fired) = oneshot::channel();
        let _ = tx.send(());
        fired
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let topic: Topic<u32> = Topic::new("t", 4);
        let mut a = topic.subscribe();
        let mut b = topic.subscribe();
        assert_eq!(topic.publish(7).await, 2);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn once_subscription_fires_a_single_time_and_detaches() {
        let topic: Topic<u32> = Topic::new("t", 4);
        let once = topic.subscribe_once();
        assert_eq!(topic.subscriber_count(), 1);
        topic.publish(1).await;
        assert_eq!(topic.subscriber_count(), 0);
        assert_eq!(once.await.ok(), Some(1));
        assert_eq!(topic.publish(2).await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let topic: Topic<u32> = Topic::new("t", 4);
        let sub = topic.subscribe();
        let mut other = topic.subscribe();
        topic.unsubscribe(sub);
        assert_eq!(topic.publish(3).await, 1);
        assert_eq!(other.recv().await, Some(3));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let topic: Topic<u32> = Topic::new("t", 4);
        drop(topic.subscribe());
        assert_eq!(topic.publish(1).await, 0);
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_blocks_the_publisher_until_drained() {
        let topic = Arc::new(Topic::<u32>::new("t", 1));
        let mut sub = topic.subscribe();
        topic.publish(1).await;

        let publisher = {
            let topic = Arc::clone(&topic);
            tokio::spawn(async move { topic.publish(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publisher.is_finished(), "publish must wait for room in the queue");

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(publisher.await.unwrap(), 1);
        assert_eq!(sub.recv().await, Some(2));
    }

    #[tokio::test]
    async fn shutdown_is_published_once() {
        let bus = EventBus::new();
        let first = bus.shutdown.subscribe_once();
        bus.shutdown().await;
        let late = bus.shutdown.subscribe_once();
        bus.shutdown().await;
        assert!(first.await.is_ok());
        assert_eq!(bus.shutdown.subscriber_count(), 1, "second call must not publish");
        drop(late);
    }

    #[tokio::test]
    async fn shutdown_subscription_taken_late_fires_at_once() {
        let bus = EventBus::new();
        let early = bus.on_shutdown();
        bus.shutdown().await;
        assert!(early.await.is_ok());

        let late = bus.on_shutdown();
        let fired = tokio::time::timeout(Duration::from_millis(50), late).await;
        assert!(matches!(fired, Ok(Ok(()))));
    }
}
