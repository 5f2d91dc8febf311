//! Observable value with independent subscriber queues
//!
//! Each [`Watch`] owns a bounded queue. When a slow subscriber falls behind
//! the oldest queued update is dropped, so the latest value always arrives.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{CoordError, Result};

const COMPONENT: &str = "watchable";

/// Default per-subscriber queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// A value tagged with the watchable's update counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

struct Subscriber<T> {
    queue: Mutex<VecDeque<Versioned<T>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> Subscriber<T> {
    fn push(&self, item: Versioned<T>, capacity: usize) {
        let mut queue = self.queue.lock();
        while queue.len() >= capacity.max(1) {
            queue.pop_front();
        }
        queue.push_back(item);
        drop(queue);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

struct State<T> {
    current: Option<Versioned<T>>,
    version: u64,
    next_id: u64,
    subscribers: HashMap<u64, Arc<Subscriber<T>>>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: usize,
}

/// A value that can be updated and watched for changes
pub struct Watchable<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone> Watchable<T> {
    /// Create an empty watchable
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create an empty watchable whose subscribers queue at most `capacity` updates
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    current: None,
                    version: 0,
                    next_id: 0,
                    subscribers: HashMap::new(),
                    closed: false,
                }),
                capacity,
            }),
        }
    }

    /// Latest value, if any
    pub fn get(&self) -> Option<Versioned<T>> {
        self.shared.state.lock().current.clone()
    }

    /// Publish a new value to every subscriber, returning its version
    pub fn update(&self, value: T) -> Result<u64> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(CoordError::AlreadyClosed { component: COMPONENT });
        }
        state.version += 1;
        let item = Versioned {
            version: state.version,
            value,
        };
        for sub in state.subscribers.values() {
            sub.push(item.clone(), self.shared.capacity);
        }
        let version = item.version;
        state.current = Some(item);
        Ok(version)
    }

    /// Subscribe to updates; the current value, if any, is delivered first
    pub fn watch(&self) -> Result<Watch<T>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(CoordError::AlreadyClosed { component: COMPONENT });
        }
        let subscriber = Arc::new(Subscriber {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        if let Some(current) = state.current.clone() {
            subscriber.push(current, self.shared.capacity);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.subscribers.insert(id, subscriber.clone());

        Ok(Watch {
            id,
            subscriber,
            shared: self.shared.clone(),
        })
    }

    /// Number of open subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Close the watchable; pending updates are still drained by subscribers
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for (_, sub) in state.subscribers.drain() {
            sub.close();
        }
    }
}

impl<T: Clone> Default for Watchable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Watchable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Subscription handle returned by [`Watchable::watch`]
pub struct Watch<T> {
    id: u64,
    subscriber: Arc<Subscriber<T>>,
    shared: Arc<Shared<T>>,
}

impl<T: Clone> Watch<T> {
    /// Wait for the next update; `None` once the watch or its source is closed
    pub async fn next(&mut self) -> Option<Versioned<T>> {
        loop {
            if let Some(item) = self.try_next() {
                return Some(item);
            }
            if self.subscriber.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.subscriber.notify.notified().await;
        }
    }

    /// Pop a queued update without waiting
    pub fn try_next(&mut self) -> Option<Versioned<T>> {
        self.subscriber.queue.lock().pop_front()
    }

    /// Latest value of the underlying watchable
    pub fn get(&self) -> Option<Versioned<T>> {
        self.shared.state.lock().current.clone()
    }

    /// Whether this handle will deliver no further updates
    pub fn is_closed(&self) -> bool {
        self.subscriber.closed.load(Ordering::SeqCst)
    }
}

impl<T> Watch<T> {
    /// Stop receiving updates; other handles are unaffected
    pub fn close(&mut self) {
        self.shared.state.lock().subscribers.remove(&self.id);
        self.subscriber.close();
    }
}

impl<T> Drop for Watch<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_watch_receives_current_then_updates() {
        let watchable = Watchable::new();
        watchable.update(1).unwrap();

        let mut watch = watchable.watch().unwrap();
        watchable.update(2).unwrap();

        assert_eq!(watch.next().await.unwrap().value, 1);
        assert_eq!(watch.next().await.unwrap().value, 2);
        assert!(watch.try_next().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_keeps_latest() {
        let watchable = Watchable::with_capacity(2);
        let mut watch = watchable.watch().unwrap();
        for i in 0..10 {
            watchable.update(i).unwrap();
        }

        assert_eq!(watch.next().await.unwrap().value, 8);
        assert_eq!(watch.next().await.unwrap().value, 9);
        assert_eq!(watch.get().unwrap().version, 10);
    }

    #[tokio::test]
    async fn test_close_one_handle_leaves_others() {
        let watchable = Watchable::new();
        let mut a = watchable.watch().unwrap();
        let mut b = watchable.watch().unwrap();
        assert_eq!(watchable.subscriber_count(), 2);

        a.close();
        assert_eq!(watchable.subscriber_count(), 1);
        assert!(a.next().await.is_none());

        watchable.update("x").unwrap();
        assert_eq!(b.next().await.unwrap().value, "x");
    }

    #[tokio::test]
    async fn test_close_wakes_pending_next() {
        let watchable: Watchable<u32> = Watchable::new();
        let mut watch = watchable.watch().unwrap();

        let waiter = tokio::spawn(async move { watch.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        watchable.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(result.is_none());
        assert!(watchable.watch().is_err());
        assert!(watchable.update(1).is_err());
    }
}
