//! Event subscriptions
//!
//! A [`Subscription`] pairs an event receiver with a close hook. Closing
//! (explicitly or by drop) detaches the receiver from its source, so a
//! dropped handle never keeps a publisher slot alive.
//!
//! [`Topic`] is the publishing side used by in-process sources: publishing
//! never blocks, whatever the speed of the subscribers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

type CloseHook = Box<dyn FnOnce() + Send + 'static>;

/// Receiving half of an event source
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_close: Option<CloseHook>,
}

impl<T> Subscription<T> {
    /// Subscription that runs `on_close` exactly once when closed or dropped.
    pub fn new<F>(rx: mpsc::UnboundedReceiver<T>, on_close: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Subscription {
            rx,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Next event, or `None` once the source has gone away.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.rx.close();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("open", &self.on_close.is_some())
            .finish()
    }
}

struct TopicInner<T> {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<T>>>,
}

/// Fan-out publisher
pub struct Topic<T> {
    inner: Arc<TopicInner<T>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Topic {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Topic<T> {
    pub fn new() -> Self {
        Topic {
            inner: Arc::new(TopicInner {
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(id, tx);

        let inner: Weak<TopicInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(rx, move || {
            if let Some(inner) = inner.upgrade() {
                inner.subscribers.lock().remove(&id);
            }
        })
    }

    /// Deliver `value` to every live subscriber. Returns how many received it.
    pub fn publish(&self, value: T) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|_, tx| tx.send(value.clone()).is_ok());
        subscribers.len()
    }

    /// Drop every subscriber; their receivers observe end of stream.
    pub fn close(&self) {
        self.inner.subscribers.lock().clear();
    }

    /// Currently open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Subscriptions ever opened on this topic.
    pub fn total_subscriptions(&self) -> u64 {
        self.inner.next_id.load(Ordering::Relaxed)
    }
}
