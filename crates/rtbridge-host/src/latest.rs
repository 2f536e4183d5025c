//! Single-slot "latest value" cell
//!
//! Writers overwrite the pending value and never block. The reader takes
//! the newest unconsumed value; anything overwritten before it was taken is
//! gone for good.

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

pub struct LatestCell<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

impl<T> LatestCell<T> {
    pub fn new() -> Self {
        LatestCell {
            slot: Mutex::new(Slot {
                value: None,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Store `value`, returning the unconsumed value it replaced.
    pub fn put(&self, value: T) -> Option<T> {
        let replaced = {
            let mut slot = self.slot.lock();
            if slot.closed {
                return None;
            }
            slot.value.replace(value)
        };
        self.notify.notify_one();
        replaced
    }

    /// Mark the producer side finished. A pending value can still be taken.
    pub fn close(&self) {
        self.slot.lock().closed = true;
        self.notify.notify_one();
    }

    /// Take the pending value without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().value.take()
    }

    /// Wait for the next value. `None` once closed and drained.
    pub async fn take(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut slot = self.slot.lock();
                if let Some(value) = slot.value.take() {
                    return Some(value);
                }
                if slot.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl<T> Default for LatestCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
