//! One-shot readiness latch
//!
//! Closed at most once. Waiters that arrive before closure block; every
//! waiter after closure returns immediately.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Latch { tx }
    }

    /// Close the latch. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                return false;
            }
            *closed = true;
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is closed.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            // The sender lives as long as `self`.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
