//! Delivery-order gate for tunnel frames.
//!
//! Tunnel data frames are handled concurrently but must be applied in
//! sequence order. Each tunnel direction owns a [`SequencedGate`]; a
//! frame with sequence `p` waits until the cursor reaches `p`, applies
//! its payload, then advances the cursor to wake the next frame.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

pub struct SequencedGate {
    cursor: AtomicU64,
    notify: Notify,
}

impl SequencedGate {
    pub fn new() -> Self {
        Self {
            cursor: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// The next sequence number due for delivery.
    pub fn current(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Wait until it is `seq`'s turn.
    pub async fn wait_for(&self, seq: u64) {
        loop {
            // Register interest before checking so an advance between
            // the check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.cursor.load(Ordering::Acquire) >= seq {
                return;
            }
            notified.await;
        }
    }

    /// Mark the current sequence number delivered and wake waiters.
    pub fn advance(&self) -> u64 {
        let next = self.cursor.fetch_add(1, Ordering::AcqRel) + 1;
        self.notify.notify_waiters();
        next
    }
}

impl Default for SequencedGate {
    fn default() -> Self {
        Self::new()
    }
}
