//! Run-scoped cooperative cancellation.
//!
//! Every suspension point in a run (provider stream read, tool await,
//! approval await) races against [`Interrupt::cancelled`]. The handle is
//! cloneable and scoped to one run; concurrent runs never observe each
//! other's signals. Cancellation is out-of-band — it is never a wire
//! message.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Marker error propagated when a run is cancelled.
#[derive(Debug)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

/// Cloneable cancellation signal for one run.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; idempotent.
    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Waits until cancellation is requested. Returns immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}
