//! Cooperative cancellation for the long-lived routines.
//!
//! Every loop in the stack takes a [`Shutdown`] handle and races its work
//! against [`Shutdown::wait`]. Triggering is idempotent and fans out to
//! every clone.

use tokio::sync::watch;

/// The triggering side. Dropping it also releases all waiters.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

/// A clone-able waiter observed by tasks.
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a connected signal/waiter pair.
pub fn channel() -> (ShutdownSignal, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSignal { tx }, Shutdown { rx })
}

impl ShutdownSignal {
    /// Release every waiter. Safe to call more than once.
    pub fn trigger(&self) {
        // send_replace never fails: we hold a receiver-independent sender.
        let _ = self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    /// Resolve once the signal has been triggered (or its sender dropped).
    pub async fn wait(&mut self) {
        // An Err means the sender is gone, which we treat as triggered.
        let _ = self.rx.wait_for(|fired| *fired).await;
    }

    /// Non-blocking check, for loop guards.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}
