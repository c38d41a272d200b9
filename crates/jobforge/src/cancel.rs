//! Cooperative cancellation signal handed to handlers (§4.4, §5).
//!
//! Kept as a small local primitive rather than pulling in `tokio-util`: the
//! engine only needs "notify once, readable many times", which a
//! `tokio::sync::watch` channel already gives us.

use tokio::sync::watch;

/// Clone of the cancellation signal observed by a running handler.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled. Handlers that poll in a loop
    /// can `tokio::select!` this against their own work.
    pub async fn cancelled(&mut self) {
        // A watch channel that's already true resolves immediately since
        // `borrow()` observes the current value before awaiting a change.
        if *self.rx.borrow() {
            return;
        }
        let _ = self.rx.changed().await;
    }
}

/// Owned by the Worker Pool; `cancel()` fires the signal to every clone of
/// the paired `CancelToken` (timeout firing, or shutdown). Cloneable since
/// both the running handler's timeout branch and its lease-renewal task need
/// to be able to trigger cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}
