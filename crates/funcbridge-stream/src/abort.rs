//! Request cancellation signaling.
//!
//! The host flips the signal when the client disconnects (or when it wants
//! to cancel a request for any other reason); every pending chunk pull or
//! push observing the signal fails fast with [`StreamError::Aborted`]
//! instead of hanging on a peer that will never make progress.

use tokio::sync::watch;

/// Host-side trigger for cancelling one request.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Flip the signal. Idempotent.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Guest-side view of the cancellation signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the request is aborted.
    ///
    /// If the handle is dropped without ever aborting, the future never
    /// resolves — dropping the host side of a request is not a
    /// cancellation, it shows up as a transport error on the channels
    /// instead.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected handle/signal pair for one request.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}
