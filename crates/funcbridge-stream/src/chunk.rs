//! The leaf chunk conduit.
//!
//! A bounded tokio mpsc channel carrying `Bytes`, wrapped so that the
//! end-of-body protocol is enforced on both sides. Chunks flow in one
//! direction only and arrive in strict FIFO order. The sending side
//! suspends whenever the bound is reached, which is what bounds memory to
//! the in-flight chunk count rather than the body size.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::mpsc;

use crate::abort::AbortSignal;
use crate::StreamError;

/// Default bound on in-flight chunks per conduit.
pub const DEFAULT_CHUNK_CAPACITY: usize = 1;

/// Create a connected conduit with the given in-flight bound.
pub fn chunk_pair(capacity: usize) -> (ChunkSender, BodyStream) {
    assert!(capacity > 0, "chunk capacity must be > 0");
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChunkSender {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        },
        BodyStream {
            rx,
            ended: false,
            abort: None,
        },
    )
}

/// Push side of a chunk conduit.
///
/// Clones share the closed flag, so a close observed through any clone is
/// binding for all of them.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    tx: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl ChunkSender {
    /// Push one chunk, suspending until the receiver has made room.
    ///
    /// A zero-length chunk is the wire-level end marker, so sending one is
    /// identical to calling [`close`](Self::close).
    pub async fn send(&self, chunk: Bytes) -> Result<(), StreamError> {
        if chunk.is_empty() {
            return self.close().await;
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::WriteAfterClose);
        }
        self.tx
            .send(chunk)
            .await
            .map_err(|_| StreamError::Disconnected)
    }

    /// Signal end of body. Idempotent: the first call sends the end
    /// marker, later calls are no-ops.
    pub async fn close(&self) -> Result<(), StreamError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.tx
            .send(Bytes::new())
            .await
            .map_err(|_| StreamError::Disconnected)
    }

    /// Latch the closed flag without delivering an end marker. Used when
    /// the peer has already gone away and delivery would suspend forever.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Pull side of a chunk conduit: a lazy, finite, non-restartable sequence
/// of byte chunks.
///
/// The first end marker (zero-length chunk or sender close) latches the
/// stream; pulling again afterwards is a [`StreamError::PullAfterEnd`].
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::Receiver<Bytes>,
    ended: bool,
    abort: Option<AbortSignal>,
}

impl BodyStream {
    /// Attach a cancellation signal; pending pulls fail fast with
    /// [`StreamError::Aborted`] once it fires.
    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    /// Pull the next chunk. `Ok(None)` is the single end-of-body result.
    pub async fn pull(&mut self) -> Result<Option<Bytes>, StreamError> {
        if self.ended {
            return Err(StreamError::PullAfterEnd);
        }
        let received = match self.abort.clone() {
            Some(mut signal) => {
                if signal.is_aborted() {
                    self.ended = true;
                    return Err(StreamError::Aborted);
                }
                tokio::select! {
                    _ = signal.aborted() => {
                        self.ended = true;
                        return Err(StreamError::Aborted);
                    }
                    received = self.rx.recv() => received,
                }
            }
            None => self.rx.recv().await,
        };
        self.settle(received)
    }

    fn settle(&mut self, received: Option<Bytes>) -> Result<Option<Bytes>, StreamError> {
        match received {
            Some(chunk) if chunk.is_empty() => {
                self.ended = true;
                Ok(None)
            }
            Some(chunk) => Ok(Some(chunk)),
            None => {
                // All senders dropped without an end marker.
                self.ended = true;
                Err(StreamError::Disconnected)
            }
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

impl Stream for BodyStream {
    type Item = Result<Bytes, StreamError>;

    /// `Stream` adaptor over the same conduit: the end marker becomes the
    /// stream's `None`, a vanished peer becomes one `Err` item. The abort
    /// signal is only consulted by [`pull`](BodyStream::pull).
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(received) => match this.settle(received) {
                Ok(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
                Ok(None) => Poll::Ready(None),
                Err(err) => Poll::Ready(Some(Err(err))),
            },
        }
    }
}
