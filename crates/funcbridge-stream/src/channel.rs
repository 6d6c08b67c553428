//! Per-request host↔guest channel pair.
//!
//! One request owns exactly one pair for its whole lifetime:
//!
//! ```text
//! HostChannel                            RequestChannel (guest)
//!   push_request_chunk ──────────────────▶ read_request_chunk
//!   response_head      ◀────────────────── set_response (once)
//!   next_response_chunk ◀───────────────── write_response_chunk
//!   abort()            ─ ─ ─ ─ ─ ─ ─ ─ ─ ▶ (pending ops fail fast)
//! ```
//!
//! The request-body conduit exists only for bodied methods; `GET`/`HEAD`
//! requests read end-of-body immediately no matter what the host-side
//! transport delivered.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;

use funcbridge_proto::{RequestId, RequestMetadata, ResponseHead};

use crate::abort::{abort_pair, AbortHandle, AbortSignal};
use crate::chunk::{chunk_pair, BodyStream, ChunkSender};
use crate::StreamError;

/// Build the channel pair for one request.
///
/// `capacity` bounds the in-flight chunk count per direction.
pub fn request_pair(
    id: RequestId,
    metadata: RequestMetadata,
    capacity: usize,
) -> (HostChannel, RequestChannel) {
    let (abort_handle, abort_signal) = abort_pair();
    let (response_tx, response_rx) = chunk_pair(capacity);
    let (head_tx, head_rx) = oneshot::channel();

    let (request_tx, request_rx) = if metadata.is_bodyless() {
        (None, None)
    } else {
        let (tx, rx) = chunk_pair(capacity);
        (Some(tx), Some(rx.with_abort(abort_signal.clone())))
    };

    let host = HostChannel {
        id,
        request_body: request_tx,
        head_rx: Some(head_rx),
        response_body: response_rx,
        abort: abort_handle,
    };
    let guest = RequestChannel {
        id,
        metadata,
        request_body: request_rx,
        outlet: ResponseOutlet {
            head_tx: Arc::new(Mutex::new(Some(head_tx))),
            body: response_tx,
            abort: abort_signal.clone(),
        },
        abort: abort_signal,
    };
    (host, guest)
}

/// Guest-side capability surface for one request.
#[derive(Debug)]
pub struct RequestChannel {
    id: RequestId,
    metadata: RequestMetadata,
    request_body: Option<BodyStream>,
    outlet: ResponseOutlet,
    abort: AbortSignal,
}

impl RequestChannel {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Pull the next request-body chunk.
    ///
    /// For bodyless methods there is no conduit at all and every call
    /// reports end of body.
    pub async fn read_request_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        match &mut self.request_body {
            Some(body) => body.pull().await,
            None => Ok(None),
        }
    }

    /// Split into the pieces the adapter hands out: the request body
    /// stream (if any) for the guest request value, and the response
    /// outlet shared with the handler invocation.
    pub fn into_parts(self) -> (RequestId, RequestMetadata, Option<BodyStream>, ResponseOutlet, AbortSignal)
    {
        (
            self.id,
            self.metadata,
            self.request_body,
            self.outlet,
            self.abort,
        )
    }
}

/// Push side of the guest's response: announce-once head, then body
/// chunks.
///
/// Cheap to clone; clones share the announce latch and the close flag, so
/// "exactly one head, exactly one close" holds across all of them. This is
/// what lets the handler itself hold a copy for the set-response calling
/// convention while the adapter keeps another for its failure path.
#[derive(Debug, Clone)]
pub struct ResponseOutlet {
    head_tx: Arc<Mutex<Option<oneshot::Sender<ResponseHead>>>>,
    body: ChunkSender,
    abort: AbortSignal,
}

impl ResponseOutlet {
    /// Announce the response head. The second announcement for the same
    /// request is a protocol error, never a silent overwrite.
    pub fn announce(&self, head: ResponseHead) -> Result<(), StreamError> {
        let sender = self
            .head_tx
            .lock()
            .expect("head latch poisoned")
            .take()
            .ok_or(StreamError::HeadAlreadySent)?;
        sender.send(head).map_err(|_| StreamError::Disconnected)
    }

    pub fn is_announced(&self) -> bool {
        self.head_tx.lock().expect("head latch poisoned").is_none()
    }

    /// Push one response-body chunk, suspending until the host
    /// acknowledges it or the request is aborted.
    pub async fn write_chunk(&self, chunk: Bytes) -> Result<(), StreamError> {
        let mut signal = self.abort.clone();
        if signal.is_aborted() {
            return Err(StreamError::Aborted);
        }
        tokio::select! {
            _ = signal.aborted() => Err(StreamError::Aborted),
            sent = self.body.send(chunk) => sent,
        }
    }

    /// Signal end of the response body. Idempotent; safe on every exit
    /// path including cancellation.
    ///
    /// On an aborted request the end marker is not deliverable (the host
    /// side may never pull again), so the close latches locally instead
    /// of suspending on a full conduit.
    pub async fn close(&self) -> Result<(), StreamError> {
        let mut signal = self.abort.clone();
        if signal.is_aborted() {
            self.body.mark_closed();
            return Ok(());
        }
        tokio::select! {
            _ = signal.aborted() => {
                self.body.mark_closed();
                Ok(())
            }
            closed = self.body.close() => closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.body.is_closed()
    }
}

/// Host-side view of one request's channels.
#[derive(Debug)]
pub struct HostChannel {
    id: RequestId,
    request_body: Option<ChunkSender>,
    head_rx: Option<oneshot::Receiver<ResponseHead>>,
    response_body: BodyStream,
    abort: AbortHandle,
}

impl HostChannel {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Feed one request-body chunk to the guest, suspending until the
    /// guest pulls it.
    ///
    /// For bodyless methods the chunk is discarded: the guest never sees a
    /// body for `GET`/`HEAD` no matter what arrived on the transport.
    pub async fn push_request_chunk(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        match &self.request_body {
            Some(sender) => sender.send(chunk).await,
            None => {
                tracing::debug!(request_id = %self.id, "discarding body chunk for bodyless method");
                Ok(())
            }
        }
    }

    /// Signal end of the request body.
    pub async fn close_request_body(&mut self) -> Result<(), StreamError> {
        match &self.request_body {
            Some(sender) => sender.close().await,
            None => Ok(()),
        }
    }

    /// Await the guest's single response-head announcement.
    pub async fn response_head(&mut self) -> Result<ResponseHead, StreamError> {
        let rx = self
            .head_rx
            .take()
            .ok_or(StreamError::HeadAlreadySent)?;
        rx.await.map_err(|_| StreamError::Disconnected)
    }

    /// Pull the next response-body chunk. `Ok(None)` is end of body.
    pub async fn next_response_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        self.response_body.pull().await
    }

    /// Cancel the request. Pending guest-side pulls and pushes fail fast.
    pub fn abort(&self) {
        self.abort.abort();
    }
}
