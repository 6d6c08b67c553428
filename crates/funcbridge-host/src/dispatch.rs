//! Readiness-gated request dispatch.
//!
//! One dispatch builds one channel pair: the guest half goes to the
//! worker's request source, the host half back to the caller so it can
//! feed body chunks and consume the response. A worker that has not
//! reported ready (or has already died) never sees the request.

use tokio::sync::mpsc;
use tracing::debug;

use funcbridge_proto::{RequestId, RequestMetadata};
use funcbridge_stream::{request_pair, HostChannel, RequestChannel, DEFAULT_CHUNK_CAPACITY};

use crate::lifecycle::{StateHandle, WorkerEvent};
use crate::HostError;

#[derive(Clone)]
pub struct Dispatcher {
    state: StateHandle,
    requests: mpsc::Sender<RequestChannel>,
    capacity: usize,
}

impl Dispatcher {
    pub fn new(state: StateHandle, requests: mpsc::Sender<RequestChannel>) -> Self {
        Self {
            state,
            requests,
            capacity: DEFAULT_CHUNK_CAPACITY,
        }
    }

    /// Override the per-stream in-flight chunk bound.
    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Hand one request to the worker. Returns the host half of the
    /// channel pair, or refuses if the worker cannot take traffic.
    pub async fn dispatch(&self, metadata: RequestMetadata) -> Result<HostChannel, HostError> {
        let state = self.state.snapshot();
        if !state.can_dispatch() {
            return Err(HostError::NotReady(format!("worker is {state}")));
        }

        let id = RequestId::allocate();
        debug!(request_id = %id, method = %metadata.method(), uri = %metadata.uri(), "dispatching request");
        let (host, guest) = request_pair(id, metadata, self.capacity);

        self.requests
            .send(guest)
            .await
            .map_err(|_| HostError::NotReady("worker request source is gone".into()))?;
        self.state.apply(WorkerEvent::DispatchStarted);
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::WorkerState;
    use funcbridge_proto::{ControlMessage, HeaderMap};

    fn metadata() -> RequestMetadata {
        RequestMetadata::new("GET", "/hello", HeaderMap::new())
    }

    fn ready_state() -> StateHandle {
        let state = StateHandle::new();
        state.apply(WorkerEvent::Message(ControlMessage::Started));
        state.apply(WorkerEvent::Message(ControlMessage::Ready { port: None }));
        state
    }

    #[tokio::test]
    async fn dispatch_is_refused_before_ready() {
        let (tx, _rx) = mpsc::channel(4);
        let dispatcher = Dispatcher::new(StateHandle::new(), tx);
        let err = dispatcher.dispatch(metadata()).await.unwrap_err();
        assert!(matches!(err, HostError::NotReady(_)));
    }

    #[tokio::test]
    async fn dispatch_is_refused_after_fault() {
        let state = ready_state();
        state.apply(WorkerEvent::ProtocolViolation("bad frame".into()));
        let (tx, _rx) = mpsc::channel(4);
        let dispatcher = Dispatcher::new(state, tx);
        assert!(matches!(
            dispatcher.dispatch(metadata()).await,
            Err(HostError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_delivers_the_guest_half_and_marks_serving() {
        let state = ready_state();
        let (tx, mut rx) = mpsc::channel(4);
        let dispatcher = Dispatcher::new(state.clone(), tx);

        let host = dispatcher.dispatch(metadata()).await.unwrap();
        let guest = rx.recv().await.unwrap();
        assert_eq!(host.request_id(), guest.request_id());
        assert!(matches!(state.snapshot(), WorkerState::Serving { .. }));
    }

    #[tokio::test]
    async fn dispatch_fails_when_the_request_source_is_dropped() {
        let state = ready_state();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let dispatcher = Dispatcher::new(state, tx);
        assert!(matches!(
            dispatcher.dispatch(metadata()).await,
            Err(HostError::NotReady(_))
        ));
    }
}
