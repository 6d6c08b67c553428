//! funcbridge data plane.
//!
//! Request and response bodies cross the host/guest boundary as a sequence
//! of byte chunks over a bounded, one-directional conduit — never as one
//! buffered blob. This crate provides:
//!
//! - [`ChunkSender`] / [`BodyStream`]: the leaf conduit. Pull-driven on
//!   the receiving side, acknowledged on the sending side, with a bounded
//!   in-flight count (1 by default) so memory is O(in-flight chunks), not
//!   O(body size).
//! - [`AbortHandle`] / [`AbortSignal`]: cancellation observable by pending
//!   pulls and pushes, which fail fast instead of hanging.
//! - [`RequestChannel`] / [`HostChannel`]: the per-request pair wiring one
//!   request-body conduit, one response-body conduit, and a once-only
//!   response-head announcement. Each request owns its pair for its whole
//!   lifetime; a pair is never reused.
//!
//! # End-of-body
//!
//! On the wire a zero-length chunk is the end marker, and an explicit
//! `close()` sends exactly that. The receiving side treats the two
//! identically: the first end marker latches the stream closed, and any
//! pull after that is a [`StreamError::PullAfterEnd`], not undefined
//! behavior. A peer that vanishes without an end marker surfaces as
//! [`StreamError::Disconnected`] — a transport failure, not a clean end.

mod abort;
mod channel;
mod chunk;

pub use abort::{abort_pair, AbortHandle, AbortSignal};
pub use channel::{request_pair, HostChannel, RequestChannel, ResponseOutlet};
pub use chunk::{chunk_pair, BodyStream, ChunkSender, DEFAULT_CHUNK_CAPACITY};

use thiserror::Error;

/// Errors raised by chunk-channel operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The peer went away without signaling end of body.
    #[error("chunk channel peer disconnected mid-stream")]
    Disconnected,
    /// A chunk was pushed after the stream was closed.
    #[error("chunk written after stream close")]
    WriteAfterClose,
    /// A pull was attempted after the end-of-body marker.
    #[error("chunk pulled after end of body")]
    PullAfterEnd,
    /// The response head was announced a second time.
    #[error("response already announced")]
    HeadAlreadySent,
    /// The request was aborted (client disconnect or host-initiated
    /// cancellation) while the operation was pending.
    #[error("request aborted")]
    Aborted,
}
