//! funcbridge control-channel wire protocol and request/response data model.
//!
//! The supervisor and the worker share exactly two vocabularies:
//!
//! - **Control messages** ([`ControlMessage`]): small lifecycle signals
//!   (`started`, `ready`, `error`) framed as one JSON object per line over
//!   an out-of-band byte stream. [`ControlReader`] / [`ControlWriter`]
//!   implement the framing; [`Sequence`] enforces the ordering rules
//!   (`started` first, at most one `ready`).
//! - **Request/response heads** ([`RequestMetadata`], [`ResponseHead`]):
//!   the immutable snapshot of an inbound request handed to the guest, and
//!   the normalized `(status, headers)` pair the guest announces before
//!   streaming a body back.
//!
//! Body bytes never travel through this crate — the data plane lives in
//! `funcbridge-stream`.

mod codec;
mod header;
mod message;
mod request;
mod response;

pub use codec::{ControlReader, ControlWriter};
pub use header::{Header, HeaderMap};
pub use message::{ControlMessage, ProtocolError, Sequence};
pub use request::{RequestId, RequestMetadata};
pub use response::{InvalidStatus, ResponseHead};

/// Response header stamped by the bridge for request correlation.
pub const REQUEST_ID_HEADER: &str = "x-funcbridge-request-id";
