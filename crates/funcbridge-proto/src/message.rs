//! Control messages and their ordering rules.
//!
//! The worker reports lifecycle transitions to the supervisor as a stream
//! of tagged JSON objects. The set is deliberately tiny: `started` (process
//! alive, no user code run yet), `ready` (serving endpoint bound or module
//! loaded), and `error` (an uncaught failure escaped the worker's top-level
//! boundary — the process is no longer trustworthy).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single lifecycle message sent from worker to supervisor.
///
/// Wire shape (one object per line):
///
/// ```text
/// {"kind":"started"}
/// {"kind":"ready","payload":{"port":3000}}
/// {"kind":"error","payload":{"error":"..."}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sent immediately once the control connection opens, before any user
    /// code executes.
    Started,
    /// Sent once the worker can accept traffic. Carries the bound port in
    /// long-lived server mode; `None` in one-shot mode.
    Ready {
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    /// An uncaught exception or unhandled rejection escaped the worker's
    /// execution context. Terminal: the supervisor kills the worker after
    /// the first one.
    Error { error: String },
}

/// Errors arising on the control channel itself.
///
/// Every variant is fatal to the worker it came from; there is no in-place
/// recovery from a corrupted control stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("control message out of order: {0}")]
    OutOfOrder(String),
    #[error("control channel i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Validates the control-message ordering invariant.
///
/// `started` must be the first message ever observed, and at most one
/// `ready` may follow. Fed by the supervisor's read loop; any violation is
/// a [`ProtocolError::OutOfOrder`] and is treated the same as an `error`
/// message from the worker.
#[derive(Debug, Default)]
pub struct Sequence {
    started: bool,
    ready: bool,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `message` against everything observed so far, recording it on
    /// success.
    pub fn accept(&mut self, message: &ControlMessage) -> Result<(), ProtocolError> {
        match message {
            ControlMessage::Started => {
                if self.started {
                    return Err(ProtocolError::OutOfOrder(
                        "duplicate `started` message".into(),
                    ));
                }
                self.started = true;
            }
            ControlMessage::Ready { .. } => {
                if !self.started {
                    return Err(ProtocolError::OutOfOrder(
                        "`ready` received before `started`".into(),
                    ));
                }
                if self.ready {
                    return Err(ProtocolError::OutOfOrder("duplicate `ready` message".into()));
                }
                self.ready = true;
            }
            ControlMessage::Error { .. } => {
                if !self.started {
                    return Err(ProtocolError::OutOfOrder(
                        "`error` received before `started`".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn ready(&self) -> bool {
        self.ready
    }
}
