//! Bridge error taxonomy.
//!
//! Five categories with different blast radii:
//!
//! | variant     | scope            | consequence                                |
//! |-------------|------------------|--------------------------------------------|
//! | `Startup`   | whole worker     | `error` control message, non-zero exit     |
//! | `Protocol`  | whole worker     | same path as `Startup`                     |
//! | `Handler`   | one request      | converted to a 500 response                |
//! | `Transport` | one request      | request aborted, resources released        |
//! | `Cancelled` | one request      | clean abort, no response, not an error log |
//!
//! `Transport` escalates to fatal only when it happens on the control
//! channel itself, which the runtime expresses by failing its top-level
//! loop rather than through a dedicated variant.

use thiserror::Error;

use funcbridge_proto::ProtocolError;
use funcbridge_stream::StreamError;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing configuration, module load failure, or handler resolution
    /// failure. The worker has no valid serving target.
    #[error("startup failed: {0}")]
    Startup(String),
    /// The bridge protocol was violated: malformed or out-of-order control
    /// message, double response finalize, write after close.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The handler threw, returned a malformed value, or timed out.
    /// Recovered locally as a 500 for the affected request.
    #[error("handler failed: {0}")]
    Handler(String),
    /// A chunk read/write failed or the peer disconnected mid-stream.
    #[error("transport: {0}")]
    Transport(String),
    /// The client disconnected before completion. A clean abort, not a
    /// failure.
    #[error("request cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Whether this failure invalidates the whole worker process (as
    /// opposed to a single request).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Startup(_) | Self::Protocol(_))
    }
}

impl From<StreamError> for BridgeError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Disconnected => Self::Transport(err.to_string()),
            StreamError::WriteAfterClose
            | StreamError::PullAfterEnd
            | StreamError::HeadAlreadySent => Self::Protocol(err.to_string()),
            StreamError::Aborted => Self::Cancelled,
        }
    }
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        match err {
            // Control-channel i/o failures are always fatal.
            ProtocolError::Io(io) => Self::Protocol(format!("control channel i/o: {io}")),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_follows_the_taxonomy() {
        assert!(BridgeError::Startup("no export".into()).is_fatal());
        assert!(BridgeError::Protocol("double finalize".into()).is_fatal());
        assert!(!BridgeError::Handler("boom".into()).is_fatal());
        assert!(!BridgeError::Transport("peer gone".into()).is_fatal());
        assert!(!BridgeError::Cancelled.is_fatal());
    }

    #[test]
    fn stream_errors_map_to_their_categories() {
        assert!(matches!(
            BridgeError::from(StreamError::Disconnected),
            BridgeError::Transport(_)
        ));
        assert!(matches!(
            BridgeError::from(StreamError::WriteAfterClose),
            BridgeError::Protocol(_)
        ));
        assert!(matches!(
            BridgeError::from(StreamError::HeadAlreadySent),
            BridgeError::Protocol(_)
        ));
        assert!(matches!(
            BridgeError::from(StreamError::Aborted),
            BridgeError::Cancelled
        ));
    }
}
