//! Control socket — the supervisor's end of the lifecycle channel.
//!
//! A unix listener that accepts the worker's single connection and pumps
//! newline-delimited control frames through the ordering validator into
//! [`WorkerEvent`]s. Frame corruption and ordering violations are fatal to
//! the worker; the pump stops at the first one.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::io::AsyncRead;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use funcbridge_proto::{ControlReader, Sequence};

use crate::lifecycle::WorkerEvent;
use crate::HostError;

/// Bound control listener.
pub struct ControlSocket {
    path: PathBuf,
    listener: UnixListener,
}

impl ControlSocket {
    /// Bind the listener, removing any stale socket file first.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self, HostError> {
        let path = path.as_ref().to_path_buf();
        if fs::metadata(&path).is_ok() {
            debug!(socket = %path.display(), "removing stale control socket");
            fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!(socket = %path.display(), "control socket bound");
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept the worker's connection and pump its frames until the
    /// connection ends or the protocol is violated.
    ///
    /// Exactly one worker connects per supervisor lifetime; a second
    /// connection attempt is refused by never being accepted.
    pub async fn serve(self, events: mpsc::Sender<WorkerEvent>) {
        match self.listener.accept().await {
            Ok((stream, _addr)) => {
                info!("worker connected on control socket");
                pump(stream, &events).await;
            }
            Err(err) => {
                warn!(error = %err, "control socket accept failed");
                let _ = events
                    .send(WorkerEvent::ProtocolViolation(format!(
                        "control accept failed: {err}"
                    )))
                    .await;
            }
        }
    }
}

/// Read control frames from `reader`, validate ordering, and forward them
/// as events. Returns once the stream ends or a violation occurs.
pub async fn pump<R: AsyncRead + Unpin>(reader: R, events: &mpsc::Sender<WorkerEvent>) {
    let mut reader = ControlReader::new(reader);
    let mut sequence = Sequence::new();
    loop {
        match reader.next().await {
            Ok(Some(message)) => {
                debug!(?message, "control message received");
                if let Err(violation) = sequence.accept(&message) {
                    let _ = events
                        .send(WorkerEvent::ProtocolViolation(violation.to_string()))
                        .await;
                    return;
                }
                let is_error = matches!(message, funcbridge_proto::ControlMessage::Error { .. });
                let _ = events.send(WorkerEvent::Message(message)).await;
                if is_error {
                    // The first error is terminal for the worker; nothing
                    // after it can be trusted.
                    return;
                }
            }
            Ok(None) => {
                let _ = events.send(WorkerEvent::ConnectionClosed).await;
                return;
            }
            Err(err) => {
                let _ = events
                    .send(WorkerEvent::ProtocolViolation(err.to_string()))
                    .await;
                return;
            }
        }
    }
}
