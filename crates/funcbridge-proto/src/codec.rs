//! Line-delimited JSON framing for the control channel.
//!
//! One UTF-8 JSON object per line, newline as the frame delimiter. JSON
//! string escaping guarantees no unescaped newline can appear inside a
//! frame, so splitting on `\n` is sound.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::message::{ControlMessage, ProtocolError};

/// Writes control messages to any ordered byte stream.
pub struct ControlWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Serialize `message` as one JSON line and flush it.
    pub async fn send(&mut self, message: &ControlMessage) -> Result<(), ProtocolError> {
        let mut line = serde_json::to_string(message).map_err(ProtocolError::Malformed)?;
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Reads control messages from any ordered byte stream.
///
/// A line that fails to parse is a [`ProtocolError::Malformed`], not a
/// skipped frame — once the stream is corrupt nothing after it can be
/// trusted.
pub struct ControlReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> ControlReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Read the next message. `Ok(None)` means the peer closed the
    /// connection.
    pub async fn next(&mut self) -> Result<Option<ControlMessage>, ProtocolError> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let message = serde_json::from_str(trimmed).map_err(ProtocolError::Malformed)?;
            return Ok(Some(message));
        }
    }
}
