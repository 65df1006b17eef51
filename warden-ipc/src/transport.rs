//! IPC transport implementations
//!
//! Frames are newline-delimited JSON. The reading and writing halves are kept
//! separate so a supervisor can read replies on one task while other tasks
//! write invocations.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::error::IpcError;
use crate::protocol::{Envelope, MessageEnvelope, IPC_PROTOCOL_VERSION};

/// Default upper bound for a single frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Encode one envelope as a newline-terminated frame
pub fn encode_frame(message: &Envelope) -> Result<Vec<u8>, IpcError> {
    let envelope = MessageEnvelope::new(message);
    let mut bytes = serde_json::to_vec(&envelope)
        .map_err(|e| IpcError::SerializationError(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one frame (without its trailing newline)
pub fn decode_frame(line: &[u8]) -> Result<Envelope, IpcError> {
    let envelope: MessageEnvelope<Envelope> = serde_json::from_slice(line)
        .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

    if !envelope.is_compatible() {
        return Err(IpcError::ProtocolVersionMismatch {
            expected: IPC_PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }

    Ok(envelope.message)
}

/// Reading half of a framed stream
pub struct FramedReader<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
    buf: Vec<u8>,
}

impl<R> FramedReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_limit(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_frame_bytes,
            buf: Vec::new(),
        }
    }

    /// Read the next envelope.
    ///
    /// Returns `ConnectionClosed` on EOF. Frame-local errors (see
    /// [`IpcError::is_frame_local`]) leave the stream usable.
    ///
    /// Cancel safe: bytes of a partially read line stay buffered for the next call.
    pub async fn next(&mut self) -> Result<Envelope, IpcError> {
        loop {
            let remaining = (self.max_frame_bytes + 1).saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.reader)
                .take(remaining)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if read == 0 && self.buf.is_empty() {
                return Err(IpcError::ConnectionClosed);
            }

            let terminated = self.buf.last() == Some(&b'\n');
            if !terminated && self.buf.len() > self.max_frame_bytes {
                let size = self.buf.len();
                self.buf.clear();
                return Err(IpcError::FrameTooLarge {
                    size,
                    limit: self.max_frame_bytes,
                });
            }

            // Unterminated and under the limit means EOF: decode what is there
            let decoded = {
                let line = trim_line(&self.buf);
                if line.is_empty() {
                    None
                } else {
                    trace!(bytes = line.len(), "Received frame");
                    Some(decode_frame(line))
                }
            };
            self.buf.clear();

            if let Some(decoded) = decoded {
                return decoded;
            }
        }
    }
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r' | b' ' | b'\t') {
        end -= 1;
    }
    &buf[..end]
}

/// Writing half of a framed stream
pub struct FramedWriter<W> {
    writer: Option<W>,
}

impl<W> FramedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Write one envelope and flush
    pub async fn send(&mut self, message: &Envelope) -> Result<(), IpcError> {
        let writer = self.writer.as_mut().ok_or(IpcError::NotConnected)?;
        let frame = encode_frame(message)?;

        writer.write_all(&frame).await?;
        writer.flush().await?;

        trace!(kind = message.kind(), "Sent frame");
        Ok(())
    }

    /// Shut down and drop the underlying writer
    pub async fn close(&mut self) -> Result<(), IpcError> {
        if let Some(mut writer) = self.writer.take() {
            // The peer may already be gone; closing is best effort
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}
