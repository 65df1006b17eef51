//! IPC error types

use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// A single frame exceeded the configured limit
    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Transport not connected
    #[error("Transport not connected")]
    NotConnected,
}

impl IpcError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, IpcError::IoError(_) | IpcError::ConnectionClosed)
    }

    /// Whether the frame was bad but the stream itself is still usable
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            IpcError::DeserializationError(_)
                | IpcError::ProtocolVersionMismatch { .. }
                | IpcError::InvalidMessage(_)
        )
    }

    /// Check if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::ConnectionClosed | IpcError::NotConnected | IpcError::FrameTooLarge { .. }
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset => IpcError::ConnectionClosed,
            _ => IpcError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(IpcError::IoError("network error".to_string()).is_retryable());
        assert!(IpcError::ConnectionClosed.is_retryable());
        assert!(!IpcError::ProtocolVersionMismatch { expected: 1, actual: 2 }.is_retryable());
        assert!(!IpcError::InvalidMessage("bad format".to_string()).is_retryable());
    }

    #[test]
    fn test_frame_local_errors() {
        assert!(IpcError::DeserializationError("x".into()).is_frame_local());
        assert!(IpcError::ProtocolVersionMismatch { expected: 1, actual: 2 }.is_frame_local());
        assert!(!IpcError::ConnectionClosed.is_frame_local());
        assert!(!IpcError::FrameTooLarge { size: 10, limit: 5 }.is_frame_local());
    }

    #[test]
    fn test_broken_pipe_maps_to_closed() {
        let err: IpcError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, IpcError::ConnectionClosed));
        assert!(err.is_fatal());
    }
}
