//! Inter-process communication for warden
//!
//! This crate provides the envelope protocol, the newline-delimited JSON
//! framing and the payload sanitization used between the supervisor and its
//! worker processes.

pub mod error;
pub mod protocol;
pub mod sanitize;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    new_request_id, AlertLevel, Envelope, MessageEnvelope, ProgressEvent, RemoteError,
    IPC_PROTOCOL_VERSION,
};
pub use sanitize::{is_transport_safe, sanitize_payload, sanitize_serializable, MAX_SAFE_INTEGER};
pub use transport::{decode_frame, encode_frame, FramedReader, FramedWriter, DEFAULT_MAX_FRAME_BYTES};
