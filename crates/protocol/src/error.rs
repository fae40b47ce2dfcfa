//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A PTY payload was not valid base64.
    #[error("invalid payload encoding: {0}")]
    InvalidPayload(String),

    // Handshake errors
    /// The HTTP upgrade request could not be accepted.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame uses an opcode this implementation does not handle.
    #[error("unsupported opcode: {0:#x}")]
    UnsupportedOpcode(u8),

    /// Fragmented (non-final or continuation) frames are not supported.
    #[error("fragmented frames are not supported")]
    Fragmented,
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::InvalidPayload(err.to_string())
    }
}
