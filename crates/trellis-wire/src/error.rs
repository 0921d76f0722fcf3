//! Wire error types

use thiserror::Error;

/// Result type for wire operations
pub type Result<T> = std::result::Result<T, WireError>;

/// Wire errors
#[derive(Debug, Error)]
pub enum WireError {
    /// Buffer ended inside a field
    #[error("truncated message: expected at least {expected} more bytes, got {got}")]
    Truncated {
        /// Bytes still required
        expected: usize,
        /// Bytes remaining
        got: usize,
    },

    /// Varint ran past its maximum width
    #[error("malformed varint")]
    InvalidVarint,

    /// Unknown wire type in a field key
    #[error("unknown wire type: {0}")]
    UnknownWireType(u8),

    /// Unknown message type discriminant
    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),

    /// Fixed-width field had the wrong length
    #[error("field {field} has length {got}, expected {expected}")]
    BadFieldLength {
        /// Field number
        field: u32,
        /// Expected length
        expected: usize,
        /// Actual length
        got: usize,
    },

    /// Required field missing
    #[error("missing field {field} in {message}")]
    MissingField {
        /// Message name
        message: &'static str,
        /// Field number
        field: u32,
    },

    /// Structurally invalid message
    #[error("malformed {0}")]
    Malformed(&'static str),
}
