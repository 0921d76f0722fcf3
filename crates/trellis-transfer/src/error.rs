//! Transfer error types

use thiserror::Error;

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// Transfer errors
#[derive(Debug, Error, Clone)]
pub enum TransferError {
    /// The owning sequence closed before the message settled
    #[error("sequence closed")]
    SequenceClosed,

    /// A message stayed unacked past the ack timeout
    #[error("ack timed out")]
    AckTimeout,

    /// No contract could be acquired within the create timeout
    #[error("no contract available")]
    ContractUnavailable,

    /// Inbound contract failed verification or budget
    #[error("bad contract")]
    BadContract,

    /// A reorder gap outlived the gap timeout
    #[error("gap timed out")]
    GapTimeout,

    /// The route layer refused the frame
    #[error("route write failed: {0}")]
    WriteFailed(String),

    /// The client or its context was cancelled
    #[error("done")]
    Done,

    /// Peer sent something undecodable
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl From<trellis_route::RouteError> for TransferError {
    fn from(err: trellis_route::RouteError) -> Self {
        TransferError::WriteFailed(err.to_string())
    }
}

impl From<trellis_wire::WireError> for TransferError {
    fn from(err: trellis_wire::WireError) -> Self {
        TransferError::ProtocolViolation(err.to_string())
    }
}
