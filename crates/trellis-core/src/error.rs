//! Core error types

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Transfer path violates one of the two legal shapes
    #[error("invalid transfer path: {0}")]
    InvalidPath(String),

    /// Multi-hop list exceeds the hop limit
    #[error("too many hops: {got} (max {max})")]
    TooManyHops {
        /// Configured maximum
        max: usize,
        /// Actual length
        got: usize,
    },

    /// Operation attempted on a closed component
    #[error("closed")]
    Closed,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}
