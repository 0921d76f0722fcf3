//! Route error types

use thiserror::Error;

/// Result type for route operations
pub type Result<T> = std::result::Result<T, RouteError>;

/// Route errors
#[derive(Debug, Error)]
pub enum RouteError {
    /// No route accepted the frame within the timeout
    #[error("write timed out with no accepting route")]
    WriteTimeout,

    /// No frame arrived within the timeout
    #[error("read timed out")]
    ReadTimeout,

    /// The reader or writer was closed
    #[error("closed")]
    Closed,
}
