//! Connect error types

use thiserror::Error;

/// Result type for connect operations
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Connect errors
#[derive(Debug, Error)]
pub enum ConnectError {
    /// TCP connect failed
    #[error("connect failed: {0}")]
    Connect(String),

    /// TLS handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// WebSocket upgrade failed
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// DNS lookup failed
    #[error("DNS error: {0}")]
    Dns(String),

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// Every dialer in the pool failed
    #[error("no dialer succeeded")]
    NoDialerSucceeded,

    /// Extender relay refused or misbehaved
    #[error("extender error: {0}")]
    Extender(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
