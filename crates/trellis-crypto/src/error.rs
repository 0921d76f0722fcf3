//! Crypto error types

use thiserror::Error;

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// HMAC verification failed
    #[error("HMAC verification failed")]
    HmacVerificationFailed,

    /// No secret installed for the requested provide mode
    #[error("no secret for provide mode {0}")]
    NoProvideSecret(String),

    /// Secret material has the wrong length
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length received
        got: usize,
    },
}
