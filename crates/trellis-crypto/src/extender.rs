//! Extender header authentication
//!
//! An extender relay only forwards for callers who prove knowledge of
//! its shared secret: the header carries
//! `HMAC_SHA256(secret, timestamp_be || nonce)`.

use subtle::ConstantTimeEq;

use crate::provide::hmac_sha256;

/// Sign an extender header
pub fn sign_extender_header(secret: &[u8], timestamp: u64, nonce: &[u8]) -> [u8; 32] {
    let mut message = Vec::with_capacity(8 + nonce.len());
    message.extend_from_slice(&timestamp.to_be_bytes());
    message.extend_from_slice(nonce);
    hmac_sha256(secret, &message)
}

/// Verify an extender header signature (constant-time)
pub fn verify_extender_header(
    secret: &[u8],
    timestamp: u64,
    nonce: &[u8],
    signature: &[u8],
) -> bool {
    let computed = sign_extender_header(secret, timestamp, nonce);
    computed.ct_eq(signature).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let signature = sign_extender_header(b"shared secret", 1700000000, b"nonce-1234");
        assert!(verify_extender_header(
            b"shared secret",
            1700000000,
            b"nonce-1234",
            &signature
        ));
    }

    #[test]
    fn test_timestamp_is_bound() {
        let signature = sign_extender_header(b"shared secret", 1700000000, b"nonce-1234");
        assert!(!verify_extender_header(
            b"shared secret",
            1700000001,
            b"nonce-1234",
            &signature
        ));
    }

    #[test]
    fn test_wrong_secret() {
        let signature = sign_extender_header(b"shared secret", 1700000000, b"nonce-1234");
        assert!(!verify_extender_header(
            b"other secret",
            1700000000,
            b"nonce-1234",
            &signature
        ));
    }
}
