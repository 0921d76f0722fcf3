//! Provide-mode keyring
//!
//! A receiver holds one 32-byte secret per enabled provide mode. The
//! platform signs contracts into this receiver with the mode's secret;
//! the receiver verifies inbound contract HMACs against the same key in
//! constant time.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Provide secret size in bytes
pub const PROVIDE_SECRET_SIZE: usize = 32;

/// Disposition a receiver has toward inbound traffic
///
/// Each mode carries its own HMAC key so the platform can meter
/// different audiences independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProvideMode {
    /// Providing disabled
    None = 0,
    /// Trusted network peers
    Network = 1,
    /// Friends-and-family peers
    FriendsAndFamily = 2,
    /// Anyone
    Public = 3,
    /// Return traffic on hosted streams
    Stream = 4,
}

impl ProvideMode {
    /// Parse from the wire byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ProvideMode::None),
            1 => Some(ProvideMode::Network),
            2 => Some(ProvideMode::FriendsAndFamily),
            3 => Some(ProvideMode::Public),
            4 => Some(ProvideMode::Stream),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProvideMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProvideMode::None => "none",
            ProvideMode::Network => "network",
            ProvideMode::FriendsAndFamily => "friends_and_family",
            ProvideMode::Public => "public",
            ProvideMode::Stream => "stream",
        };
        write!(f, "{name}")
    }
}

/// One provide-mode secret key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ProvideSecret([u8; PROVIDE_SECRET_SIZE]);

impl ProvideSecret {
    /// Draw a fresh random secret
    pub fn generate() -> Self {
        let mut secret = [0u8; PROVIDE_SECRET_SIZE];
        rand::thread_rng().fill_bytes(&mut secret);
        Self(secret)
    }

    /// Wrap existing secret bytes
    pub fn from_bytes(bytes: [u8; PROVIDE_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes
    pub fn as_bytes(&self) -> &[u8; PROVIDE_SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ProvideSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "ProvideSecret(..)")
    }
}

/// Per-mode secret keyring
#[derive(Default)]
pub struct ProvideKeyring {
    secrets: HashMap<ProvideMode, ProvideSecret>,
}

impl ProvideKeyring {
    /// Create an empty keyring
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the enabled mode set
    ///
    /// Newly-enabled modes get fresh random secrets; disabled modes drop
    /// theirs. Enabling any mode other than `None` also enables
    /// [`ProvideMode::Stream`] so return traffic can be metered. Returns
    /// the full active set for announcement to the platform.
    pub fn set_modes(&mut self, modes: &[ProvideMode]) -> Vec<(ProvideMode, ProvideSecret)> {
        let mut enabled: Vec<ProvideMode> = modes
            .iter()
            .copied()
            .filter(|mode| *mode != ProvideMode::None)
            .collect();
        if !enabled.is_empty() && !enabled.contains(&ProvideMode::Stream) {
            enabled.push(ProvideMode::Stream);
        }

        self.secrets.retain(|mode, _| enabled.contains(mode));
        for mode in &enabled {
            if !self.secrets.contains_key(mode) {
                debug!(mode = %mode, "generating provide secret");
                self.secrets.insert(*mode, ProvideSecret::generate());
            }
        }

        let mut active: Vec<(ProvideMode, ProvideSecret)> = self
            .secrets
            .iter()
            .map(|(mode, secret)| (*mode, secret.clone()))
            .collect();
        active.sort_by_key(|(mode, _)| *mode);
        active
    }

    /// Secret for a mode, if enabled
    pub fn secret(&self, mode: ProvideMode) -> Option<&ProvideSecret> {
        self.secrets.get(&mode)
    }

    /// Enabled modes
    pub fn modes(&self) -> Vec<ProvideMode> {
        let mut modes: Vec<ProvideMode> = self.secrets.keys().copied().collect();
        modes.sort();
        modes
    }

    /// Sign `bytes` with the mode's secret
    pub fn sign(&self, mode: ProvideMode, bytes: &[u8]) -> Result<[u8; 32]> {
        let secret = self
            .secrets
            .get(&mode)
            .ok_or_else(|| CryptoError::NoProvideSecret(mode.to_string()))?;
        Ok(hmac_sha256(secret.as_bytes(), bytes))
    }

    /// Verify an HMAC tag against the mode's secret (constant-time)
    pub fn verify(&self, mode: ProvideMode, bytes: &[u8], tag: &[u8]) -> bool {
        let Some(secret) = self.secrets.get(&mode) else {
            return false;
        };
        let computed = hmac_sha256(secret.as_bytes(), bytes);
        computed.ct_eq(tag).into()
    }
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}
