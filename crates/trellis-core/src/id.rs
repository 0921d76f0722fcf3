//! Time-ordered identifiers
//!
//! Every client, stream, message, sequence, and contract in trellis is
//! named by a 128-bit time-ordered identifier. Successive ids generated
//! in one process strictly increase, which lets peers order sequences
//! and contracts without extra counters.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CoreError, Result};

/// Maximum number of intermediary hops a path may carry
pub const MAX_HOPS: usize = 8;

/// The distinguished identifier of the control peer (the platform)
pub const CONTROL_ID: Id = Id(Uuid::from_u128(1));

/// 128-bit time-ordered identifier
///
/// Encoded as 16 bytes big-endian on the wire and as the hyphenated
/// lowercase form in JSON. The zero value is valid and denotes "no id".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Id(Uuid);

impl Id {
    /// The zero identifier ("no id")
    pub const NIL: Id = Id(Uuid::nil());

    /// Generate a new time-ordered identifier
    ///
    /// Ids drawn from the same source strictly increase: the UUIDv7
    /// layout leads with unix milliseconds and the generator guarantees
    /// monotonicity within a millisecond.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create from raw big-endian bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw big-endian bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Whether this is the zero identifier
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Whether this is the control peer identifier
    pub fn is_control(&self) -> bool {
        *self == CONTROL_ID
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Immutable ordered list of intermediary relay identifiers
///
/// Length is bounded by [`MAX_HOPS`]; equality is element-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MultiHopId(Vec<Id>);

impl MultiHopId {
    /// Create from a hop list, rejecting lists over the hop limit
    pub fn new(hops: Vec<Id>) -> Result<Self> {
        if hops.len() > MAX_HOPS {
            return Err(CoreError::TooManyHops {
                max: MAX_HOPS,
                got: hops.len(),
            });
        }
        Ok(Self(hops))
    }

    /// The empty hop list
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Hop identifiers in order
    pub fn hops(&self) -> &[Id] {
        &self.0
    }

    /// Number of hops
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split into (prefix, last); `None` when empty
    pub fn split_tail(&self) -> Option<(&[Id], Id)> {
        let (last, prefix) = self.0.split_last()?;
        Some((prefix, *last))
    }
}

impl std::fmt::Display for MultiHopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|id| id.to_string()).collect();
        write!(f, "[{}]", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ordering() {
        // Time-ordered: each id sorts strictly after the previous one.
        let mut prev = Id::new();
        for _ in 0..4096 {
            let next = Id::new();
            assert!(prev < next);
            assert!(!(next < next));
            prev = next;
        }
    }

    #[test]
    fn test_id_nil() {
        assert!(Id::NIL.is_nil());
        assert!(!Id::new().is_nil());
        assert_eq!(Id::NIL, Id::default());
    }

    #[test]
    fn test_id_bytes_roundtrip() {
        let id = Id::new();
        let restored = Id::from_bytes(*id.as_bytes());
        assert_eq!(id, restored);
    }

    #[test]
    fn test_id_json_form() {
        let id = Id::from_bytes([
            0x01, 0x8f, 0x2a, 0x00, 0x00, 0x00, 0x70, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x42,
        ]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"018f2a00-0000-7000-8000-000000000042\"");
    }

    #[test]
    fn test_multi_hop_split_tail() {
        let a = Id::new();
        let b = Id::new();
        let c = Id::new();
        let hops = MultiHopId::new(vec![a, b, c]).unwrap();

        let (prefix, last) = hops.split_tail().unwrap();
        assert_eq!(prefix, &[a, b]);
        assert_eq!(last, c);

        assert!(MultiHopId::empty().split_tail().is_none());
    }

    #[test]
    fn test_multi_hop_limit() {
        let hops: Vec<Id> = (0..MAX_HOPS + 1).map(|_| Id::new()).collect();
        assert!(MultiHopId::new(hops).is_err());
    }
}
