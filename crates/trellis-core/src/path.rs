//! Transfer paths
//!
//! A [`TransferPath`] names the endpoints of a frame. Exactly two shapes
//! are legal: a source/destination pair with a zero stream id, or a
//! stream path where the stream id alone implies both endpoints.

use serde::{Deserialize, Serialize};

use crate::{CoreError, Id, Result};

/// Addressing triple carried by every transfer frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TransferPath {
    /// Frame source; zero acts as a source mask
    pub source_id: Id,
    /// Frame destination; zero acts as a destination mask
    pub destination_id: Id,
    /// Stream id; non-zero makes this a stream path
    pub stream_id: Id,
}

impl TransferPath {
    /// Create a source/destination path
    pub fn new(source_id: Id, destination_id: Id) -> Self {
        Self {
            source_id,
            destination_id,
            stream_id: Id::NIL,
        }
    }

    /// Create a path addressed to a destination only (masked source)
    pub fn to_destination(destination_id: Id) -> Self {
        Self::new(Id::NIL, destination_id)
    }

    /// Create a path from a source only (masked destination)
    pub fn from_source(source_id: Id) -> Self {
        Self::new(source_id, Id::NIL)
    }

    /// Create a stream path
    ///
    /// A stream implies its own endpoints, so source and destination are
    /// zero by construction.
    pub fn stream(stream_id: Id) -> Self {
        Self {
            source_id: Id::NIL,
            destination_id: Id::NIL,
            stream_id,
        }
    }

    /// Validate the two legal shapes
    ///
    /// A non-zero stream id requires both endpoints to be zero.
    pub fn validate(&self) -> Result<()> {
        if !self.stream_id.is_nil() && (!self.source_id.is_nil() || !self.destination_id.is_nil())
        {
            return Err(CoreError::InvalidPath(format!(
                "stream path must not carry endpoints: {self}"
            )));
        }
        Ok(())
    }

    /// Whether this is a stream path
    pub fn is_stream(&self) -> bool {
        !self.stream_id.is_nil()
    }

    /// Whether the source is masked (zero, non-stream)
    pub fn is_source_mask(&self) -> bool {
        !self.is_stream() && self.source_id.is_nil()
    }

    /// Whether the destination is masked (zero, non-stream)
    pub fn is_destination_mask(&self) -> bool {
        !self.is_stream() && self.destination_id.is_nil()
    }

    /// Whether the source is the control peer
    pub fn is_control_source(&self) -> bool {
        self.source_id.is_control()
    }

    /// Whether the destination is the control peer
    pub fn is_control_destination(&self) -> bool {
        self.destination_id.is_control()
    }

    /// Swap source and destination; a stream path reverses to itself
    pub fn reverse(&self) -> Self {
        if self.is_stream() {
            *self
        } else {
            Self {
                source_id: self.destination_id,
                destination_id: self.source_id,
                stream_id: Id::NIL,
            }
        }
    }
}

impl std::fmt::Display for TransferPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_stream() {
            write!(f, "stream({})", self.stream_id)
        } else {
            write!(f, "{}->{}", self.source_id, self.destination_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_shapes() {
        let a = Id::new();
        let b = Id::new();

        let pair = TransferPath::new(a, b);
        assert!(pair.validate().is_ok());
        assert!(!pair.is_stream());
        assert!(!pair.is_source_mask());
        assert!(!pair.is_destination_mask());

        let masked = TransferPath::to_destination(b);
        assert!(masked.validate().is_ok());
        assert!(masked.is_source_mask());
        assert!(!masked.is_destination_mask());

        let stream = TransferPath::stream(Id::new());
        assert!(stream.validate().is_ok());
        assert!(stream.is_stream());
        assert!(!stream.is_source_mask());
    }

    #[test]
    fn test_stream_with_endpoints_rejected() {
        let bad = TransferPath {
            source_id: Id::new(),
            destination_id: Id::NIL,
            stream_id: Id::new(),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_reverse() {
        let a = Id::new();
        let b = Id::new();

        let pair = TransferPath::new(a, b);
        let rev = pair.reverse();
        assert_eq!(rev.source_id, b);
        assert_eq!(rev.destination_id, a);
        assert_eq!(rev.reverse(), pair);

        let stream = TransferPath::stream(Id::new());
        assert_eq!(stream.reverse(), stream);
    }

    #[test]
    fn test_control_predicates() {
        let path = TransferPath::new(crate::CONTROL_ID, Id::new());
        assert!(path.is_control_source());
        assert!(!path.is_control_destination());
        assert!(path.reverse().is_control_destination());
    }
}
