//! Contracts
//!
//! A contract is a signed byte budget between one source and one
//! destination. The platform encodes a [`StoredContract`], signs it with
//! the destination's provide secret, and ships both as a [`Contract`].
//! Receivers verify the tag before trusting the decoded budget.

use bytes::{Bytes, BytesMut};

use trellis_core::{Id, TransferPath};
use trellis_crypto::{ProvideKeyring, ProvideMode};

use crate::codec::{WireReader, put_bytes_field, put_id_field, put_u64_field};
use crate::frame::{Frame, MessageType};
use crate::{Result, WireError};

/// Decoded contract body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContract {
    /// Contract identifier
    pub contract_id: Id,
    /// Authorized byte budget
    pub transfer_byte_count: u64,
    /// Charging source
    pub source_id: Id,
    /// Providing destination
    pub destination_id: Id,
    /// Stream the contract covers, when stream-scoped
    pub stream_id: Id,
}

impl StoredContract {
    /// Encode the stored contract body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(96);
        put_id_field(&mut buf, 1, self.contract_id);
        put_u64_field(&mut buf, 2, self.transfer_byte_count);
        put_id_field(&mut buf, 3, self.source_id);
        put_id_field(&mut buf, 4, self.destination_id);
        put_id_field(&mut buf, 5, self.stream_id);
        buf.freeze()
    }

    /// Decode a stored contract body
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut stored = StoredContract {
            contract_id: Id::NIL,
            transfer_byte_count: 0,
            source_id: Id::NIL,
            destination_id: Id::NIL,
            stream_id: Id::NIL,
        };

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => stored.contract_id = reader.read_id(1)?,
                2 => stored.transfer_byte_count = reader.read_varint()?,
                3 => stored.source_id = reader.read_id(3)?,
                4 => stored.destination_id = reader.read_id(4)?,
                5 => stored.stream_id = reader.read_id(5)?,
                _ => reader.skip(wire)?,
            }
        }

        if stored.contract_id.is_nil() {
            return Err(WireError::MissingField {
                message: "StoredContract",
                field: 1,
            });
        }
        Ok(stored)
    }

    /// Path this contract authorizes
    pub fn path(&self) -> TransferPath {
        if self.stream_id.is_nil() {
            TransferPath::new(self.source_id, self.destination_id)
        } else {
            TransferPath::stream(self.stream_id)
        }
    }
}

/// Signed contract as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    /// Encoded [`StoredContract`], the exact signed bytes
    pub stored_contract_bytes: Bytes,
    /// HMAC-SHA256 tag over the stored bytes
    pub stored_contract_hmac: Bytes,
    /// Provide mode whose secret signed the tag
    pub provide_mode: ProvideMode,
}

impl Contract {
    /// Sign a stored contract under the destination's keyring
    pub fn seal(
        stored: &StoredContract,
        provide_mode: ProvideMode,
        keyring: &ProvideKeyring,
    ) -> trellis_crypto::Result<Self> {
        let stored_contract_bytes = stored.encode();
        let tag = keyring.sign(provide_mode, &stored_contract_bytes)?;
        Ok(Self {
            stored_contract_bytes,
            stored_contract_hmac: Bytes::copy_from_slice(&tag),
            provide_mode,
        })
    }

    /// Verify the tag against the local keyring (constant-time)
    pub fn verify(&self, keyring: &ProvideKeyring) -> bool {
        keyring.verify(
            self.provide_mode,
            &self.stored_contract_bytes,
            &self.stored_contract_hmac,
        )
    }

    /// Decode the signed body
    ///
    /// Callers must [`verify`](Self::verify) first; the decode itself
    /// does not authenticate.
    pub fn stored(&self) -> Result<StoredContract> {
        StoredContract::decode(&self.stored_contract_bytes)
    }

    /// Encode the contract envelope
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(self.stored_contract_bytes.len() + 48);
        put_bytes_field(&mut buf, 1, &self.stored_contract_bytes);
        put_bytes_field(&mut buf, 2, &self.stored_contract_hmac);
        put_u64_field(&mut buf, 3, self.provide_mode as u64);
        buf.freeze()
    }

    /// Decode a contract envelope
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut stored_contract_bytes = Bytes::new();
        let mut stored_contract_hmac = Bytes::new();
        let mut provide_mode = ProvideMode::None;

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => stored_contract_bytes = Bytes::copy_from_slice(reader.read_bytes()?),
                2 => stored_contract_hmac = Bytes::copy_from_slice(reader.read_bytes()?),
                3 => {
                    let raw = reader.read_varint()?;
                    provide_mode = ProvideMode::from_byte(raw as u8)
                        .ok_or(WireError::Malformed("Contract provide mode"))?;
                }
                _ => reader.skip(wire)?,
            }
        }

        if stored_contract_bytes.is_empty() {
            return Err(WireError::MissingField {
                message: "Contract",
                field: 1,
            });
        }
        Ok(Self {
            stored_contract_bytes,
            stored_contract_hmac,
            provide_mode,
        })
    }

    /// Wrap into a contract frame
    pub fn into_frame(&self) -> Frame {
        Frame::new(MessageType::TransferContract, self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyring() -> ProvideKeyring {
        let mut keyring = ProvideKeyring::new();
        keyring.set_modes(&[ProvideMode::Network]);
        keyring
    }

    fn stored() -> StoredContract {
        StoredContract {
            contract_id: Id::new(),
            transfer_byte_count: 8 * 1024 * 1024 * 1024,
            source_id: Id::new(),
            destination_id: Id::new(),
            stream_id: Id::NIL,
        }
    }

    #[test]
    fn test_seal_verify_roundtrip() {
        let keyring = keyring();
        let stored = stored();
        let contract = Contract::seal(&stored, ProvideMode::Network, &keyring).unwrap();

        let decoded = Contract::decode(&contract.encode()).unwrap();
        assert!(decoded.verify(&keyring));
        assert_eq!(decoded.stored().unwrap(), stored);
    }

    #[test]
    fn test_tampered_contract_fails_verify() {
        let keyring = keyring();
        let contract = Contract::seal(&stored(), ProvideMode::Network, &keyring).unwrap();

        let mut corrupted = contract.stored_contract_bytes.to_vec();
        corrupted[0] ^= 0x01;
        let forged = Contract {
            stored_contract_bytes: Bytes::from(corrupted),
            ..contract
        };
        assert!(!forged.verify(&keyring));
    }

    #[test]
    fn test_wrong_mode_fails_verify() {
        let keyring = keyring();
        let contract = Contract::seal(&stored(), ProvideMode::Network, &keyring).unwrap();

        let wrong_mode = Contract {
            provide_mode: ProvideMode::Stream,
            ..contract
        };
        assert!(!wrong_mode.verify(&keyring));
    }

    #[test]
    fn test_stream_contract_path() {
        let stream_id = Id::new();
        let stored = StoredContract {
            contract_id: Id::new(),
            transfer_byte_count: 1024,
            source_id: Id::NIL,
            destination_id: Id::NIL,
            stream_id,
        };
        let path = stored.path();
        assert!(path.is_stream());
        assert_eq!(path.stream_id, stream_id);
    }
}
