//! Extender header
//!
//! After the fake certificate handshake with an extender, the client
//! prepends this header to the upstream TLS stream: a 4-byte big-endian
//! length followed by the encoded header naming the true destination,
//! authenticated with the extender's shared secret.

use bytes::{BufMut, Bytes, BytesMut};

use trellis_crypto::{sign_extender_header, verify_extender_header};

use crate::codec::{WireReader, put_bytes_field, put_u64_field};
use crate::{Result, WireError};

/// Destination-naming header sent to an extender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtenderHeader {
    /// True destination host
    pub destination_host: String,
    /// True destination port
    pub destination_port: u16,
    /// Unix seconds at signing time
    pub timestamp: u64,
    /// Random nonce bound into the signature
    pub nonce: Bytes,
    /// `HMAC_SHA256(secret, timestamp_be || nonce)`
    pub signature: Bytes,
}

impl ExtenderHeader {
    /// Build and sign a header
    pub fn sign(
        destination_host: impl Into<String>,
        destination_port: u16,
        timestamp: u64,
        nonce: Bytes,
        secret: &[u8],
    ) -> Self {
        let signature = sign_extender_header(secret, timestamp, &nonce);
        Self {
            destination_host: destination_host.into(),
            destination_port,
            timestamp,
            nonce,
            signature: Bytes::copy_from_slice(&signature),
        }
    }

    /// Verify the signature against `secret`
    pub fn verify(&self, secret: &[u8]) -> bool {
        verify_extender_header(secret, self.timestamp, &self.nonce, &self.signature)
    }

    /// Encode with the 4-byte big-endian length prefix
    pub fn encode_with_length(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(self.destination_host.len() + 96);
        put_bytes_field(&mut body, 1, self.destination_host.as_bytes());
        put_u64_field(&mut body, 2, u64::from(self.destination_port));
        put_u64_field(&mut body, 3, self.timestamp);
        put_bytes_field(&mut body, 4, &self.nonce);
        put_bytes_field(&mut body, 5, &self.signature);

        let mut buf = BytesMut::with_capacity(body.len() + 4);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Decode a length-prefixed header, returning it and the bytes consumed
    pub fn decode_with_length(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < 4 {
            return Err(WireError::Truncated {
                expected: 4,
                got: bytes.len(),
            });
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + len {
            return Err(WireError::Truncated {
                expected: 4 + len,
                got: bytes.len(),
            });
        }

        let mut reader = WireReader::new(&bytes[4..4 + len]);
        let mut header = ExtenderHeader {
            destination_host: String::new(),
            destination_port: 0,
            timestamp: 0,
            nonce: Bytes::new(),
            signature: Bytes::new(),
        };

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => {
                    header.destination_host =
                        String::from_utf8_lossy(reader.read_bytes()?).into_owned();
                }
                2 => header.destination_port = reader.read_varint()? as u16,
                3 => header.timestamp = reader.read_varint()?,
                4 => header.nonce = Bytes::copy_from_slice(reader.read_bytes()?),
                5 => header.signature = Bytes::copy_from_slice(reader.read_bytes()?),
                _ => reader.skip(wire)?,
            }
        }

        if header.destination_host.is_empty() {
            return Err(WireError::MissingField {
                message: "ExtenderHeader",
                field: 1,
            });
        }
        Ok((header, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = ExtenderHeader::sign(
            "relay.example.com",
            443,
            1_700_000_000,
            Bytes::from_static(b"0123456789abcdef"),
            b"extender secret",
        );

        let encoded = header.encode_with_length();
        let (decoded, consumed) = ExtenderHeader::decode_with_length(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, header);
        assert!(decoded.verify(b"extender secret"));
        assert!(!decoded.verify(b"wrong secret"));
    }

    #[test]
    fn test_trailing_stream_bytes_left() {
        let header = ExtenderHeader::sign(
            "relay.example.com",
            443,
            1_700_000_000,
            Bytes::from_static(b"nonce"),
            b"secret",
        );

        let mut stream = header.encode_with_length().to_vec();
        stream.extend_from_slice(b"tls bytes follow");
        let (_, consumed) = ExtenderHeader::decode_with_length(&stream).unwrap();
        assert_eq!(&stream[consumed..], b"tls bytes follow");
    }

    #[test]
    fn test_truncated_header() {
        let header = ExtenderHeader::sign(
            "relay.example.com",
            443,
            1_700_000_000,
            Bytes::from_static(b"nonce"),
            b"secret",
        );
        let encoded = header.encode_with_length();
        assert!(ExtenderHeader::decode_with_length(&encoded[..encoded.len() - 1]).is_err());
        assert!(ExtenderHeader::decode_with_length(&encoded[..2]).is_err());
    }
}
