//! Transfer frames
//!
//! Every message on a route is a [`TransferFrame`]: an addressing path
//! plus one typed inner [`Frame`]. The dispatcher first decodes only the
//! path (the filtered view) to decide local-versus-forward before paying
//! for a full parse.

use bytes::{Bytes, BytesMut};

use trellis_core::TransferPath;

use crate::codec::{WireReader, put_bytes_field, put_id_field, put_u64_field};
use crate::{Result, WireError};

/// Inner message discriminant
///
/// Values are wire-compatible with the platform's definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MessageType {
    /// Receipt for a pack
    TransferAck = 1,
    /// Sequenced payload carrier
    TransferPack = 2,
    /// Standalone contract frame
    TransferContract = 3,
    /// Provide-key announcement (control)
    Provide = 4,
    /// Contract request (control)
    CreateContract = 5,
    /// Contract response (control)
    CreateContractResult = 6,
    /// Contract close or checkpoint (control)
    CloseContract = 7,
    /// Peer behavior report (control)
    PeerAudit = 8,
}

impl MessageType {
    /// Parse from the wire discriminant
    pub fn from_raw(raw: u64) -> Result<Self> {
        match raw {
            1 => Ok(MessageType::TransferAck),
            2 => Ok(MessageType::TransferPack),
            3 => Ok(MessageType::TransferContract),
            4 => Ok(MessageType::Provide),
            5 => Ok(MessageType::CreateContract),
            6 => Ok(MessageType::CreateContractResult),
            7 => Ok(MessageType::CloseContract),
            8 => Ok(MessageType::PeerAudit),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// One typed message: discriminant plus encoded body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Inner message type
    pub message_type: MessageType,
    /// Encoded inner message
    pub message_bytes: Bytes,
}

impl Frame {
    /// Wrap an encoded message body
    pub fn new(message_type: MessageType, message_bytes: Bytes) -> Self {
        Self {
            message_type,
            message_bytes,
        }
    }

    /// Encode to a fresh buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.message_bytes.len() + 8);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        put_u64_field(buf, 1, self.message_type as u64);
        put_bytes_field(buf, 2, &self.message_bytes);
    }

    /// Decode from encoded bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut message_type = None;
        let mut message_bytes = Bytes::new();

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => message_type = Some(MessageType::from_raw(reader.read_varint()?)?),
                2 => message_bytes = Bytes::copy_from_slice(reader.read_bytes()?),
                _ => reader.skip(wire)?,
            }
        }

        Ok(Self {
            message_type: message_type.ok_or(WireError::MissingField {
                message: "Frame",
                field: 1,
            })?,
            message_bytes,
        })
    }
}

fn encode_path(buf: &mut BytesMut, path: &TransferPath) {
    put_id_field(buf, 1, path.source_id);
    put_id_field(buf, 2, path.destination_id);
    put_id_field(buf, 3, path.stream_id);
}

fn decode_path(bytes: &[u8]) -> Result<TransferPath> {
    let mut reader = WireReader::new(bytes);
    let mut path = TransferPath::default();

    while !reader.is_at_end() {
        let (field, wire) = reader.read_key()?;
        match field {
            1 => path.source_id = reader.read_id(1)?,
            2 => path.destination_id = reader.read_id(2)?,
            3 => path.stream_id = reader.read_id(3)?,
            _ => reader.skip(wire)?,
        }
    }

    Ok(path)
}

/// Addressed frame as carried by routes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFrame {
    /// Addressing triple
    pub path: TransferPath,
    /// Inner message
    pub frame: Frame,
}

impl TransferFrame {
    /// Create a transfer frame
    pub fn new(path: TransferPath, frame: Frame) -> Self {
        Self { path, frame }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut path_buf = BytesMut::with_capacity(64);
        encode_path(&mut path_buf, &self.path);

        let mut frame_buf = BytesMut::with_capacity(self.frame.message_bytes.len() + 8);
        self.frame.encode_into(&mut frame_buf);

        let mut buf = BytesMut::with_capacity(path_buf.len() + frame_buf.len() + 8);
        put_bytes_field(&mut buf, 1, &path_buf);
        put_bytes_field(&mut buf, 2, &frame_buf);
        buf.freeze()
    }

    /// Decode the full frame
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut path = TransferPath::default();
        let mut frame = None;

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => path = decode_path(reader.read_bytes()?)?,
                2 => frame = Some(Frame::decode(reader.read_bytes()?)?),
                _ => reader.skip(wire)?,
            }
        }

        Ok(Self {
            path,
            frame: frame.ok_or(WireError::MissingField {
                message: "TransferFrame",
                field: 2,
            })?,
        })
    }

    /// Decode only the path (filtered view)
    ///
    /// Skips the inner frame entirely and tolerates unknown fields, so
    /// the dispatcher can route frames it cannot fully parse.
    pub fn decode_path_only(bytes: &[u8]) -> Result<TransferPath> {
        let mut reader = WireReader::new(bytes);
        let mut path = TransferPath::default();

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => path = decode_path(reader.read_bytes()?)?,
                _ => reader.skip(wire)?,
            }
        }

        Ok(path)
    }
}
