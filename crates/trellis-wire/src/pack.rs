//! Pack and ack messages
//!
//! A [`Pack`] is the sequenced payload carrier; an [`Ack`] is its
//! receipt. Cumulative acks implicitly cover all earlier sequence
//! numbers, selective acks name a single out-of-order message.

use bytes::{Bytes, BytesMut};

use trellis_core::{Id, TransferPath};

use crate::codec::{
    WireReader, put_bool_field, put_bytes_field, put_id_field, put_u64_field,
};
use crate::frame::{Frame, MessageType, TransferFrame};
use crate::{Result, WireError};

/// Sequenced payload carrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pack {
    /// Message identifier, unique per send
    pub message_id: Id,
    /// Sequence instance this pack belongs to
    pub sequence_id: Id,
    /// Position in the sequence; zero for nack packs
    pub sequence_number: u64,
    /// First ack-required message of the sender's current state
    pub head: bool,
    /// Payload frames
    pub frames: Vec<Frame>,
    /// Contract installing frame, attached on contract switch and head
    pub contract_frame: Option<Frame>,
    /// At-most-once delivery without acks
    pub nack: bool,
}

impl Pack {
    /// Encode the pack body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        put_id_field(&mut buf, 1, self.message_id);
        put_id_field(&mut buf, 2, self.sequence_id);
        put_u64_field(&mut buf, 3, self.sequence_number);
        put_bool_field(&mut buf, 4, self.head);
        for frame in &self.frames {
            let mut frame_buf = BytesMut::with_capacity(frame.message_bytes.len() + 8);
            frame.encode_into(&mut frame_buf);
            put_bytes_field(&mut buf, 5, &frame_buf);
        }
        if let Some(contract_frame) = &self.contract_frame {
            let mut frame_buf = BytesMut::with_capacity(contract_frame.message_bytes.len() + 8);
            contract_frame.encode_into(&mut frame_buf);
            put_bytes_field(&mut buf, 6, &frame_buf);
        }
        put_bool_field(&mut buf, 7, self.nack);
        buf.freeze()
    }

    /// Decode a pack body
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut pack = Pack {
            message_id: Id::NIL,
            sequence_id: Id::NIL,
            sequence_number: 0,
            head: false,
            frames: Vec::new(),
            contract_frame: None,
            nack: false,
        };

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => pack.message_id = reader.read_id(1)?,
                2 => pack.sequence_id = reader.read_id(2)?,
                3 => pack.sequence_number = reader.read_varint()?,
                4 => pack.head = reader.read_bool()?,
                5 => pack.frames.push(Frame::decode(reader.read_bytes()?)?),
                6 => pack.contract_frame = Some(Frame::decode(reader.read_bytes()?)?),
                7 => pack.nack = reader.read_bool()?,
                _ => reader.skip(wire)?,
            }
        }

        if pack.message_id.is_nil() {
            return Err(WireError::MissingField {
                message: "Pack",
                field: 1,
            });
        }
        Ok(pack)
    }

    /// Wrap into an addressed transfer frame
    pub fn into_transfer_frame(&self, path: TransferPath) -> TransferFrame {
        TransferFrame::new(path, Frame::new(MessageType::TransferPack, self.encode()))
    }

    /// Sum of payload frame byte lengths
    pub fn message_byte_count(&self) -> u64 {
        self.frames
            .iter()
            .map(|f| f.message_bytes.len() as u64)
            .sum()
    }
}

/// Receipt for a pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Message being acknowledged
    pub message_id: Id,
    /// Sequence instance the message belonged to
    pub sequence_id: Id,
    /// Selective receipt: does not imply earlier messages arrived
    pub selective: bool,
}

impl Ack {
    /// Encode the ack body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(48);
        put_id_field(&mut buf, 1, self.message_id);
        put_id_field(&mut buf, 2, self.sequence_id);
        put_bool_field(&mut buf, 4, self.selective);
        buf.freeze()
    }

    /// Decode an ack body
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut ack = Ack {
            message_id: Id::NIL,
            sequence_id: Id::NIL,
            selective: false,
        };

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => ack.message_id = reader.read_id(1)?,
                2 => ack.sequence_id = reader.read_id(2)?,
                4 => ack.selective = reader.read_bool()?,
                _ => reader.skip(wire)?,
            }
        }

        if ack.message_id.is_nil() {
            return Err(WireError::MissingField {
                message: "Ack",
                field: 1,
            });
        }
        Ok(ack)
    }

    /// Wrap into an addressed transfer frame
    pub fn into_transfer_frame(&self, path: TransferPath) -> TransferFrame {
        TransferFrame::new(path, Frame::new(MessageType::TransferAck, self.encode()))
    }
}
