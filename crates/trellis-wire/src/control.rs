//! Control channel messages
//!
//! Everything a client says to the platform rides the normal transport
//! addressed to the control peer: provide-key announcements, contract
//! requests and closes, and peer audits. Control traffic is exempt from
//! contract metering.

use bytes::{Bytes, BytesMut};

use trellis_core::Id;
use trellis_crypto::ProvideMode;

use crate::codec::{WireReader, put_bool_field, put_bytes_field, put_id_field, put_u64_field};
use crate::contract::Contract;
use crate::frame::{Frame, MessageType};
use crate::{Result, WireError};

/// One announced provide key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvideKey {
    /// Mode the secret covers
    pub mode: ProvideMode,
    /// 32-byte HMAC secret
    pub secret: Bytes,
}

/// Provide-key announcement
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Provide {
    /// Active keys, one per enabled mode
    pub keys: Vec<ProvideKey>,
}

/// Out-of-band contract request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateContract {
    /// Destination the contract should authorize
    pub destination_id: Id,
    /// Requested byte budget
    pub transfer_byte_count: u64,
    /// Companion to an existing reverse contract
    pub companion: bool,
    /// Contract ids already consumed against this destination
    pub used_contract_ids: Vec<Id>,
    /// Stream scope, when stream-addressed
    pub stream_id: Id,
}

/// Response to [`CreateContract`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateContractResult {
    /// Issued contract on success
    pub contract: Option<Contract>,
    /// Failure reason on refusal
    pub error: Option<String>,
}

/// Contract close or checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseContract {
    /// Contract being settled
    pub contract_id: Id,
    /// Bytes confirmed delivered
    pub acked_byte_count: u64,
    /// Bytes charged but unconfirmed
    pub unacked_byte_count: u64,
    /// Temporary surrender keeping the used-id record
    pub checkpoint: bool,
}

/// Peer behavior report
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerAudit {
    /// Peer being reported
    pub source_id: Id,
    /// Covered interval in milliseconds
    pub duration_millis: u64,
    /// Undecodable messages
    pub bad_message_count: u64,
    /// Contract verification failures
    pub bad_contract_count: u64,
    /// Messages dropped for backpressure or budget
    pub discard_count: u64,
    /// Duplicate (already-delivered) messages
    pub resend_count: u64,
    /// Messages delivered
    pub receive_message_count: u64,
    /// Bytes delivered
    pub receive_byte_count: u64,
}

/// Any control message, tagged by frame type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Provide-key announcement
    Provide(Provide),
    /// Contract request
    CreateContract(CreateContract),
    /// Contract response
    CreateContractResult(CreateContractResult),
    /// Contract close/checkpoint
    CloseContract(CloseContract),
    /// Peer report
    PeerAudit(PeerAudit),
}

impl Provide {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(48 * self.keys.len() + 8);
        for key in &self.keys {
            let mut key_buf = BytesMut::with_capacity(48);
            put_u64_field(&mut key_buf, 1, key.mode as u64);
            put_bytes_field(&mut key_buf, 2, &key.secret);
            put_bytes_field(&mut buf, 1, &key_buf);
        }
        buf.freeze()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut keys = Vec::new();

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => {
                    let mut key_reader = WireReader::new(reader.read_bytes()?);
                    let mut mode = ProvideMode::None;
                    let mut secret = Bytes::new();
                    while !key_reader.is_at_end() {
                        let (key_field, key_wire) = key_reader.read_key()?;
                        match key_field {
                            1 => {
                                let raw = key_reader.read_varint()?;
                                mode = ProvideMode::from_byte(raw as u8)
                                    .ok_or(WireError::Malformed("Provide mode"))?;
                            }
                            2 => secret = Bytes::copy_from_slice(key_reader.read_bytes()?),
                            _ => key_reader.skip(key_wire)?,
                        }
                    }
                    keys.push(ProvideKey { mode, secret });
                }
                _ => reader.skip(wire)?,
            }
        }

        Ok(Self { keys })
    }
}

impl CreateContract {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + 18 * self.used_contract_ids.len());
        put_id_field(&mut buf, 1, self.destination_id);
        put_u64_field(&mut buf, 2, self.transfer_byte_count);
        put_bool_field(&mut buf, 3, self.companion);
        for id in &self.used_contract_ids {
            put_bytes_field(&mut buf, 4, id.as_bytes());
        }
        put_id_field(&mut buf, 5, self.stream_id);
        buf.freeze()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut message = CreateContract {
            destination_id: Id::NIL,
            transfer_byte_count: 0,
            companion: false,
            used_contract_ids: Vec::new(),
            stream_id: Id::NIL,
        };

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => message.destination_id = reader.read_id(1)?,
                2 => message.transfer_byte_count = reader.read_varint()?,
                3 => message.companion = reader.read_bool()?,
                4 => message.used_contract_ids.push(reader.read_id(4)?),
                5 => message.stream_id = reader.read_id(5)?,
                _ => reader.skip(wire)?,
            }
        }

        Ok(message)
    }
}

impl CreateContractResult {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        if let Some(contract) = &self.contract {
            put_bytes_field(&mut buf, 1, &contract.encode());
        }
        if let Some(error) = &self.error {
            put_bytes_field(&mut buf, 2, error.as_bytes());
        }
        buf.freeze()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut message = CreateContractResult::default();

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => message.contract = Some(Contract::decode(reader.read_bytes()?)?),
                2 => {
                    message.error = Some(
                        String::from_utf8_lossy(reader.read_bytes()?).into_owned(),
                    );
                }
                _ => reader.skip(wire)?,
            }
        }

        Ok(message)
    }
}

impl CloseContract {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        put_id_field(&mut buf, 1, self.contract_id);
        put_u64_field(&mut buf, 2, self.acked_byte_count);
        put_u64_field(&mut buf, 3, self.unacked_byte_count);
        put_bool_field(&mut buf, 4, self.checkpoint);
        buf.freeze()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut message = CloseContract {
            contract_id: Id::NIL,
            acked_byte_count: 0,
            unacked_byte_count: 0,
            checkpoint: false,
        };

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => message.contract_id = reader.read_id(1)?,
                2 => message.acked_byte_count = reader.read_varint()?,
                3 => message.unacked_byte_count = reader.read_varint()?,
                4 => message.checkpoint = reader.read_bool()?,
                _ => reader.skip(wire)?,
            }
        }

        if message.contract_id.is_nil() {
            return Err(WireError::MissingField {
                message: "CloseContract",
                field: 1,
            });
        }
        Ok(message)
    }
}

impl PeerAudit {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(96);
        put_id_field(&mut buf, 1, self.source_id);
        put_u64_field(&mut buf, 2, self.duration_millis);
        put_u64_field(&mut buf, 3, self.bad_message_count);
        put_u64_field(&mut buf, 4, self.bad_contract_count);
        put_u64_field(&mut buf, 5, self.discard_count);
        put_u64_field(&mut buf, 6, self.resend_count);
        put_u64_field(&mut buf, 7, self.receive_message_count);
        put_u64_field(&mut buf, 8, self.receive_byte_count);
        buf.freeze()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(bytes);
        let mut message = PeerAudit::default();

        while !reader.is_at_end() {
            let (field, wire) = reader.read_key()?;
            match field {
                1 => message.source_id = reader.read_id(1)?,
                2 => message.duration_millis = reader.read_varint()?,
                3 => message.bad_message_count = reader.read_varint()?,
                4 => message.bad_contract_count = reader.read_varint()?,
                5 => message.discard_count = reader.read_varint()?,
                6 => message.resend_count = reader.read_varint()?,
                7 => message.receive_message_count = reader.read_varint()?,
                8 => message.receive_byte_count = reader.read_varint()?,
                _ => reader.skip(wire)?,
            }
        }

        Ok(message)
    }
}

impl ControlMessage {
    /// Wrap into a typed frame
    pub fn into_frame(&self) -> Frame {
        match self {
            ControlMessage::Provide(m) => Frame::new(MessageType::Provide, m.encode()),
            ControlMessage::CreateContract(m) => {
                Frame::new(MessageType::CreateContract, m.encode())
            }
            ControlMessage::CreateContractResult(m) => {
                Frame::new(MessageType::CreateContractResult, m.encode())
            }
            ControlMessage::CloseContract(m) => {
                Frame::new(MessageType::CloseContract, m.encode())
            }
            ControlMessage::PeerAudit(m) => Frame::new(MessageType::PeerAudit, m.encode()),
        }
    }

    /// Decode from a typed frame
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        match frame.message_type {
            MessageType::Provide => Ok(ControlMessage::Provide(Provide::decode(
                &frame.message_bytes,
            )?)),
            MessageType::CreateContract => Ok(ControlMessage::CreateContract(
                CreateContract::decode(&frame.message_bytes)?,
            )),
            MessageType::CreateContractResult => Ok(ControlMessage::CreateContractResult(
                CreateContractResult::decode(&frame.message_bytes)?,
            )),
            MessageType::CloseContract => Ok(ControlMessage::CloseContract(
                CloseContract::decode(&frame.message_bytes)?,
            )),
            MessageType::PeerAudit => Ok(ControlMessage::PeerAudit(PeerAudit::decode(
                &frame.message_bytes,
            )?)),
            _ => Err(WireError::Malformed("control frame")),
        }
    }
}
