//! Trellis Wire Formats
//!
//! Encoding and decoding for everything trellis puts on a route:
//! transfer frames, packs and acks, contracts, control messages, and the
//! extender header. The codec speaks the protobuf wire format so field
//! numbers stay compatible with the platform's definitions.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod codec;
pub mod contract;
pub mod control;
pub mod error;
pub mod extender;
pub mod frame;
pub mod pack;

pub use contract::{Contract, StoredContract};
pub use control::{
    CloseContract, ControlMessage, CreateContract, CreateContractResult, PeerAudit, Provide,
    ProvideKey,
};
pub use error::{Result, WireError};
pub use extender::ExtenderHeader;
pub use frame::{Frame, MessageType, TransferFrame};
pub use pack::{Ack, Pack};
