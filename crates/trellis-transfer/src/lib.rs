//! Trellis Reliable Transfer Engine
//!
//! Ordered, reliably-delivered, contract-metered byte frames between
//! clients over the multi-route layer: send/receive/forward sequences,
//! the contract manager, and the client dispatch loop that ties them to
//! the routes.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod ack;
pub mod client;
pub mod contract;
pub mod error;
pub mod forward;
pub mod receive;
pub mod send;
pub mod settings;

pub use ack::{AckEntry, AckSnapshot, AckUpdate, AckWindow};
pub use client::{Client, StreamManager};
pub use contract::{ContractKey, ContractManager, ControlSink, SequenceContract};
pub use error::{Result, TransferError};
pub use forward::{ForwardBuffer, ForwardPack};
pub use receive::{ReceiveBuffer, ReceiveEvent, ReceiveKey, ReceivePack};
pub use send::{AckCallback, SendBuffer, SendKey, SendPack};
pub use settings::ClientSettings;
