//! Trellis Core Types and Utilities
//!
//! This crate provides the fundamental types used throughout trellis:
//! time-ordered identifiers, transfer paths, the ordered transfer queue,
//! notification primitives, and the RTT estimator.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod id;
pub mod monitor;
pub mod path;
pub mod queue;
pub mod rtt;
pub mod shuffle;

pub use error::{CoreError, Result};
pub use id::{Id, MultiHopId, CONTROL_ID, MAX_HOPS};
pub use monitor::{CallbackId, CallbackList, IdleCondition, IdleGuard, Monitor};
pub use path::TransferPath;
pub use queue::{QueueItem, TransferQueue};
pub use rtt::{RttTag, RttWindow, RttWindowConfig};
pub use shuffle::weighted_shuffle;
