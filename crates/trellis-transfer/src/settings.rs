//! Client settings
//!
//! All knobs are passed in code; there is no file or environment layer.
//! Defaults follow the production timeout budgets.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tuning for one client and all of its sequences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Client read loop stall budget
    pub read_timeout: Duration,
    /// Single route write budget
    pub write_timeout: Duration,
    /// Outstanding message lifetime; exceeding it kills the sequence
    pub ack_timeout: Duration,
    /// Send sequence self-close after quiet
    pub send_idle_timeout: Duration,
    /// Receive sequence self-close after quiet
    pub receive_idle_timeout: Duration,
    /// Forward sequence self-close after quiet
    pub forward_idle_timeout: Duration,
    /// How long a reorder gap may stall delivery
    pub gap_timeout: Duration,
    /// Base retransmit interval (linear backoff applies)
    pub resend_interval: Duration,
    /// Backoff scale per prior send of the same message
    pub resend_backoff_scale: f32,
    /// Resend deferral after a selective ack
    pub selective_ack_timeout: Duration,
    /// Outgoing ack coalescing window
    pub ack_compress_timeout: Duration,

    /// Retransmit queue byte cap (backpressure threshold)
    pub resend_queue_max_byte_count: u64,
    /// Reorder queue byte cap (eviction threshold)
    pub receive_queue_max_byte_count: u64,
    /// Pack channel depth per sequence
    pub sequence_buffer_size: usize,

    /// Give-up budget for contract acquisition
    pub create_contract_timeout: Duration,
    /// Pacing between create-contract retries
    pub create_contract_retry_interval: Duration,
    /// Requested budget per new contract
    pub contract_transfer_byte_count: u64,
    /// Fraction of a contract's budget the sender trusts
    pub contract_fill_fraction: f32,
    /// Floor charge per message
    pub min_message_byte_count: u64,
    /// Audit emission split boundary
    pub max_peer_audit_duration: Duration,
    /// Peers are contract-exempt before this instant
    pub no_contract_until: Option<DateTime<Utc>>,
    /// Parse forwarded frames for schema sanity
    pub verify_forward_messages: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(60),
            send_idle_timeout: Duration::from_secs(60),
            receive_idle_timeout: Duration::from_secs(120),
            forward_idle_timeout: Duration::from_secs(60),
            gap_timeout: Duration::from_secs(60),
            resend_interval: Duration::from_secs(1),
            resend_backoff_scale: 1.0,
            selective_ack_timeout: Duration::from_secs(5),
            ack_compress_timeout: Duration::from_millis(10),

            resend_queue_max_byte_count: 16 * 1024 * 1024,
            receive_queue_max_byte_count: 16 * 1024 * 1024,
            sequence_buffer_size: 32,

            create_contract_timeout: Duration::from_secs(30),
            create_contract_retry_interval: Duration::from_secs(5),
            contract_transfer_byte_count: 128 * 1024 * 1024,
            contract_fill_fraction: 0.5,
            min_message_byte_count: 256,
            max_peer_audit_duration: Duration::from_secs(30),
            no_contract_until: None,
            verify_forward_messages: false,
        }
    }
}
