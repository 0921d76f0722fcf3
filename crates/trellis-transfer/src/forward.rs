//! Forward sequences
//!
//! Relay participants pass transfer frames through unchanged: one task
//! per destination writes raw bytes to that destination's routes,
//! closing itself after the idle timeout. Verification is optional and
//! only affects auditing, never the bytes forwarded.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use trellis_core::{Id, TransferPath};
use trellis_route::{MultiRouteWriter, RouteManager};
use trellis_wire::{
    Ack, ControlMessage, MessageType, Pack, PeerAudit, TransferFrame,
};

use crate::contract::ControlSink;
use crate::error::{Result, TransferError};
use crate::settings::ClientSettings;

/// One frame to relay
pub struct ForwardPack {
    /// Decoded path (filtered view); source is the penalized party
    pub path: TransferPath,
    /// The frame exactly as it arrived
    pub bytes: Bytes,
}

struct ForwardSequence {
    destination: TransferPath,
    settings: Arc<ClientSettings>,
    control: Arc<dyn ControlSink>,
    writer: MultiRouteWriter,
    cancel: CancellationToken,
    pack_rx: mpsc::Receiver<ForwardPack>,
    // Per-source parse failures, reported when the sequence closes
    bad_sources: HashMap<Id, u64>,
    idle_deadline: Instant,
}

impl ForwardSequence {
    async fn run(mut self) {
        info!(destination = %self.destination, "forward sequence open");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                pack = self.pack_rx.recv() => match pack {
                    Some(pack) => {
                        self.forward(pack).await;
                        self.idle_deadline =
                            Instant::now() + self.settings.forward_idle_timeout;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(self.idle_deadline) => {
                    debug!(destination = %self.destination, "forward sequence idle close");
                    break;
                }
            }
        }
        self.emit_audits();
    }

    async fn forward(&mut self, pack: ForwardPack) {
        if self.settings.verify_forward_messages && !self.verify(&pack) {
            *self.bad_sources.entry(pack.path.source_id).or_default() += 1;
            return;
        }

        if let Err(err) = self
            .writer
            .write(pack.bytes, self.settings.write_timeout)
            .await
        {
            // Transient by design: the origin's retransmit covers us.
            trace!(destination = %self.destination, error = %err, "forward write failed");
        }
    }

    /// Schema sanity of the frame shell; payload stays opaque
    fn verify(&self, pack: &ForwardPack) -> bool {
        let Ok(frame) = TransferFrame::decode(&pack.bytes) else {
            return false;
        };
        match frame.frame.message_type {
            MessageType::TransferPack => Pack::decode(&frame.frame.message_bytes).is_ok(),
            MessageType::TransferAck => Ack::decode(&frame.frame.message_bytes).is_ok(),
            _ => true,
        }
    }

    fn emit_audits(&mut self) {
        for (source_id, bad_message_count) in self.bad_sources.drain() {
            warn!(source = %source_id, count = bad_message_count, "forwarded frames failed verification");
            self.control.send_control(ControlMessage::PeerAudit(PeerAudit {
                source_id,
                bad_message_count,
                ..PeerAudit::default()
            }));
        }
    }
}

struct ForwardHandle {
    pack_tx: mpsc::Sender<ForwardPack>,
    cancel: CancellationToken,
}

/// Registry of live forward sequences, keyed by destination path
pub struct ForwardBuffer {
    settings: Arc<ClientSettings>,
    route_manager: Arc<RouteManager>,
    control: Arc<dyn ControlSink>,
    cancel: CancellationToken,
    inner: Mutex<HashMap<TransferPath, ForwardHandle>>,
}

impl ForwardBuffer {
    /// Create a buffer rooted under `cancel`
    pub fn new(
        settings: Arc<ClientSettings>,
        route_manager: Arc<RouteManager>,
        control: Arc<dyn ControlSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            route_manager,
            control,
            cancel,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Relay one frame toward its destination
    pub async fn pack(&self, pack: ForwardPack) -> Result<()> {
        let destination = if pack.path.is_stream() {
            pack.path
        } else {
            TransferPath::to_destination(pack.path.destination_id)
        };
        let mut pack = pack;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Done);
            }
            let pack_tx = self.handle_for(&destination);
            match pack_tx.send(pack).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => pack = returned,
            }
        }
    }

    /// Cancel all sequences
    pub fn close(&self) {
        let inner = self.inner.lock();
        for handle in inner.values() {
            handle.cancel.cancel();
        }
    }

    fn handle_for(&self, destination: &TransferPath) -> mpsc::Sender<ForwardPack> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.get(destination) {
            if !handle.pack_tx.is_closed() {
                return handle.pack_tx.clone();
            }
        }

        let (pack_tx, pack_rx) = mpsc::channel(self.settings.sequence_buffer_size);
        let cancel = self.cancel.child_token();

        let sequence = ForwardSequence {
            destination: *destination,
            settings: self.settings.clone(),
            control: self.control.clone(),
            writer: self.route_manager.open_multi_route_writer(*destination),
            cancel: cancel.clone(),
            pack_rx,
            bad_sources: HashMap::new(),
            idle_deadline: Instant::now() + self.settings.forward_idle_timeout,
        };
        tokio::spawn(sequence.run());

        inner.insert(
            *destination,
            ForwardHandle {
                pack_tx: pack_tx.clone(),
                cancel,
            },
        );
        pack_tx
    }
}
