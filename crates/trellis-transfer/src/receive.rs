//! Receive sequences
//!
//! One task per `(source, sequence_id)` owns the reorder buffer, the
//! current receive contract, the outgoing ack window, and the peer
//! audit. Packs are delivered to the receive callbacks in sequence
//! number order; acks flow back compressed over the reverse path.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use trellis_core::{CallbackList, Id, QueueItem, TransferPath, TransferQueue};
use trellis_crypto::ProvideMode;
use trellis_route::{MultiRouteWriter, RouteManager};
use trellis_wire::{Ack, Contract, ControlMessage, Frame, Pack, PeerAudit};

use crate::ack::{AckUpdate, AckWindow};
use crate::contract::{ContractManager, ControlSink, SequenceContract};
use crate::error::{Result, TransferError};
use crate::settings::ClientSettings;

/// Message delivered to receive callbacks
#[derive(Clone)]
pub struct ReceiveEvent {
    /// Path the message arrived on (source is the peer)
    pub source: TransferPath,
    /// Payload frames in send order
    pub frames: Vec<Frame>,
    /// Provide mode of the charging contract; `None` when exempt
    pub provide_mode: ProvideMode,
}

/// One inbound pack routed to its sequence
pub struct ReceivePack {
    /// Arrival path; `source_id` is the sending peer
    pub source: TransferPath,
    /// Sequence instance
    pub sequence_id: Id,
    /// Decoded pack
    pub pack: Pack,
}

/// Identity of one receive sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiveKey {
    /// Arrival path
    pub source: TransferPath,
    /// Sequence instance
    pub sequence_id: Id,
}

// A head pack never waits here: the head jump at ingest makes it the
// next expected number, so it delivers straight through.
struct ReceiveItem {
    message_id: Id,
    sequence_number: u64,
    message_byte_count: u64,
    receive_time: Instant,
    frames: Vec<Frame>,
}

impl QueueItem for ReceiveItem {
    fn message_id(&self) -> Id {
        self.message_id
    }
    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
    fn byte_count(&self) -> u64 {
        self.message_byte_count
    }
}

fn by_sequence_number(a: &ReceiveItem, b: &ReceiveItem) -> CmpOrdering {
    a.sequence_number.cmp(&b.sequence_number)
}

type ReceiveItemQueue = TransferQueue<ReceiveItem, fn(&ReceiveItem, &ReceiveItem) -> CmpOrdering>;

/// Running peer audit, split at the max audit duration
struct AuditAccumulator {
    source_id: Id,
    audit: PeerAudit,
    start: Instant,
    control: Arc<dyn ControlSink>,
    settings: Arc<ClientSettings>,
}

impl AuditAccumulator {
    fn new(source_id: Id, control: Arc<dyn ControlSink>, settings: Arc<ClientSettings>) -> Self {
        Self {
            source_id,
            audit: PeerAudit {
                source_id,
                ..PeerAudit::default()
            },
            start: Instant::now(),
            control,
            settings,
        }
    }

    fn has_activity(&self) -> bool {
        self.audit != PeerAudit {
            source_id: self.source_id,
            ..PeerAudit::default()
        }
    }

    fn maybe_split(&mut self) {
        if self.start.elapsed() >= self.settings.max_peer_audit_duration && self.has_activity() {
            self.emit();
        }
    }

    fn emit(&mut self) {
        if !self.has_activity() {
            self.start = Instant::now();
            return;
        }
        self.audit.duration_millis = self.start.elapsed().as_millis() as u64;
        self.control
            .send_control(ControlMessage::PeerAudit(self.audit.clone()));
        self.audit = PeerAudit {
            source_id: self.source_id,
            ..PeerAudit::default()
        };
        self.start = Instant::now();
    }
}

struct ReceiveSequence {
    key: ReceiveKey,
    settings: Arc<ClientSettings>,
    contract_manager: Arc<ContractManager>,
    callbacks: Arc<CallbackList<ReceiveEvent>>,
    writer: MultiRouteWriter,
    cancel: CancellationToken,
    pack_rx: mpsc::Receiver<ReceivePack>,

    next_sequence_number: u64,
    receive_queue: ReceiveItemQueue,
    receive_contract: Option<SequenceContract>,
    ack_window: AckWindow,
    ack_flush_deadline: Option<Instant>,
    audit: AuditAccumulator,
    idle_deadline: Instant,
}

impl ReceiveSequence {
    async fn run(mut self) {
        info!(sequence = %self.key.sequence_id, source = %self.key.source, "receive sequence open");
        let exit = self.run_loop().await;

        match &exit {
            Ok(()) => debug!(sequence = %self.key.sequence_id, "receive sequence idle close"),
            Err(err) => {
                warn!(sequence = %self.key.sequence_id, error = %err, "receive sequence terminated");
            }
        }
        // Final flush so the sender is not left waiting on a lost ack.
        self.flush_acks().await;
        if let Some(contract) = self.receive_contract.take() {
            self.contract_manager
                .close_receive_contract(self.key.source.source_id, contract.contract_id());
        }
        self.audit.emit();
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            let wake = self.next_wake();
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Done),
                pack = self.pack_rx.recv() => match pack {
                    Some(pack) => {
                        self.ingest(pack).await?;
                        self.idle_deadline = Instant::now() + self.settings.receive_idle_timeout;
                    }
                    None => return Ok(()),
                },
                _ = tokio::time::sleep_until(wake) => {
                    self.handle_timers().await?;
                    if Instant::now() >= self.idle_deadline && self.receive_queue.is_empty() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn next_wake(&self) -> Instant {
        let mut wake = self.idle_deadline;
        if let Some(deadline) = self.ack_flush_deadline {
            wake = wake.min(deadline);
        }
        if let Some(gap) = self.gap_deadline() {
            wake = wake.min(gap);
        }
        wake
    }

    /// The oldest waiting reorder item bounds the gap wait
    fn gap_deadline(&self) -> Option<Instant> {
        self.receive_queue
            .iter()
            .map(|item| item.receive_time)
            .min()
            .map(|oldest| oldest + self.settings.gap_timeout)
    }

    async fn handle_timers(&mut self) -> Result<()> {
        let now = Instant::now();
        if let Some(gap) = self.gap_deadline() {
            if now >= gap {
                self.audit.audit.discard_count += self.receive_queue.len() as u64;
                return Err(TransferError::GapTimeout);
            }
        }
        if let Some(deadline) = self.ack_flush_deadline {
            if now >= deadline {
                self.ack_flush_deadline = None;
                self.flush_acks().await;
            }
        }
        self.audit.maybe_split();
        Ok(())
    }

    // ---- pack ingest ----

    async fn ingest(&mut self, received: ReceivePack) -> Result<()> {
        if received.sequence_id != self.key.sequence_id {
            // Misrouted: the buffer keys by sequence id, never mix state.
            self.audit.audit.bad_message_count += 1;
            return Ok(());
        }
        let pack = received.pack;

        if let Some(contract_frame) = &pack.contract_frame {
            self.install_contract(contract_frame)?;
        }

        if pack.nack {
            return self.deliver_nack(pack);
        }

        // Sender reset: a head pack may jump the window forward.
        if pack.head && pack.sequence_number > self.next_sequence_number {
            debug!(
                sequence = %self.key.sequence_id,
                from = self.next_sequence_number,
                to = pack.sequence_number,
                "head jump"
            );
            self.next_sequence_number = pack.sequence_number;
        }

        if pack.sequence_number == self.next_sequence_number {
            self.deliver(pack)?;
            self.drain_ready()?;
        } else if pack.sequence_number < self.next_sequence_number {
            // Duplicate: the ack was lost, wake the sender up again.
            trace!(sequence = %self.key.sequence_id, number = pack.sequence_number, "duplicate pack");
            self.audit.audit.resend_count += 1;
            self.ack_window.update(AckUpdate {
                message_id: pack.message_id,
                sequence_number: pack.sequence_number,
                selective: false,
            });
        } else {
            self.hold_for_reorder(pack);
        }

        self.schedule_ack_flush().await;
        Ok(())
    }

    fn install_contract(&mut self, contract_frame: &Frame) -> Result<()> {
        let contract = match Contract::decode(&contract_frame.message_bytes) {
            Ok(contract) => contract,
            Err(err) => {
                self.audit.audit.bad_message_count += 1;
                return Err(TransferError::ProtocolViolation(err.to_string()));
            }
        };
        let provide_mode = contract.provide_mode;
        let stored = match self.contract_manager.verify_receive_contract(&contract) {
            Ok(stored) => stored,
            Err(err) => {
                self.audit.audit.bad_contract_count += 1;
                return Err(err);
            }
        };
        if !self.key.source.is_stream() && stored.source_id != self.key.source.source_id {
            self.audit.audit.bad_contract_count += 1;
            return Err(TransferError::BadContract);
        }

        if let Some(previous) = self.receive_contract.take() {
            if previous.contract_id() != stored.contract_id {
                self.contract_manager
                    .close_receive_contract(self.key.source.source_id, previous.contract_id());
            }
        }
        debug!(sequence = %self.key.sequence_id, contract = %stored.contract_id, mode = %provide_mode, "receive contract installed");
        self.receive_contract = Some(SequenceContract::new(
            contract,
            stored,
            1.0,
            self.settings.min_message_byte_count,
        ));
        Ok(())
    }

    /// Charge the contract for a delivery; errors unless exempt
    fn charge(&mut self, byte_count: u64) -> Result<ProvideMode> {
        if let Some(contract) = self.receive_contract.as_mut() {
            if contract.update(byte_count) {
                let charge = contract.charge_for(byte_count);
                contract.ack(charge);
                return Ok(contract.provide_mode());
            }
            self.audit.audit.bad_contract_count += 1;
            return Err(TransferError::BadContract);
        }
        if self
            .contract_manager
            .receive_no_contract(&self.key.source.source_id)
            && !self.key.source.is_stream()
        {
            return Ok(ProvideMode::None);
        }
        self.audit.audit.bad_contract_count += 1;
        Err(TransferError::BadContract)
    }

    fn deliver_nack(&mut self, pack: Pack) -> Result<()> {
        let byte_count = pack.message_byte_count();
        let provide_mode = self.charge(byte_count)?;

        self.audit.audit.receive_message_count += 1;
        self.audit.audit.receive_byte_count += byte_count;
        self.callbacks.dispatch(&ReceiveEvent {
            source: self.key.source,
            frames: pack.frames,
            provide_mode,
        });
        Ok(())
    }

    fn deliver(&mut self, pack: Pack) -> Result<()> {
        let byte_count = pack.message_byte_count();
        let provide_mode = self.charge(byte_count)?;

        self.audit.audit.receive_message_count += 1;
        self.audit.audit.receive_byte_count += byte_count;
        self.callbacks.dispatch(&ReceiveEvent {
            source: self.key.source,
            frames: pack.frames,
            provide_mode,
        });

        self.ack_window.update(AckUpdate {
            message_id: pack.message_id,
            sequence_number: pack.sequence_number,
            selective: false,
        });
        self.next_sequence_number = pack.sequence_number + 1;
        Ok(())
    }

    fn drain_ready(&mut self) -> Result<()> {
        while let Some(first) = self.receive_queue.peek_first() {
            if first.sequence_number() != self.next_sequence_number {
                break;
            }
            let item = self
                .receive_queue
                .remove_first()
                .expect("peeked reorder item");
            let provide_mode = self.charge(item.message_byte_count)?;

            self.audit.audit.receive_message_count += 1;
            self.audit.audit.receive_byte_count += item.message_byte_count;
            self.callbacks.dispatch(&ReceiveEvent {
                source: self.key.source,
                frames: item.frames,
                provide_mode,
            });
            self.ack_window.update(AckUpdate {
                message_id: item.message_id,
                sequence_number: item.sequence_number,
                selective: false,
            });
            self.next_sequence_number = item.sequence_number + 1;
        }
        Ok(())
    }

    fn hold_for_reorder(&mut self, pack: Pack) {
        let item = ReceiveItem {
            message_id: pack.message_id,
            sequence_number: pack.sequence_number,
            message_byte_count: pack.message_byte_count(),
            receive_time: Instant::now(),
            frames: pack.frames,
        };
        let message_id = item.message_id;
        let sequence_number = item.sequence_number;

        if self.receive_queue.add(item).is_some() {
            // Same message already waiting.
            self.audit.audit.resend_count += 1;
        }

        // Backpressure: shed from the far end until we fit. The item
        // just inserted only goes if it is itself the worst.
        let (_, mut byte_count) = self.receive_queue.queue_size();
        while byte_count > self.settings.receive_queue_max_byte_count {
            let Some(evicted) = self.receive_queue.remove_last() else {
                break;
            };
            trace!(number = evicted.sequence_number, "reorder queue eviction");
            self.audit.audit.discard_count += 1;
            if evicted.message_id == message_id {
                return; // the new arrival was the worst; no ack for it
            }
            byte_count = self.receive_queue.queue_size().1;
        }

        self.ack_window.update(AckUpdate {
            message_id,
            sequence_number,
            selective: true,
        });
    }

    // ---- ack emission ----

    /// First change flushes immediately; later changes coalesce behind
    /// the compress timeout.
    async fn schedule_ack_flush(&mut self) {
        if self.ack_window.is_empty() {
            return;
        }
        if self.ack_flush_deadline.is_none() {
            self.flush_acks().await;
            self.ack_flush_deadline =
                Some(Instant::now() + self.settings.ack_compress_timeout);
        }
    }

    async fn flush_acks(&mut self) {
        let snapshot = self.ack_window.snapshot(true);
        if snapshot.update_count == 0 {
            return;
        }
        let reply_path = self.key.source.reverse();

        if let Some(head) = snapshot.head {
            let ack = Ack {
                message_id: head.message_id,
                sequence_id: self.key.sequence_id,
                selective: false,
            };
            let frame = ack.into_transfer_frame(reply_path).encode();
            if let Err(err) = self.writer.write(frame, self.settings.write_timeout).await {
                trace!(error = %err, "head ack write failed");
            }
        }
        for entry in snapshot.selective {
            let ack = Ack {
                message_id: entry.message_id,
                sequence_id: self.key.sequence_id,
                selective: true,
            };
            let frame = ack.into_transfer_frame(reply_path).encode();
            if let Err(err) = self.writer.write(frame, self.settings.write_timeout).await {
                trace!(error = %err, "selective ack write failed");
            }
        }
    }
}

struct ReceiveHandle {
    pack_tx: mpsc::Sender<ReceivePack>,
    cancel: CancellationToken,
}

/// Registry of live receive sequences, keyed by [`ReceiveKey`]
pub struct ReceiveBuffer {
    settings: Arc<ClientSettings>,
    contract_manager: Arc<ContractManager>,
    route_manager: Arc<RouteManager>,
    control: Arc<dyn ControlSink>,
    callbacks: Arc<CallbackList<ReceiveEvent>>,
    cancel: CancellationToken,
    inner: Mutex<HashMap<ReceiveKey, ReceiveHandle>>,
}

impl ReceiveBuffer {
    /// Create a buffer rooted under `cancel`
    pub fn new(
        settings: Arc<ClientSettings>,
        contract_manager: Arc<ContractManager>,
        route_manager: Arc<RouteManager>,
        control: Arc<dyn ControlSink>,
        callbacks: Arc<CallbackList<ReceiveEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            contract_manager,
            route_manager,
            control,
            callbacks,
            cancel,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Route a pack to its sequence, spawning one as needed
    pub async fn pack(&self, received: ReceivePack) -> Result<()> {
        let key = ReceiveKey {
            source: received.source,
            sequence_id: received.sequence_id,
        };
        let mut received = received;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Done);
            }
            let pack_tx = self.handle_for(&key);
            match pack_tx.send(received).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => received = returned,
            }
        }
    }

    /// Cancel every sequence matching `predicate`
    pub fn cancel_where(&self, predicate: impl Fn(&ReceiveKey) -> bool) {
        let inner = self.inner.lock();
        for (key, handle) in inner.iter() {
            if predicate(key) {
                handle.cancel.cancel();
            }
        }
    }

    /// Cancel all sequences
    pub fn close(&self) {
        self.cancel_where(|_| true);
    }

    fn handle_for(&self, key: &ReceiveKey) -> mpsc::Sender<ReceivePack> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.get(key) {
            if !handle.pack_tx.is_closed() {
                return handle.pack_tx.clone();
            }
        }

        let (pack_tx, pack_rx) = mpsc::channel(self.settings.sequence_buffer_size);
        let cancel = self.cancel.child_token();

        let sequence = ReceiveSequence {
            key: key.clone(),
            settings: self.settings.clone(),
            contract_manager: self.contract_manager.clone(),
            callbacks: self.callbacks.clone(),
            writer: self
                .route_manager
                .open_multi_route_writer(key.source.reverse()),
            cancel: cancel.clone(),
            pack_rx,
            next_sequence_number: 0,
            receive_queue: TransferQueue::new(by_sequence_number),
            receive_contract: None,
            ack_window: AckWindow::new(),
            ack_flush_deadline: None,
            audit: AuditAccumulator::new(
                key.source.source_id,
                self.control.clone(),
                self.settings.clone(),
            ),
            idle_deadline: Instant::now() + self.settings.receive_idle_timeout,
        };
        tokio::spawn(sequence.run());

        inner.insert(
            key.clone(),
            ReceiveHandle {
                pack_tx: pack_tx.clone(),
                cancel,
            },
        );
        pack_tx
    }
}
