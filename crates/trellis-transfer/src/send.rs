//! Send sequences
//!
//! One task per `(destination, intermediaries, companion)` key owns the
//! reliable ordered send state: the live-item queue, the retransmit
//! schedule, the charging contract, and the incoming ack window. Packs
//! enter through a bounded channel; the task pushes frames at the route
//! writer and keeps them until cumulatively acked or fatally timed out.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use trellis_core::{
    Id, MultiHopId, QueueItem, RttTag, RttWindow, RttWindowConfig, TransferPath, TransferQueue,
};
use trellis_route::{MultiRouteWriter, RouteManager};
use trellis_wire::{Ack, Frame, Pack};

use crate::ack::{AckUpdate, AckWindow};
use crate::contract::{ContractKey, ContractManager, SequenceContract};
use crate::error::{Result, TransferError};
use crate::settings::ClientSettings;

/// One-shot completion callback for a send
pub type AckCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Identity of one send sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SendKey {
    /// Destination (or stream) path
    pub destination: TransferPath,
    /// Intermediary relays
    pub intermediaries: MultiHopId,
    /// Ride an existing reverse contract
    pub companion: bool,
}

impl SendKey {
    /// Key for a plain destination
    pub fn to_destination(destination_id: Id) -> Self {
        Self {
            destination: TransferPath::to_destination(destination_id),
            intermediaries: MultiHopId::empty(),
            companion: false,
        }
    }

    /// Key for a stream path
    pub fn to_stream(stream_id: Id) -> Self {
        Self {
            destination: TransferPath::stream(stream_id),
            intermediaries: MultiHopId::empty(),
            companion: false,
        }
    }

    /// The contract queue this sequence draws from
    pub fn contract_key(&self) -> ContractKey {
        ContractKey {
            destination: self.destination,
            intermediaries: self.intermediaries.clone(),
            companion: self.companion,
        }
    }
}

/// One send request
pub struct SendPack {
    /// Payload frames
    pub frames: Vec<Frame>,
    /// At-most-once, unsequenced delivery
    pub nack: bool,
    /// Completion callback
    pub ack_callback: Option<AckCallback>,
}

struct SendItem {
    message_id: Id,
    sequence_number: u64,
    message_byte_count: u64,
    charged_byte_count: u64,
    contract_id: Option<Id>,
    head: bool,
    send_time: Instant,
    resend_time: Instant,
    send_count: u64,
    rtt_tag: RttTag,
    frames: Vec<Frame>,
    transfer_frame_bytes: Bytes,
    ack_callback: Option<AckCallback>,
}

impl QueueItem for SendItem {
    fn message_id(&self) -> Id {
        self.message_id
    }
    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
    fn byte_count(&self) -> u64 {
        self.transfer_frame_bytes.len() as u64
    }
}

fn by_sequence_number(a: &SendItem, b: &SendItem) -> CmpOrdering {
    a.sequence_number.cmp(&b.sequence_number)
}

/// Lazy retransmit schedule entry; stale entries are skipped on pop
struct ResendEntry {
    resend_time: Instant,
    message_id: Id,
}

impl PartialEq for ResendEntry {
    fn eq(&self, other: &Self) -> bool {
        self.resend_time == other.resend_time && self.message_id == other.message_id
    }
}
impl Eq for ResendEntry {}
impl PartialOrd for ResendEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for ResendEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want earliest first.
        other
            .resend_time
            .cmp(&self.resend_time)
            .then_with(|| self.message_id.cmp(&other.message_id))
    }
}

type SendItemQueue = TransferQueue<SendItem, fn(&SendItem, &SendItem) -> CmpOrdering>;

struct SendSequence {
    client_id: Id,
    key: SendKey,
    sequence_id: Id,
    settings: Arc<ClientSettings>,
    contract_manager: Arc<ContractManager>,
    writer: MultiRouteWriter,
    cancel: CancellationToken,
    pack_rx: mpsc::Receiver<SendPack>,
    ack_rx: mpsc::Receiver<Ack>,

    next_sequence_number: u64,
    send_items: SendItemQueue,
    resend_heap: BinaryHeap<ResendEntry>,
    send_contract: Option<SequenceContract>,
    open_contracts: HashMap<Id, SequenceContract>,
    ack_window: AckWindow,
    rtt: RttWindow,
    idle_deadline: Instant,
}

impl SendSequence {
    fn path(&self) -> TransferPath {
        if self.key.destination.is_stream() {
            self.key.destination
        } else {
            TransferPath::new(self.client_id, self.key.destination.destination_id)
        }
    }

    async fn run(mut self) {
        let contract_key = self.key.contract_key();
        self.contract_manager.open_contract_queue(&contract_key);
        info!(sequence = %self.sequence_id, destination = %self.key.destination, "send sequence open");

        let exit = self.run_loop().await;

        match &exit {
            Ok(()) => debug!(sequence = %self.sequence_id, "send sequence idle close"),
            Err(err) => warn!(sequence = %self.sequence_id, error = %err, "send sequence terminated"),
        }
        self.shutdown(exit.err());
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            let wake = self.next_wake();
            let can_accept = self.under_resend_cap();

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Done),
                Some(ack) = self.ack_rx.recv() => {
                    self.handle_wire_ack(ack);
                    while let Ok(ack) = self.ack_rx.try_recv() {
                        self.handle_wire_ack(ack);
                    }
                    self.apply_ack_window();
                    self.touch_idle();
                }
                pack = self.pack_rx.recv(), if can_accept => match pack {
                    Some(pack) => {
                        self.handle_send(pack).await?;
                        self.touch_idle();
                    }
                    None => return Ok(()),
                },
                _ = tokio::time::sleep_until(wake) => {
                    if !self.handle_timers().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn touch_idle(&mut self) {
        self.idle_deadline = Instant::now() + self.settings.send_idle_timeout;
    }

    fn under_resend_cap(&self) -> bool {
        let (count, byte_count) = self.send_items.queue_size();
        count == 0 || byte_count < self.settings.resend_queue_max_byte_count
    }

    fn next_wake(&self) -> Instant {
        // The heap top may be stale; waking early only costs a no-op.
        match self.resend_heap.peek() {
            Some(entry) => entry.resend_time.min(self.idle_deadline),
            None => self.idle_deadline,
        }
    }

    fn base_resend_interval(&self) -> Duration {
        self.settings.resend_interval.max(self.rtt.scaled_rtt())
    }

    // ---- send path ----

    async fn handle_send(&mut self, pack: SendPack) -> Result<()> {
        let message_byte_count: u64 = pack
            .frames
            .iter()
            .map(|frame| frame.message_bytes.len() as u64)
            .sum();

        let (contract_id, charged_byte_count, attach_contract) =
            self.update_contract(message_byte_count).await?;

        let now = Instant::now();
        let (sequence_number, head) = if pack.nack {
            (0, false)
        } else {
            let sequence_number = self.next_sequence_number;
            self.next_sequence_number += 1;
            (sequence_number, self.send_items.is_empty())
        };

        // A head pack re-anchors the receiver and must re-install the
        // contract alongside.
        let contract_frame = if attach_contract || (head && contract_id.is_some()) {
            self.contract_frame_for(contract_id)
        } else {
            None
        };

        let message_id = Id::new();
        let wire_pack = Pack {
            message_id,
            sequence_id: self.sequence_id,
            sequence_number,
            head,
            frames: pack.frames.clone(),
            contract_frame,
            nack: pack.nack,
        };
        let transfer_frame_bytes = wire_pack.into_transfer_frame(self.path()).encode();

        let write_result = self
            .writer
            .write(transfer_frame_bytes.clone(), self.settings.write_timeout)
            .await;

        if pack.nack {
            // At-most-once: settle now, never retransmit.
            if let Some(callback) = pack.ack_callback {
                callback(write_result.map_err(TransferError::from));
            }
            return Ok(());
        }
        if let Err(err) = write_result {
            trace!(sequence = %self.sequence_id, error = %err, "first send failed, retransmit will cover");
        }

        let rtt_tag = self.rtt.open_tag(now.into_std());
        let resend_time = self.clamp_resend(now, now + self.base_resend_interval());
        let item = SendItem {
            message_id,
            sequence_number,
            message_byte_count,
            charged_byte_count,
            contract_id,
            head,
            send_time: now,
            resend_time,
            send_count: 1,
            rtt_tag,
            frames: pack.frames,
            transfer_frame_bytes,
            ack_callback: pack.ack_callback,
        };
        self.resend_heap.push(ResendEntry {
            resend_time,
            message_id,
        });
        self.send_items.add(item);
        Ok(())
    }

    /// Charge the current contract, acquiring a new one on overflow
    ///
    /// Returns `(contract_id, charged_byte_count, attach_contract_frame)`.
    async fn update_contract(
        &mut self,
        message_byte_count: u64,
    ) -> Result<(Option<Id>, u64, bool)> {
        let destination_id = self.key.destination.destination_id;
        let exempt = self.contract_manager.send_no_contract(&destination_id, self.key.companion)
            && !self.key.destination.is_stream()
            && self.key.intermediaries.is_empty();
        if exempt {
            return Ok((None, 0, false));
        }

        if let Some(contract) = self.send_contract.as_mut() {
            if contract.update(message_byte_count) {
                let charge = contract.charge_for(message_byte_count);
                return Ok((Some(contract.contract_id()), charge, false));
            }
        }

        // Overflow: acquire until one accepts the charge or we time out.
        let contract_key = self.key.contract_key();
        let deadline = Instant::now() + self.settings.create_contract_timeout;
        loop {
            let next = match self
                .contract_manager
                .take_contract(&contract_key, Duration::ZERO)
                .await
            {
                Some(next) => Some(next),
                None => {
                    if Instant::now() >= deadline {
                        return Err(TransferError::ContractUnavailable);
                    }
                    let request = self
                        .settings
                        .contract_transfer_byte_count
                        .max(message_byte_count);
                    self.contract_manager.create_contract(&contract_key, request);
                    let wait = self
                        .settings
                        .create_contract_retry_interval
                        .min(deadline.saturating_duration_since(Instant::now()));
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(TransferError::Done),
                        next = self.contract_manager.take_contract(&contract_key, wait) => next,
                    }
                }
            };

            let Some((contract, stored)) = next else {
                continue;
            };
            let mut sequence_contract = SequenceContract::new(
                contract,
                stored,
                self.settings.contract_fill_fraction,
                self.settings.min_message_byte_count,
            );
            if !sequence_contract.update(message_byte_count) {
                // Too small for even one message; settle and move on.
                self.contract_manager.complete_contract(
                    sequence_contract.contract_id(),
                    0,
                    0,
                    false,
                );
                continue;
            }
            let charge = sequence_contract.charge_for(message_byte_count);
            let contract_id = sequence_contract.contract_id();
            self.install_contract(sequence_contract);
            return Ok((Some(contract_id), charge, true));
        }
    }

    fn install_contract(&mut self, next: SequenceContract) {
        debug!(sequence = %self.sequence_id, contract = %next.contract_id(), "installing send contract");
        if let Some(previous) = self.send_contract.take() {
            if previous.unacked_byte_count() > 0 {
                self.open_contracts
                    .insert(previous.contract_id(), previous);
            } else {
                self.contract_manager.complete_contract(
                    previous.contract_id(),
                    previous.acked_byte_count(),
                    0,
                    false,
                );
            }
        }
        self.send_contract = Some(next);
    }

    fn contract_frame_for(&self, contract_id: Option<Id>) -> Option<Frame> {
        let contract_id = contract_id?;
        if let Some(contract) = self.send_contract.as_ref() {
            if contract.contract_id() == contract_id {
                return Some(contract.frame());
            }
        }
        self.open_contracts
            .get(&contract_id)
            .map(|contract| contract.frame())
    }

    // ---- ack path ----

    fn handle_wire_ack(&mut self, ack: Ack) {
        if ack.sequence_id != self.sequence_id {
            // A previous instance's receipt; this sequence never sent it.
            return;
        }
        let Some(item) = self.send_items.get_by_message_id(&ack.message_id) else {
            // Already settled: duplicate or stale receipt.
            return;
        };
        self.ack_window.update(AckUpdate {
            message_id: ack.message_id,
            sequence_number: item.sequence_number(),
            selective: ack.selective,
        });
    }

    fn apply_ack_window(&mut self) {
        let snapshot = self.ack_window.snapshot(true);
        let now = Instant::now();

        if let Some(head) = snapshot.head {
            while let Some(first) = self.send_items.peek_first() {
                if first.sequence_number() > head.sequence_number {
                    break;
                }
                let Some(mut item) = self.send_items.remove_first() else {
                    break;
                };
                trace!(
                    number = item.sequence_number,
                    bytes = item.message_byte_count,
                    "acked"
                );
                self.rtt.close_tag(item.rtt_tag, now.into_std());
                self.settle_contract_charge(&item);
                if let Some(callback) = item.ack_callback.take() {
                    callback(Ok(()));
                }
            }
        }

        for entry in snapshot.selective {
            // Out of order at the receiver: hold retransmission back.
            let Some(mut item) = self.send_items.remove_by_message_id(&entry.message_id) else {
                continue;
            };
            let resend_time =
                self.clamp_resend(item.send_time, now + self.settings.selective_ack_timeout);
            item.resend_time = resend_time;
            self.resend_heap.push(ResendEntry {
                resend_time,
                message_id: item.message_id,
            });
            self.send_items.add(item);
        }
    }

    fn settle_contract_charge(&mut self, item: &SendItem) {
        let Some(contract_id) = item.contract_id else {
            return;
        };
        if let Some(contract) = self.send_contract.as_mut() {
            if contract.contract_id() == contract_id {
                contract.ack(item.charged_byte_count);
                return;
            }
        }
        if let Some(contract) = self.open_contracts.get_mut(&contract_id) {
            contract.ack(item.charged_byte_count);
            if contract.unacked_byte_count() == 0 {
                let contract = self
                    .open_contracts
                    .remove(&contract_id)
                    .expect("contract present");
                self.contract_manager.complete_contract(
                    contract_id,
                    contract.acked_byte_count(),
                    0,
                    false,
                );
            }
        }
    }

    // ---- timers ----

    async fn handle_timers(&mut self) -> Result<bool> {
        let now = Instant::now();
        if self.send_items.is_empty() && now >= self.idle_deadline {
            return Ok(false);
        }

        while let Some(entry) = self.resend_heap.peek() {
            if entry.resend_time > now {
                break;
            }
            let entry = self.resend_heap.pop().expect("peeked entry");
            let Some(item) = self.send_items.get_by_message_id(&entry.message_id) else {
                continue; // acked since scheduling
            };
            if item.resend_time != entry.resend_time {
                continue; // rescheduled since
            }
            if now.duration_since(item.send_time) >= self.settings.ack_timeout {
                return Err(TransferError::AckTimeout);
            }
            self.resend(entry.message_id, now).await;
        }
        Ok(true)
    }

    async fn resend(&mut self, message_id: Id, now: Instant) {
        let Some(mut item) = self.send_items.remove_by_message_id(&message_id) else {
            return;
        };

        // The receiver must see head exactly once per sender state: if
        // this item moved to the front since its original send, rewrite.
        let is_front = self
            .send_items
            .peek_first()
            .map(|front| item.sequence_number < front.sequence_number)
            .unwrap_or(true);
        if is_front && !item.head {
            item.head = true;
            let wire_pack = Pack {
                message_id: item.message_id,
                sequence_id: self.sequence_id,
                sequence_number: item.sequence_number,
                head: true,
                frames: item.frames.clone(),
                contract_frame: self.contract_frame_for(item.contract_id),
                nack: false,
            };
            item.transfer_frame_bytes = wire_pack.into_transfer_frame(self.path()).encode();
        }

        if let Err(err) = self
            .writer
            .write(item.transfer_frame_bytes.clone(), self.settings.write_timeout)
            .await
        {
            trace!(sequence = %self.sequence_id, error = %err, "retransmit write failed");
        }

        item.send_count += 1;
        let backoff = self.base_resend_interval().mul_f32(
            1.0 + self.settings.resend_backoff_scale * item.send_count as f32,
        );
        item.resend_time = self.clamp_resend(item.send_time, now + backoff);
        self.resend_heap.push(ResendEntry {
            resend_time: item.resend_time,
            message_id: item.message_id,
        });
        self.send_items.add(item);
    }

    /// Keep `send_time <= resend_time <= send_time + ack_timeout`
    fn clamp_resend(&self, send_time: Instant, proposed: Instant) -> Instant {
        proposed
            .max(send_time)
            .min(send_time + self.settings.ack_timeout)
    }

    // ---- shutdown ----

    fn shutdown(&mut self, reason: Option<TransferError>) {
        // Cancellation (flush/close) surrenders contracts temporarily;
        // everything else settles them for good and resets the used-id
        // record.
        let checkpoint = matches!(reason, Some(TransferError::Done));
        let error = reason.unwrap_or(TransferError::SequenceClosed);

        self.pack_rx.close();
        while let Ok(pack) = self.pack_rx.try_recv() {
            if let Some(callback) = pack.ack_callback {
                callback(Err(error.clone()));
            }
        }
        while let Some(mut item) = self.send_items.remove_first() {
            if let Some(callback) = item.ack_callback.take() {
                callback(Err(error.clone()));
            }
        }

        if let Some(contract) = self.send_contract.take() {
            self.contract_manager.complete_contract(
                contract.contract_id(),
                contract.acked_byte_count(),
                contract.unacked_byte_count(),
                checkpoint,
            );
        }
        for (contract_id, contract) in self.open_contracts.drain() {
            self.contract_manager.complete_contract(
                contract_id,
                contract.acked_byte_count(),
                contract.unacked_byte_count(),
                checkpoint,
            );
        }

        let contract_key = self.key.contract_key();
        self.contract_manager
            .flush_contract_queue(&contract_key, !checkpoint);
        self.contract_manager.close_contract_queue(&contract_key);
    }
}

struct SendHandle {
    sequence_id: Id,
    pack_tx: mpsc::Sender<SendPack>,
    ack_tx: mpsc::Sender<Ack>,
    cancel: CancellationToken,
}

/// Registry of live send sequences, keyed by [`SendKey`]
///
/// Sequences are constructed lazily and reconstructed transparently
/// after a fatal termination: the next pack to the same key spawns a
/// fresh instance with a new sequence id.
pub struct SendBuffer {
    client_id: Id,
    settings: Arc<ClientSettings>,
    contract_manager: Arc<ContractManager>,
    route_manager: Arc<RouteManager>,
    cancel: CancellationToken,
    inner: Mutex<HashMap<SendKey, SendHandle>>,
}

impl SendBuffer {
    /// Create a buffer rooted under `cancel`
    pub fn new(
        client_id: Id,
        settings: Arc<ClientSettings>,
        contract_manager: Arc<ContractManager>,
        route_manager: Arc<RouteManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client_id,
            settings,
            contract_manager,
            route_manager,
            cancel,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue a pack, spawning or reviving the sequence as needed
    pub async fn pack(&self, key: &SendKey, pack: SendPack) -> Result<()> {
        let mut pack = pack;
        loop {
            if self.cancel.is_cancelled() {
                if let Some(callback) = pack.ack_callback.take() {
                    callback(Err(TransferError::Done));
                }
                return Err(TransferError::Done);
            }
            let pack_tx = self.handle_for(key);
            match pack_tx.send(pack).await {
                Ok(()) => return Ok(()),
                // The sequence died between lookup and send; revive.
                Err(mpsc::error::SendError(returned)) => pack = returned,
            }
        }
    }

    /// Route an incoming receipt to its owning sequence
    ///
    /// Receipts for dead or unknown sequence instances drop silently.
    pub fn ack(&self, ack: Ack) {
        let inner = self.inner.lock();
        for handle in inner.values() {
            if handle.sequence_id == ack.sequence_id {
                let _ = handle.ack_tx.try_send(ack);
                return;
            }
        }
    }

    /// Active sequence count (diagnostics)
    pub fn open_sequence_count(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|handle| !handle.pack_tx.is_closed())
            .count()
    }

    /// Cancel every sequence matching `predicate`
    pub fn cancel_where(&self, predicate: impl Fn(&SendKey) -> bool) {
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

    fn handle_for(&self, key: &SendKey) -> mpsc::Sender<SendPack> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.get(key) {
            if !handle.pack_tx.is_closed() {
                return handle.pack_tx.clone();
            }
        }

        let (pack_tx, pack_rx) = mpsc::channel(self.settings.sequence_buffer_size);
        let (ack_tx, ack_rx) = mpsc::channel(self.settings.sequence_buffer_size.max(64));
        let cancel = self.cancel.child_token();
        let sequence_id = Id::new();

        let sequence = SendSequence {
            client_id: self.client_id,
            key: key.clone(),
            sequence_id,
            settings: self.settings.clone(),
            contract_manager: self.contract_manager.clone(),
            writer: self
                .route_manager
                .open_multi_route_writer(key.destination),
            cancel: cancel.clone(),
            pack_rx,
            ack_rx,
            next_sequence_number: 1,
            send_items: TransferQueue::new(by_sequence_number),
            resend_heap: BinaryHeap::new(),
            send_contract: None,
            open_contracts: HashMap::new(),
            ack_window: AckWindow::new(),
            rtt: RttWindow::new(RttWindowConfig::default()),
            idle_deadline: Instant::now() + self.settings.send_idle_timeout,
        };
        tokio::spawn(sequence.run());

        inner.insert(
            key.clone(),
            SendHandle {
                sequence_id,
                pack_tx: pack_tx.clone(),
                ack_tx,
                cancel,
            },
        );
        pack_tx
    }
}
