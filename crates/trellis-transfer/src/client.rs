//! Client dispatch loop
//!
//! One client owns one consumer of the multi-route reader. Each frame is
//! classified off the filtered path view: local frames dispatch to the
//! send or receive buffers, everything else relays through the forward
//! buffer. Frames addressed to self bypass the wire entirely.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use trellis_core::{CONTROL_ID, CallbackId, CallbackList, Id, TransferPath};
use trellis_crypto::ProvideMode;
use trellis_route::{RouteError, RouteManager};
use trellis_wire::{Ack, ControlMessage, Frame, MessageType, Pack, TransferFrame};

use crate::contract::{ContractManager, ControlSink};
use crate::error::Result;
use crate::forward::{ForwardBuffer, ForwardPack};
use crate::receive::{ReceiveBuffer, ReceiveEvent, ReceivePack};
use crate::send::{AckCallback, SendBuffer, SendKey, SendPack};
use crate::settings::ClientSettings;

/// Registry of locally-hosted stream ids
#[derive(Default)]
pub struct StreamManager {
    streams: Mutex<HashSet<Id>>,
}

impl StreamManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Start hosting a stream
    pub fn open_stream(&self, stream_id: Id) {
        self.streams.lock().insert(stream_id);
    }

    /// Stop hosting a stream
    pub fn close_stream(&self, stream_id: Id) {
        self.streams.lock().remove(&stream_id);
    }

    /// Whether this client hosts `stream_id`
    pub fn is_local(&self, stream_id: &Id) -> bool {
        self.streams.lock().contains(stream_id)
    }
}

struct QueuedControlSink {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlSink for QueuedControlSink {
    fn send_control(&self, message: ControlMessage) {
        // Best effort into the sync queue; the sync task owns delivery.
        let _ = self.tx.send(message);
    }
}

/// Singleton per client id: the dispatch loop and its buffers
pub struct Client {
    client_id: Id,
    instance_id: Id,
    settings: Arc<ClientSettings>,
    cancel: CancellationToken,
    route_manager: Arc<RouteManager>,
    contract_manager: Arc<ContractManager>,
    send_buffer: Arc<SendBuffer>,
    receive_buffer: Arc<ReceiveBuffer>,
    forward_buffer: Arc<ForwardBuffer>,
    stream_manager: Arc<StreamManager>,
    receive_callbacks: Arc<CallbackList<ReceiveEvent>>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
}

impl Client {
    /// Create a client and start its dispatch and control-sync tasks
    pub fn new(
        client_id: Id,
        route_manager: Arc<RouteManager>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let settings = Arc::new(settings);
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let control_sink: Arc<dyn ControlSink> = Arc::new(QueuedControlSink {
            tx: control_tx.clone(),
        });

        let contract_manager = Arc::new(ContractManager::new(
            client_id,
            settings.clone(),
            control_sink.clone(),
        ));
        let receive_callbacks = Arc::new(CallbackList::new());
        let stream_manager = Arc::new(StreamManager::new());

        let send_buffer = Arc::new(SendBuffer::new(
            client_id,
            settings.clone(),
            contract_manager.clone(),
            route_manager.clone(),
            cancel.child_token(),
        ));
        let receive_buffer = Arc::new(ReceiveBuffer::new(
            settings.clone(),
            contract_manager.clone(),
            route_manager.clone(),
            control_sink.clone(),
            receive_callbacks.clone(),
            cancel.child_token(),
        ));
        let forward_buffer = Arc::new(ForwardBuffer::new(
            settings.clone(),
            route_manager.clone(),
            control_sink,
            cancel.child_token(),
        ));

        // Control responses ride the normal receive path; intercept
        // contract results before application callbacks see them.
        let intercept_manager = contract_manager.clone();
        receive_callbacks.add(move |event: &ReceiveEvent| {
            if !event.source.is_control_source() {
                return;
            }
            for frame in &event.frames {
                match ControlMessage::from_frame(frame) {
                    Ok(ControlMessage::CreateContractResult(result)) => {
                        intercept_manager.receive_create_contract_result(result);
                    }
                    Ok(_) | Err(_) => {}
                }
            }
        });

        let client = Arc::new(Self {
            client_id,
            instance_id: Id::new(),
            settings,
            cancel,
            route_manager,
            contract_manager,
            send_buffer,
            receive_buffer,
            forward_buffer,
            stream_manager,
            receive_callbacks,
            control_tx,
        });

        tokio::spawn(client.clone().dispatch());
        tokio::spawn(control_sync(
            client.send_buffer.clone(),
            control_rx,
            client.cancel.child_token(),
        ));
        client
    }

    /// The stable client identity
    pub fn client_id(&self) -> Id {
        self.client_id
    }

    /// This process incarnation's identity
    pub fn instance_id(&self) -> Id {
        self.instance_id
    }

    /// The contract manager
    pub fn contract_manager(&self) -> &Arc<ContractManager> {
        &self.contract_manager
    }

    /// The stream registry
    pub fn stream_manager(&self) -> &Arc<StreamManager> {
        &self.stream_manager
    }

    /// Register a receive callback
    pub fn add_receive_callback(
        &self,
        callback: impl Fn(&ReceiveEvent) + Send + Sync + 'static,
    ) -> CallbackId {
        self.receive_callbacks.add(callback)
    }

    /// Remove a receive callback
    pub fn remove_receive_callback(&self, id: CallbackId) {
        self.receive_callbacks.remove(id);
    }

    /// Enable provide modes and announce keys to the platform
    pub fn set_provide_modes(&self, modes: &[ProvideMode]) {
        self.contract_manager.set_provide_modes(modes);
    }

    /// Reliable ordered send to a destination
    pub async fn send(&self, destination_id: Id, frames: Vec<Frame>) -> Result<()> {
        self.send_with_callback(SendKey::to_destination(destination_id), frames, None)
            .await
    }

    /// Unreliable at-most-once send
    pub async fn send_nack(&self, destination_id: Id, frames: Vec<Frame>) -> Result<()> {
        self.send_pack(
            SendKey::to_destination(destination_id),
            SendPack {
                frames,
                nack: true,
                ack_callback: None,
            },
        )
        .await
    }

    /// Reliable send with an explicit key and optional completion callback
    pub async fn send_with_callback(
        &self,
        key: SendKey,
        frames: Vec<Frame>,
        ack_callback: Option<AckCallback>,
    ) -> Result<()> {
        self.send_pack(
            key,
            SendPack {
                frames,
                nack: false,
                ack_callback,
            },
        )
        .await
    }

    async fn send_pack(&self, key: SendKey, pack: SendPack) -> Result<()> {
        // Loopback: frames to self never touch the wire.
        if key.destination.destination_id == self.client_id {
            let mut pack = pack;
            self.receive_callbacks.dispatch(&ReceiveEvent {
                source: TransferPath::new(self.client_id, self.client_id),
                frames: pack.frames,
                provide_mode: ProvideMode::None,
            });
            if let Some(callback) = pack.ack_callback.take() {
                callback(Ok(()));
            }
            return Ok(());
        }
        self.send_buffer.pack(&key, pack).await
    }

    /// Enqueue a control message for reliable delivery to the platform
    pub fn send_control(&self, message: ControlMessage) {
        let _ = self.control_tx.send(message);
    }

    /// Cancel all non-control sequences and flush their contract queues
    pub fn flush(&self) {
        info!(client = %self.client_id, "flush");
        self.send_buffer
            .cancel_where(|key| !key.destination.is_control_destination());
        self.receive_buffer
            .cancel_where(|key| !key.source.is_control_source());
        self.forward_buffer.close();
    }

    /// Cancel everything owned by this client; idempotent
    pub fn close(&self) {
        info!(client = %self.client_id, "close");
        self.cancel.cancel();
    }

    /// The read loop: one consumer of the multi-route reader
    async fn dispatch(self: Arc<Self>) {
        let mut reader = self
            .route_manager
            .open_multi_route_reader(TransferPath::to_destination(self.client_id));

        loop {
            let bytes = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = reader.read(self.settings.read_timeout) => match result {
                    Ok(bytes) => bytes,
                    Err(RouteError::ReadTimeout) => continue,
                    Err(_) => return,
                },
            };

            let path = match TransferFrame::decode_path_only(&bytes) {
                Ok(path) => path,
                Err(err) => {
                    warn!(error = %err, "undecodable frame path");
                    continue;
                }
            };

            let local = path.destination_id == self.client_id
                || (path.is_stream() && self.stream_manager.is_local(&path.stream_id));

            if local {
                self.dispatch_local(&bytes, path).await;
            } else if self
                .forward_buffer
                .pack(ForwardPack {
                    path,
                    bytes,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }

    async fn dispatch_local(&self, bytes: &[u8], path: TransferPath) {
        let frame = match TransferFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(source = %path.source_id, error = %err, "undecodable local frame");
                return;
            }
        };

        match frame.frame.message_type {
            MessageType::TransferAck => match Ack::decode(&frame.frame.message_bytes) {
                Ok(ack) => {
                    trace!(message = %ack.message_id, selective = ack.selective, "ack in");
                    self.send_buffer.ack(ack);
                }
                Err(err) => warn!(source = %path.source_id, error = %err, "undecodable ack"),
            },
            MessageType::TransferPack => match Pack::decode(&frame.frame.message_bytes) {
                Ok(pack) => {
                    let received = ReceivePack {
                        source: path,
                        sequence_id: pack.sequence_id,
                        pack,
                    };
                    if self.receive_buffer.pack(received).await.is_err() {
                        debug!("receive buffer closed");
                    }
                }
                Err(err) => warn!(source = %path.source_id, error = %err, "undecodable pack"),
            },
            other => {
                warn!(source = %path.source_id, message_type = ?other, "unexpected top-level frame");
            }
        }
    }
}

struct ControlEntry {
    entry_id: Id,
    frame: Frame,
    in_flight: bool,
    acked: bool,
}

enum ControlEvent {
    Acked(Id),
    Failed(Id),
}

/// Reliable in-order delivery of control frames
///
/// The send sequence already retransmits; this layer survives sequence
/// death. When an ack-timeout kills the control sequence, every unacked
/// frame is resubmitted in original order to the replacement instance.
async fn control_sync(
    send_buffer: Arc<SendBuffer>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    cancel: CancellationToken,
) {
    let key = SendKey::to_destination(CONTROL_ID);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut pending: VecDeque<ControlEntry> = VecDeque::new();

    loop {
        // Submit everything not in flight, preserving order.
        for entry in pending.iter_mut() {
            if entry.acked || entry.in_flight {
                continue;
            }
            entry.in_flight = true;
            let entry_id = entry.entry_id;
            let event_tx = event_tx.clone();
            let pack = SendPack {
                frames: vec![entry.frame.clone()],
                nack: false,
                ack_callback: Some(Box::new(move |result| {
                    let event = match result {
                        Ok(()) => ControlEvent::Acked(entry_id),
                        Err(_) => ControlEvent::Failed(entry_id),
                    };
                    let _ = event_tx.send(event);
                })),
            };
            let _ = send_buffer.pack(&key, pack).await;
        }
        while pending.front().is_some_and(|entry| entry.acked) {
            pending.pop_front();
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            Some(message) = control_rx.recv() => {
                pending.push_back(ControlEntry {
                    entry_id: Id::new(),
                    frame: message.into_frame(),
                    in_flight: false,
                    acked: false,
                });
                while let Ok(message) = control_rx.try_recv() {
                    pending.push_back(ControlEntry {
                        entry_id: Id::new(),
                        frame: message.into_frame(),
                        in_flight: false,
                        acked: false,
                    });
                }
            }
            Some(event) = event_rx.recv() => {
                match event {
                    ControlEvent::Acked(entry_id) => {
                        if let Some(entry) =
                            pending.iter_mut().find(|entry| entry.entry_id == entry_id)
                        {
                            entry.acked = true;
                        }
                    }
                    ControlEvent::Failed(entry_id) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        if let Some(entry) =
                            pending.iter_mut().find(|entry| entry.entry_id == entry_id)
                        {
                            entry.in_flight = false;
                        }
                    }
                }
            }
        }
    }
}
