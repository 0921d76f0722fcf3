//! Transports and routes
//!
//! A transport is a descriptor over one underlying link (platform
//! websocket, gateway, p2p, ...) exposing match predicates and weight
//! hints. A route is the bounded bytes channel a transport reads or
//! feeds; the multi-route writer and reader fan out over them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use trellis_core::TransferPath;

use crate::{Result, RouteError};

/// Observed transfer statistics for one transport
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteStats {
    /// Frames written
    pub send_count: u64,
    /// Bytes written
    pub send_byte_count: u64,
    /// Frames read
    pub receive_count: u64,
    /// Bytes read
    pub receive_byte_count: u64,
}

/// Descriptor of one underlying link
///
/// Implementations are snapshotted copy-on-write by the route manager,
/// so every method must be cheap and non-blocking.
pub trait Transport: Send + Sync {
    /// Stable name for logging
    fn name(&self) -> &str;

    /// Selection priority; lower is preferred when weights tie
    fn priority(&self) -> u32;

    /// Whether [`route_weight`](Self::route_weight) is meaningful yet
    fn can_eval_route_weight(&self, stats: &RouteStats, peer_stats: &RouteStats) -> bool;

    /// Relative weight for load balancing
    fn route_weight(&self, stats: &RouteStats, peer_stats: &RouteStats) -> f32;

    /// Whether this transport carries frames toward `destination`
    fn matches_send(&self, destination: &TransferPath) -> bool;

    /// Whether this transport yields frames from `destination`
    fn matches_receive(&self, destination: &TransferPath) -> bool;
}

static NEXT_ROUTE_ID: AtomicU64 = AtomicU64::new(1);

/// Bounded single-consumer bytes channel owned by one transport
#[derive(Clone)]
pub struct Route {
    id: u64,
    sender: mpsc::Sender<Bytes>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Bytes>>>,
}

impl Route {
    /// Create a route with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            id: NEXT_ROUTE_ID.fetch_add(1, Ordering::Relaxed),
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
        }
    }

    /// Process-unique route identity
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Offer a frame without blocking
    pub fn try_send(&self, frame: Bytes) -> std::result::Result<(), Bytes> {
        self.sender.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(frame) => frame,
            mpsc::error::TrySendError::Closed(frame) => frame,
        })
    }

    /// Reserve capacity, blocking until the route accepts or closes
    pub async fn reserve(&self) -> Result<mpsc::OwnedPermit<Bytes>> {
        self.sender
            .clone()
            .reserve_owned()
            .await
            .map_err(|_| RouteError::Closed)
    }

    /// Offer a frame, blocking up to `timeout`
    pub async fn send_timeout(&self, frame: Bytes, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.sender.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RouteError::Closed),
            Err(_) => Err(RouteError::WriteTimeout),
        }
    }

    /// Receive the next frame; `None` when the route closed
    pub async fn recv(&self) -> Option<Bytes> {
        self.receiver.lock().await.recv().await
    }

    /// Whether the route can no longer accept frames
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route").field("id", &self.id).finish()
    }
}

/// Simple transport bound to one destination
///
/// Matches any path whose destination (or stream) id agrees, in both
/// directions, with a fixed priority and uniform weight. Used by tests
/// and single-peer wiring.
pub struct StaticTransport {
    name: String,
    destination: TransferPath,
    priority: u32,
}

impl StaticTransport {
    /// Create a transport bound to one destination
    pub fn new(name: impl Into<String>, destination: TransferPath) -> Self {
        Self {
            name: name.into(),
            destination,
            priority: 0,
        }
    }

    /// Override the selection priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    fn matches(&self, path: &TransferPath) -> bool {
        if self.destination.is_stream() {
            path.stream_id == self.destination.stream_id
        } else {
            path.destination_id == self.destination.destination_id
        }
    }
}

impl Transport for StaticTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn can_eval_route_weight(&self, _stats: &RouteStats, _peer_stats: &RouteStats) -> bool {
        false
    }

    fn route_weight(&self, _stats: &RouteStats, _peer_stats: &RouteStats) -> f32 {
        1.0
    }

    fn matches_send(&self, destination: &TransferPath) -> bool {
        self.matches(destination)
    }

    fn matches_receive(&self, destination: &TransferPath) -> bool {
        self.matches(destination)
    }
}
