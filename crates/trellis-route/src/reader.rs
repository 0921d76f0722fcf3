//! Multi-route reader
//!
//! Reads the union of all receive-matching routes. One forwarder task
//! per route drains into a merged channel; the first frame to arrive on
//! any route wins. Ordering across routes is not guaranteed, sequence
//! numbers upstream restore it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use trellis_core::TransferPath;

use crate::manager::{RouteManager, TransportEntry};
use crate::transport::Route;
use crate::{Result, RouteError};

const MERGED_CAPACITY: usize = 32;

/// Reader over the union of routes from one destination
pub struct MultiRouteReader {
    merged: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl MultiRouteReader {
    pub(crate) fn new(manager: Arc<RouteManager>, destination: TransferPath) -> Self {
        let (merged_tx, merged_rx) = mpsc::channel(MERGED_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(supervise(manager, destination, merged_tx, cancel.clone()));
        Self {
            merged: merged_rx,
            cancel,
        }
    }

    /// Read the next frame from any route within `timeout`
    pub async fn read(&mut self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, self.merged.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(RouteError::Closed),
            Err(_) => Err(RouteError::ReadTimeout),
        }
    }

    /// Read the next frame; `None` once the reader is closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.merged.recv().await
    }

    /// Stop all forwarders
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MultiRouteReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Track the snapshot, keeping one forwarder per live matching route
async fn supervise(
    manager: Arc<RouteManager>,
    destination: TransferPath,
    merged_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let monitor = manager.monitor();
    let mut forwarders: HashMap<u64, CancellationToken> = HashMap::new();

    loop {
        let mut live: HashSet<u64> = HashSet::new();
        for entry in manager.receive_matching(&destination) {
            for route in &entry.routes {
                live.insert(route.id());
                if !forwarders.contains_key(&route.id()) {
                    let child = cancel.child_token();
                    forwarders.insert(route.id(), child.clone());
                    tokio::spawn(forward(
                        entry.clone(),
                        route.clone(),
                        merged_tx.clone(),
                        child,
                    ));
                }
            }
        }

        // Routes that left the snapshot take their forwarders with them.
        forwarders.retain(|id, token| {
            if live.contains(id) {
                true
            } else {
                trace!(route = id, "route dropped from reader");
                token.cancel();
                false
            }
        });

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = monitor.notified() => continue,
        }
    }
}

async fn forward(
    entry: Arc<TransportEntry>,
    route: Route,
    merged_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = route.recv() => match frame {
                Some(frame) => {
                    entry.record_receive(frame.len() as u64);
                    if merged_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
        }
    }
}
