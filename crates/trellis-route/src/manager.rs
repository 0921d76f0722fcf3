//! Route manager
//!
//! Holds the live transport set as a copy-on-write snapshot. Writers and
//! readers clone the current snapshot lock-free; every update swaps the
//! whole vector and wakes anyone blocked on route availability.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use trellis_core::{Monitor, TransferPath};

use crate::reader::MultiRouteReader;
use crate::transport::{Route, RouteStats, Transport};
use crate::writer::MultiRouteWriter;

/// One registered transport with its routes and running stats
pub struct TransportEntry {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) routes: Vec<Route>,
    pub(crate) stats: Mutex<RouteStats>,
}

impl TransportEntry {
    /// The transport descriptor
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Snapshot of the observed stats
    pub fn stats(&self) -> RouteStats {
        *self.stats.lock()
    }

    pub(crate) fn record_send(&self, byte_count: u64) {
        let mut stats = self.stats.lock();
        stats.send_count += 1;
        stats.send_byte_count += byte_count;
    }

    pub(crate) fn record_receive(&self, byte_count: u64) {
        let mut stats = self.stats.lock();
        stats.receive_count += 1;
        stats.receive_byte_count += byte_count;
    }
}

type Snapshot = Arc<Vec<Arc<TransportEntry>>>;

/// Registry of transports and factory for multi-route writers/readers
pub struct RouteManager {
    snapshot: RwLock<Snapshot>,
    monitor: Arc<Monitor>,
}

impl Default for RouteManager {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
            monitor: Arc::new(Monitor::new()),
        }
    }
}

impl RouteManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a transport (matched by name) with its routes
    pub fn update_transport(&self, transport: Arc<dyn Transport>, routes: Vec<Route>) {
        let entry = Arc::new(TransportEntry {
            transport,
            routes,
            stats: Mutex::new(RouteStats::default()),
        });

        let mut snapshot = self.snapshot.write();
        let mut next: Vec<Arc<TransportEntry>> = snapshot
            .iter()
            .filter(|existing| existing.transport.name() != entry.transport.name())
            .cloned()
            .collect();
        debug!(transport = entry.transport.name(), routes = entry.routes.len(), "transport updated");
        next.push(entry);
        *snapshot = Arc::new(next);
        drop(snapshot);

        self.monitor.notify_all();
    }

    /// Drop a transport by name
    pub fn remove_transport(&self, name: &str) {
        let mut snapshot = self.snapshot.write();
        let next: Vec<Arc<TransportEntry>> = snapshot
            .iter()
            .filter(|existing| existing.transport.name() != name)
            .cloned()
            .collect();
        *snapshot = Arc::new(next);
        drop(snapshot);

        self.monitor.notify_all();
    }

    /// Current transport snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    /// Snapshot filtered to transports that send toward `destination`
    pub(crate) fn send_matching(&self, destination: &TransferPath) -> Vec<Arc<TransportEntry>> {
        self.snapshot()
            .iter()
            .filter(|entry| entry.transport.matches_send(destination))
            .cloned()
            .collect()
    }

    /// Snapshot filtered to transports that receive from `destination`
    pub(crate) fn receive_matching(&self, destination: &TransferPath) -> Vec<Arc<TransportEntry>> {
        self.snapshot()
            .iter()
            .filter(|entry| entry.transport.matches_receive(destination))
            .cloned()
            .collect()
    }

    pub(crate) fn monitor(&self) -> Arc<Monitor> {
        self.monitor.clone()
    }

    /// Open a writer that load-balances frames toward `destination`
    pub fn open_multi_route_writer(self: &Arc<Self>, destination: TransferPath) -> MultiRouteWriter {
        MultiRouteWriter::new(self.clone(), destination)
    }

    /// Open a reader over the union of routes from `destination`
    pub fn open_multi_route_reader(self: &Arc<Self>, destination: TransferPath) -> MultiRouteReader {
        MultiRouteReader::new(self.clone(), destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StaticTransport;
    use trellis_core::Id;

    #[test]
    fn test_update_replaces_by_name() {
        let manager = RouteManager::new();
        let destination = TransferPath::to_destination(Id::new());

        manager.update_transport(
            Arc::new(StaticTransport::new("ws", destination)),
            vec![Route::new(4)],
        );
        manager.update_transport(
            Arc::new(StaticTransport::new("ws", destination)),
            vec![Route::new(4), Route::new(4)],
        );

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].routes.len(), 2);
    }

    #[test]
    fn test_remove_transport() {
        let manager = RouteManager::new();
        let destination = TransferPath::to_destination(Id::new());

        manager.update_transport(
            Arc::new(StaticTransport::new("ws", destination)),
            vec![Route::new(4)],
        );
        manager.remove_transport("ws");
        assert!(manager.snapshot().is_empty());
    }

    #[test]
    fn test_matching_filters() {
        let manager = RouteManager::new();
        let near = TransferPath::to_destination(Id::new());
        let far = TransferPath::to_destination(Id::new());

        manager.update_transport(
            Arc::new(StaticTransport::new("near", near)),
            vec![Route::new(4)],
        );

        assert_eq!(manager.send_matching(&near).len(), 1);
        assert!(manager.send_matching(&far).is_empty());
        assert_eq!(manager.receive_matching(&near).len(), 1);
    }
}
