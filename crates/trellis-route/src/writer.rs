//! Multi-route writer
//!
//! Offers each frame to every send-matching route; the first route with
//! capacity wins. Route weights bias the non-blocking fast path, so
//! healthier transports absorb more traffic without ever starving the
//! rest. Route closure is not an error: the writer retries with whatever
//! remains, and a write fails only on timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::trace;

use trellis_core::{TransferPath, weighted_shuffle};

use crate::manager::{RouteManager, TransportEntry};
use crate::transport::{Route, RouteStats};
use crate::{Result, RouteError};

/// Writer that load-balances frames toward one destination
pub struct MultiRouteWriter {
    manager: Arc<RouteManager>,
    destination: TransferPath,
}

impl MultiRouteWriter {
    pub(crate) fn new(manager: Arc<RouteManager>, destination: TransferPath) -> Self {
        Self {
            manager,
            destination,
        }
    }

    /// The destination this writer serves
    pub fn destination(&self) -> TransferPath {
        self.destination
    }

    /// Write one frame within `timeout`
    ///
    /// Snapshots the matching transports, tries each route without
    /// blocking in weighted order, then falls back to concurrent
    /// blocking offers. A transport update mid-write refreshes the
    /// snapshot; only the deadline fails the write.
    pub async fn write(&self, frame: Bytes, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let monitor = self.manager.monitor();

        loop {
            let candidates = self.candidates();

            if candidates.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => return Err(RouteError::WriteTimeout),
                    _ = monitor.notified() => continue,
                }
            }

            // Fast path: non-blocking offers in weighted order.
            let mut offered = frame.clone();
            let mut fast_path_ok = false;
            for (entry, route) in &candidates {
                match route.try_send(offered) {
                    Ok(()) => {
                        entry.record_send(frame.len() as u64);
                        trace!(route = route.id(), "frame accepted (fast path)");
                        fast_path_ok = true;
                        break;
                    }
                    Err(returned) => offered = returned,
                }
            }
            if fast_path_ok {
                return Ok(());
            }

            // Slow path: all candidate routes race to reserve capacity.
            let mut offers = FuturesUnordered::new();
            for (entry, route) in &candidates {
                let entry = entry.clone();
                let route = route.clone();
                offers.push(async move {
                    let permit = route.reserve().await?;
                    Ok::<_, RouteError>((entry, route, permit))
                });
            }

            // Exhausted means every candidate closed without accepting;
            // park on the monitor instead of spinning on the snapshot.
            let mut exhausted = false;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => return Err(RouteError::WriteTimeout),
                    // New or removed transports invalidate the candidate set.
                    _ = monitor.notified() => break,
                    next = offers.next(), if !exhausted => match next {
                        Some(Ok((entry, route, permit))) => {
                            permit.send(frame.clone());
                            entry.record_send(frame.len() as u64);
                            trace!(route = route.id(), "frame accepted (reserved)");
                            return Ok(());
                        }
                        // A closed route drops out of the race silently.
                        Some(Err(_)) => continue,
                        None => exhausted = true,
                    },
                }
            }
        }
    }

    /// Flattened `(transport, route)` pairs in weighted try order
    fn candidates(&self) -> Vec<(Arc<TransportEntry>, Route)> {
        let entries = self.manager.send_matching(&self.destination);
        let peer_stats = RouteStats::default();

        // Priority groups are advisory: lower values go strictly first,
        // weights only shuffle within a group.
        let mut groups: BTreeMap<u32, Vec<(f32, Arc<TransportEntry>, Route)>> = BTreeMap::new();
        for entry in entries {
            let stats = entry.stats();
            let transport = &entry.transport;
            let weight = if transport.can_eval_route_weight(&stats, &peer_stats) {
                transport.route_weight(&stats, &peer_stats)
            } else {
                1.0
            };
            let route_count = entry.routes.len().max(1) as f32;

            let group = groups.entry(transport.priority()).or_default();
            for route in &entry.routes {
                group.push((weight / route_count, entry.clone(), route.clone()));
            }
        }

        let mut rng = rand::thread_rng();
        let mut candidates = Vec::new();
        for (_, mut group) in groups {
            weighted_shuffle(&mut group, |(weight, _, _)| *weight, 0.0, &mut rng);
            candidates.extend(group.into_iter().map(|(_, entry, route)| (entry, route)));
        }
        candidates
    }
}
