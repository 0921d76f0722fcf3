//! Client connection strategy
//!
//! A weighted pool of dialers, evaluated serially where recent success
//! makes the outcome predictable and in parallel blocks where it does
//! not. When every known path fails, the pool expands with extender
//! relays discovered from configured networks and DoH lookups.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use trellis_core::weighted_shuffle;

use crate::dialer::{Dialer, DialerKind};
use crate::doh::DohResolver;
use crate::extender::{ExtenderConfig, dial_extender, enumerate_profiles};
use crate::resilient::{ResilientMode, ResilientTlsStream};
use crate::settings::ClientStrategySettings;
use crate::{ConnectError, Result};

/// Object-safe byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A dialed connection, type-erased over the technique
pub type IoStream = Box<dyn AsyncStream>;

/// Result of a successful strategy evaluation
pub struct DialOutcome {
    /// The established TLS-protected stream
    pub stream: IoStream,
    /// Which technique won
    pub dialer_kind: DialerKind,
}

/// Weighted pool of connection techniques
pub struct ClientStrategy {
    settings: Arc<ClientStrategySettings>,
    dialers: Mutex<Vec<Arc<Dialer>>>,
    last_expand: Mutex<Option<Instant>>,
    resolver: DohResolver,
    tls_config: Arc<rustls::ClientConfig>,
}

impl ClientStrategy {
    /// Create a pool with the four base dialers plus configured extenders
    pub fn new(settings: ClientStrategySettings) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );

        let mut dialers = vec![
            Arc::new(Dialer::new(DialerKind::Tls, 0.5)),
            Arc::new(Dialer::new(DialerKind::TlsFragment, 0.2)),
            Arc::new(Dialer::new(DialerKind::TlsReorder, 0.2)),
            Arc::new(Dialer::new(DialerKind::TlsFragmentReorder, 0.1)),
        ];
        for config in &settings.extender_configs {
            dialers.push(Arc::new(Dialer::new(
                DialerKind::Extender(config.clone()),
                0.1,
            )));
        }

        Self {
            settings: Arc::new(settings),
            dialers: Mutex::new(dialers),
            last_expand: Mutex::new(None),
            resolver: DohResolver::new(),
            tls_config,
        }
    }

    /// Snapshot of the pool
    pub fn dialers(&self) -> Vec<Arc<Dialer>> {
        self.dialers.lock().clone()
    }

    /// Split the pool into a serial prefix and parallel blocks
    ///
    /// Dialers whose last evaluation succeeded are tried one at a time
    /// in priority order; the rest race in weighted-shuffled blocks.
    fn selection_order(&self) -> (Vec<Arc<Dialer>>, Vec<Vec<Arc<Dialer>>>) {
        let dialers = self.dialers();
        let mut serial: Vec<Arc<Dialer>> = dialers
            .iter()
            .filter(|dialer| dialer.stats().last_was_success())
            .cloned()
            .collect();
        serial.sort_by_key(|dialer| dialer.priority());

        let mut rest: Vec<Arc<Dialer>> = dialers
            .into_iter()
            .filter(|dialer| !dialer.stats().last_was_success())
            .collect();
        let mut rng = rand::thread_rng();
        weighted_shuffle(&mut rest, |dialer| dialer.weight(), 0.0, &mut rng);

        let block_size = self.settings.parallel_block_size.max(1);
        let blocks = rest
            .chunks(block_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        (serial, blocks)
    }

    // ---- single-dialer evaluation ----

    async fn dial_one(&self, dialer: &Arc<Dialer>, host: &str, port: u16) -> Result<IoStream> {
        let result = match dialer.kind() {
            DialerKind::Tls => self.dial_tls(host, port, None).await,
            DialerKind::TlsFragment => {
                self.dial_tls(host, port, Some(ResilientMode::Fragment)).await
            }
            DialerKind::TlsReorder => {
                self.dial_tls(host, port, Some(ResilientMode::Reorder)).await
            }
            DialerKind::TlsFragmentReorder => {
                self.dial_tls(host, port, Some(ResilientMode::FragmentReorder))
                    .await
            }
            DialerKind::Extender(config) => {
                dial_extender(config, host, port, &self.settings)
                    .await
                    .map(|stream| Box::new(stream) as IoStream)
            }
        };

        match &result {
            Ok(_) => {
                debug!(dialer = %dialer.kind(), host, "dial succeeded");
                dialer.record_success();
            }
            Err(err) => {
                debug!(dialer = %dialer.kind(), host, error = %err, "dial failed");
                dialer.record_error();
            }
        }
        result
    }

    async fn dial_tls(
        &self,
        host: &str,
        port: u16,
        mode: Option<ResilientMode>,
    ) -> Result<IoStream> {
        let tcp = tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(|err| ConnectError::Connect(err.to_string()))?;

        let connector = TlsConnector::from(self.tls_config.clone());
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|err| ConnectError::Tls(err.to_string()))?;

        match mode {
            None => {
                let stream =
                    tokio::time::timeout(self.settings.tls_timeout, connector.connect(server_name, tcp))
                        .await
                        .map_err(|_| ConnectError::Timeout)?
                        .map_err(|err| ConnectError::Tls(err.to_string()))?;
                Ok(Box::new(stream))
            }
            Some(mode) => {
                let wrapped = ResilientTlsStream::new(tcp, mode)?;
                let mut stream = tokio::time::timeout(
                    self.settings.tls_timeout,
                    connector.connect(server_name, wrapped),
                )
                .await
                .map_err(|_| ConnectError::Timeout)?
                .map_err(|err| ConnectError::Tls(err.to_string()))?;
                // Handshake done: the hello games are over.
                stream.get_mut().0.set_off();
                Ok(Box::new(stream))
            }
        }
    }

    // ---- pool evaluation ----

    async fn eval_serial(
        &self,
        serial: &[Arc<Dialer>],
        host: &str,
        port: u16,
    ) -> Option<DialOutcome> {
        for dialer in serial {
            if let Ok(stream) = self.dial_one(dialer, host, port).await {
                return Some(DialOutcome {
                    stream,
                    dialer_kind: dialer.kind().clone(),
                });
            }
        }
        None
    }

    async fn eval_parallel(
        &self,
        blocks: &[Vec<Arc<Dialer>>],
        host: &str,
        port: u16,
    ) -> Option<DialOutcome> {
        for block in blocks {
            let mut attempts: FuturesUnordered<_> = block
                .iter()
                .map(|dialer| async move {
                    let result = self.dial_one(dialer, host, port).await;
                    (dialer.clone(), result)
                })
                .collect();

            while let Some((dialer, result)) = attempts.next().await {
                if let Ok(stream) = result {
                    // Dropping the rest of the block cancels it.
                    return Some(DialOutcome {
                        stream,
                        dialer_kind: dialer.kind().clone(),
                    });
                }
            }
        }
        None
    }

    async fn eval_once(&self, host: &str, port: u16) -> Option<DialOutcome> {
        let (serial, blocks) = self.selection_order();
        if let Some(outcome) = self.eval_serial(&serial, host, port).await {
            return Some(outcome);
        }
        self.eval_parallel(&blocks, host, port).await
    }

    /// Establish a TLS stream, parallel-first selection
    ///
    /// Exhausting the pool triggers extender collapse and expansion,
    /// then one more pass.
    pub async fn connect_tls(&self, host: &str, port: u16) -> Result<DialOutcome> {
        tokio::time::timeout(self.settings.request_timeout, async {
            if let Some(outcome) = self.eval_once(host, port).await {
                return Ok(outcome);
            }

            self.collapse_extender_dialers();
            if self.expand_extender_dialers().await {
                if let Some(outcome) = self.eval_once(host, port).await {
                    return Ok(outcome);
                }
            }
            Err(ConnectError::NoDialerSucceeded)
        })
        .await
        .map_err(|_| ConnectError::Timeout)?
    }

    /// Establish a TLS stream, serial-first selection
    ///
    /// Alternates serial attempts with a parallel hello probe that
    /// refreshes last-success marks across the whole pool.
    pub async fn connect_tls_serial(&self, host: &str, port: u16) -> Result<DialOutcome> {
        tokio::time::timeout(self.settings.request_timeout, async {
            let (serial, _) = self.selection_order();
            if let Some(outcome) = self.eval_serial(&serial, host, port).await {
                return Ok(outcome);
            }

            self.probe_hello(host, port).await;

            let (serial, blocks) = self.selection_order();
            if let Some(outcome) = self.eval_serial(&serial, host, port).await {
                return Ok(outcome);
            }
            if let Some(outcome) = self.eval_parallel(&blocks, host, port).await {
                return Ok(outcome);
            }
            Err(ConnectError::NoDialerSucceeded)
        })
        .await
        .map_err(|_| ConnectError::Timeout)?
    }

    /// Open a WebSocket using parallel selection for the underlying TLS
    pub async fn connect_ws(&self, url: &str) -> Result<WebSocketStream<IoStream>> {
        let (host, port) = host_port_from_url(url)?;
        let outcome = self.connect_tls(&host, port).await?;
        info!(url, dialer = %outcome.dialer_kind, "websocket dial");

        let (ws, _response) = tokio_tungstenite::client_async(url, outcome.stream)
            .await
            .map_err(|err| ConnectError::WebSocket(err.to_string()))?;
        Ok(ws)
    }

    /// Probe `GET /hello` through every dialer concurrently
    ///
    /// The goal is the stats side effect: each dialer's last-success
    /// mark reflects current reachability.
    async fn probe_hello(&self, host: &str, port: u16) {
        let dialers = self.dialers();
        let request =
            format!("GET /hello HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");

        let mut probes: FuturesUnordered<_> = dialers
            .iter()
            .map(|dialer| {
                let request = request.clone();
                async move {
                    let Ok(mut stream) = self.dial_one(dialer, host, port).await else {
                        return;
                    };
                    if stream.write_all(request.as_bytes()).await.is_err() {
                        return;
                    }
                    let mut response = [0u8; 128];
                    let _ = stream.read(&mut response).await;
                }
            })
            .collect();
        while probes.next().await.is_some() {}
    }

    // ---- extender pool maintenance ----

    /// Add extender dialers; returns whether any were added
    ///
    /// Rate-limited. Candidate ips come from the configured extenders,
    /// then the extender networks, then DoH lookups of the extender
    /// hostnames, then weighted reuse of ips already in the pool.
    pub async fn expand_extender_dialers(&self) -> bool {
        {
            let mut last_expand = self.last_expand.lock();
            if let Some(at) = *last_expand {
                if at.elapsed() < self.settings.expand_extender_rate_limit {
                    return false;
                }
            }
            *last_expand = Some(Instant::now());
        }

        let existing: Vec<ExtenderConfig> = self
            .dialers()
            .iter()
            .filter_map(|dialer| match dialer.kind() {
                DialerKind::Extender(config) => Some(config.clone()),
                _ => None,
            })
            .collect();
        let budget = self
            .settings
            .max_extender_count
            .saturating_sub(existing.len());
        if budget == 0 {
            return false;
        }

        let mut candidates: Vec<ExtenderConfig> = if !self.settings.extender_configs.is_empty() {
            self.settings
                .extender_configs
                .iter()
                .filter(|config| !existing.contains(config))
                .cloned()
                .collect()
        } else {
            let mut rng = rand::thread_rng();
            let profiles = enumerate_profiles(
                self.settings.expand_extender_profile_count.min(budget),
                &mut rng,
            );
            let ips = self.candidate_ips(&existing, &mut rng).await;
            profiles
                .into_iter()
                .zip(ips)
                .map(|(profile, ip)| ExtenderConfig {
                    ip,
                    profile,
                    secret: None,
                })
                .collect()
        };
        candidates.truncate(budget);
        if candidates.is_empty() {
            return false;
        }

        info!(count = candidates.len(), "expanding extender dialers");
        let mut dialers = self.dialers.lock();
        for config in candidates {
            dialers.push(Arc::new(Dialer::new(DialerKind::Extender(config), 0.1)));
        }
        true
    }

    async fn candidate_ips<R: Rng>(
        &self,
        existing: &[ExtenderConfig],
        rng: &mut R,
    ) -> Vec<IpAddr> {
        let used: Vec<IpAddr> = existing.iter().map(|config| config.ip).collect();
        let mut ips: Vec<IpAddr> = Vec::new();

        for network in &self.settings.extender_networks {
            let v4 = matches!(network, ipnet::IpNet::V4(_));
            if (v4 && !self.settings.allow_ipv4) || (!v4 && !self.settings.allow_ipv6) {
                continue;
            }
            ips.extend(
                network
                    .hosts()
                    .filter(|ip| !used.contains(ip))
                    .take(self.settings.expand_extender_profile_count),
            );
        }

        for hostname in &self.settings.extender_hostnames {
            if self.settings.allow_ipv4 {
                match self.resolver.lookup_v4(hostname).await {
                    Ok(found) => ips.extend(found.into_iter().map(IpAddr::V4)),
                    Err(err) => warn!(hostname, error = %err, "extender A lookup failed"),
                }
            }
            if self.settings.allow_ipv6 {
                match self.resolver.lookup_v6(hostname).await {
                    Ok(found) => ips.extend(found.into_iter().map(IpAddr::V6)),
                    Err(err) => warn!(hostname, error = %err, "extender AAAA lookup failed"),
                }
            }
        }
        ips.retain(|ip| !used.contains(ip));

        if ips.is_empty() && !used.is_empty() {
            // Weighted reuse: pair fresh profiles with known-good ips.
            let mut weighted: Vec<(IpAddr, f32)> = self
                .dialers()
                .iter()
                .filter_map(|dialer| match dialer.kind() {
                    DialerKind::Extender(config) => Some((config.ip, dialer.weight())),
                    _ => None,
                })
                .collect();
            weighted_shuffle(&mut weighted, |(_, weight)| *weight, 0.0, rng);
            ips = weighted.into_iter().map(|(ip, _)| ip).collect();
        }
        ips
    }

    /// Drop extender dialers whose last error is stale with no success
    /// since
    pub fn collapse_extender_dialers(&self) {
        let drop_timeout = self.settings.extender_drop_timeout;
        let mut dialers = self.dialers.lock();
        dialers.retain(|dialer| {
            let DialerKind::Extender(_) = dialer.kind() else {
                return true;
            };
            let stats = dialer.stats();
            let stale = stats
                .last_error_time
                .is_some_and(|at| at.elapsed() >= drop_timeout);
            let keep = !stale || stats.last_was_success();
            if !keep {
                debug!(dialer = %dialer.kind(), "collapsing extender dialer");
            }
            keep
        });
    }
}

fn host_port_from_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConnectError::Connect(format!("bad port in url: {url}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), 443)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn strategy(settings: ClientStrategySettings) -> ClientStrategy {
        ClientStrategy::new(settings)
    }

    #[test]
    fn test_pool_seeds_base_dialers() {
        let strategy = strategy(ClientStrategySettings::default());
        let kinds: Vec<DialerKind> = strategy
            .dialers()
            .iter()
            .map(|dialer| dialer.kind().clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                DialerKind::Tls,
                DialerKind::TlsFragment,
                DialerKind::TlsReorder,
                DialerKind::TlsFragmentReorder,
            ]
        );
    }

    #[test]
    fn test_selection_order_splits_on_last_success() {
        let strategy = strategy(ClientStrategySettings::default());
        let dialers = strategy.dialers();

        // Mark reorder as recently successful; it becomes the serial
        // prefix, everything else goes parallel.
        dialers[2].record_success();
        let (serial, blocks) = strategy.selection_order();
        assert_eq!(serial.len(), 1);
        assert_eq!(serial[0].kind(), &DialerKind::TlsReorder);

        let parallel_count: usize = blocks.iter().map(|block| block.len()).sum();
        assert_eq!(parallel_count, 3);
        for block in &blocks {
            assert!(block.len() <= strategy.settings.parallel_block_size);
        }
    }

    #[test]
    fn test_serial_prefix_sorted_by_priority() {
        let strategy = strategy(ClientStrategySettings::default());
        let dialers = strategy.dialers();
        dialers[3].record_success(); // fragment+reorder
        dialers[0].record_success(); // tls

        let (serial, _) = strategy.selection_order();
        assert_eq!(serial[0].kind(), &DialerKind::Tls);
        assert_eq!(serial[1].kind(), &DialerKind::TlsFragmentReorder);
    }

    #[tokio::test]
    async fn test_expand_from_networks_and_rate_limit() {
        let mut settings = ClientStrategySettings::default();
        settings.extender_networks = vec!["192.0.2.0/28".parse().unwrap()];
        settings.expand_extender_profile_count = 4;
        let strategy = strategy(settings);

        assert!(strategy.expand_extender_dialers().await);
        let extenders = strategy
            .dialers()
            .iter()
            .filter(|dialer| matches!(dialer.kind(), DialerKind::Extender(_)))
            .count();
        assert_eq!(extenders, 4);

        // Second call inside the rate limit is a no-op.
        assert!(!strategy.expand_extender_dialers().await);
    }

    #[tokio::test]
    async fn test_expand_respects_max_extender_count() {
        let mut settings = ClientStrategySettings::default();
        settings.extender_networks = vec!["192.0.2.0/24".parse().unwrap()];
        settings.expand_extender_profile_count = 16;
        settings.max_extender_count = 3;
        let strategy = strategy(settings);

        assert!(strategy.expand_extender_dialers().await);
        let extenders = strategy
            .dialers()
            .iter()
            .filter(|dialer| matches!(dialer.kind(), DialerKind::Extender(_)))
            .count();
        assert_eq!(extenders, 3);
    }

    #[tokio::test]
    async fn test_pinned_configs_seed_and_saturate_expansion() {
        let mut settings = ClientStrategySettings::default();
        settings.extender_configs = vec![ExtenderConfig::test_config()];
        let strategy = strategy(settings);

        // The pinned extender is in the pool from construction, so
        // expansion finds nothing new to add.
        assert!(strategy
            .dialers()
            .iter()
            .any(|dialer| matches!(dialer.kind(), DialerKind::Extender(_))));
        assert!(!strategy.expand_extender_dialers().await);
    }

    #[test]
    fn test_collapse_drops_stale_extenders() {
        let mut settings = ClientStrategySettings::default();
        settings.extender_configs = vec![ExtenderConfig::test_config()];
        settings.extender_drop_timeout = Duration::ZERO;
        let strategy = strategy(settings);

        let dialers = strategy.dialers();
        let extender = dialers
            .iter()
            .find(|dialer| matches!(dialer.kind(), DialerKind::Extender(_)))
            .unwrap();
        extender.record_error();

        strategy.collapse_extender_dialers();
        assert!(!strategy
            .dialers()
            .iter()
            .any(|dialer| matches!(dialer.kind(), DialerKind::Extender(_))));
        // Base dialers survive collapse unconditionally.
        assert_eq!(strategy.dialers().len(), 4);
    }

    #[test]
    fn test_host_port_from_url() {
        assert_eq!(
            host_port_from_url("wss://relay.example.com/ws").unwrap(),
            ("relay.example.com".to_string(), 443)
        );
        assert_eq!(
            host_port_from_url("wss://relay.example.com:8443/ws?x=1").unwrap(),
            ("relay.example.com".to_string(), 8443)
        );
        assert!(host_port_from_url("wss://host:notaport/ws").is_err());
    }
}
