//! DNS-over-HTTPS lookups
//!
//! Extender discovery must not leak queries to the local resolver, so
//! hostname lookups ride DoH exclusively.

use std::net::{Ipv4Addr, Ipv6Addr};

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tracing::debug;

use crate::{ConnectError, Result};

/// DoH resolver handle
pub struct DohResolver {
    resolver: TokioAsyncResolver,
}

impl Default for DohResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DohResolver {
    /// Create a resolver against a public DoH endpoint
    pub fn new() -> Self {
        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = false;
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::cloudflare_https(), opts),
        }
    }

    /// A-record lookup
    pub async fn lookup_v4(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        let lookup = self
            .resolver
            .ipv4_lookup(host)
            .await
            .map_err(|err| ConnectError::Dns(err.to_string()))?;
        let addresses: Vec<Ipv4Addr> = lookup.iter().map(|a| a.0).collect();
        debug!(host, count = addresses.len(), "DoH A lookup");
        Ok(addresses)
    }

    /// AAAA-record lookup
    pub async fn lookup_v6(&self, host: &str) -> Result<Vec<Ipv6Addr>> {
        let lookup = self
            .resolver
            .ipv6_lookup(host)
            .await
            .map_err(|err| ConnectError::Dns(err.to_string()))?;
        let addresses: Vec<Ipv6Addr> = lookup.iter().map(|a| a.0).collect();
        debug!(host, count = addresses.len(), "DoH AAAA lookup");
        Ok(addresses)
    }
}
