//! Connection strategy settings

use std::time::Duration;

use ipnet::IpNet;

use crate::extender::ExtenderConfig;

/// Tuning for the dialer pool
#[derive(Debug, Clone)]
pub struct ClientStrategySettings {
    /// End-to-end budget for one strategy request
    pub request_timeout: Duration,
    /// TCP connect budget per attempt
    pub connect_timeout: Duration,
    /// TLS handshake budget per attempt
    pub tls_timeout: Duration,
    /// Dialers raced concurrently per parallel block
    pub parallel_block_size: usize,
    /// Minimum spacing between extender expansions
    pub expand_extender_rate_limit: Duration,
    /// New profiles tried per expansion
    pub expand_extender_profile_count: usize,
    /// Hard cap on extender dialers
    pub max_extender_count: usize,
    /// Extenders with no success and an error older than this drop
    pub extender_drop_timeout: Duration,
    /// Operator-pinned extenders; expansion chooses from these first
    pub extender_configs: Vec<ExtenderConfig>,
    /// Prefixes scanned for fresh extender ips
    pub extender_networks: Vec<IpNet>,
    /// Hostnames resolved over DoH for extender ips
    pub extender_hostnames: Vec<String>,
    /// Device supports v4 targets
    pub allow_ipv4: bool,
    /// Device supports v6 targets
    pub allow_ipv6: bool,
}

impl Default for ClientStrategySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            tls_timeout: Duration::from_secs(5),
            parallel_block_size: 4,
            expand_extender_rate_limit: Duration::from_secs(60),
            expand_extender_profile_count: 8,
            max_extender_count: 128,
            extender_drop_timeout: Duration::from_secs(10 * 60),
            extender_configs: Vec::new(),
            extender_networks: Vec::new(),
            extender_hostnames: Vec::new(),
            allow_ipv4: true,
            allow_ipv6: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ClientStrategySettings::default();
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.tls_timeout, Duration::from_secs(5));
        assert!(settings.parallel_block_size > 0);
    }
}
