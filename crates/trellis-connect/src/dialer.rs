//! Dialer pool entries
//!
//! Each dialer pairs a connection technique with rolling success stats.
//! Weight is the success ratio clamped below by a per-dialer minimum so
//! a cold or unlucky dialer is never starved out entirely.

use std::time::Instant;

use parking_lot::Mutex;

use crate::extender::ExtenderConfig;

/// Connection technique
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialerKind {
    /// Plain TLS
    Tls,
    /// TLS with ClientHello fragmentation around the SNI
    TlsFragment,
    /// TLS with IP-TTL record reordering
    TlsReorder,
    /// Fragmentation and reordering combined
    TlsFragmentReorder,
    /// Third-party extender relay
    Extender(ExtenderConfig),
}

impl DialerKind {
    /// Selection priority; lower tries first when weights tie
    pub fn priority(&self) -> u32 {
        match self {
            DialerKind::Tls => 0,
            DialerKind::TlsFragment => 1,
            DialerKind::TlsReorder => 2,
            DialerKind::TlsFragmentReorder => 3,
            DialerKind::Extender(_) => 4,
        }
    }
}

impl std::fmt::Display for DialerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialerKind::Tls => write!(f, "tls"),
            DialerKind::TlsFragment => write!(f, "tls+fragment"),
            DialerKind::TlsReorder => write!(f, "tls+reorder"),
            DialerKind::TlsFragmentReorder => write!(f, "tls+fragment+reorder"),
            DialerKind::Extender(config) => write!(f, "extender({})", config.ip),
        }
    }
}

/// Rolling outcome stats for one dialer
#[derive(Debug, Clone, Copy, Default)]
pub struct DialerStats {
    /// Successful evaluations
    pub success_count: u64,
    /// Failed evaluations
    pub error_count: u64,
    /// Most recent success
    pub last_success_time: Option<Instant>,
    /// Most recent failure
    pub last_error_time: Option<Instant>,
}

impl DialerStats {
    /// Whether the most recent outcome was a success
    pub fn last_was_success(&self) -> bool {
        match (self.last_success_time, self.last_error_time) {
            (Some(success), Some(error)) => error < success,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// One pool entry
pub struct Dialer {
    kind: DialerKind,
    minimum_weight: f32,
    stats: Mutex<DialerStats>,
}

impl Dialer {
    /// Create a dialer with the given weight floor
    pub fn new(kind: DialerKind, minimum_weight: f32) -> Self {
        Self {
            kind,
            minimum_weight,
            stats: Mutex::new(DialerStats::default()),
        }
    }

    /// The connection technique
    pub fn kind(&self) -> &DialerKind {
        &self.kind
    }

    /// Selection priority
    pub fn priority(&self) -> u32 {
        self.kind.priority()
    }

    /// Stats snapshot
    pub fn stats(&self) -> DialerStats {
        *self.stats.lock()
    }

    /// Record a successful evaluation
    pub fn record_success(&self) {
        let mut stats = self.stats.lock();
        stats.success_count += 1;
        stats.last_success_time = Some(Instant::now());
    }

    /// Record a failed evaluation
    pub fn record_error(&self) {
        let mut stats = self.stats.lock();
        stats.error_count += 1;
        stats.last_error_time = Some(Instant::now());
    }

    /// `success / (success + error)`, clamped below by the minimum
    pub fn weight(&self) -> f32 {
        let stats = self.stats.lock();
        let total = stats.success_count + stats.error_count;
        let ratio = if total == 0 {
            1.0
        } else {
            stats.success_count as f32 / total as f32
        };
        ratio.max(self.minimum_weight)
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("kind", &self.kind)
            .field("weight", &self.weight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_ratio_and_floor() {
        let dialer = Dialer::new(DialerKind::Tls, 0.1);
        assert_eq!(dialer.weight(), 1.0);

        dialer.record_success();
        dialer.record_error();
        dialer.record_error();
        dialer.record_error();
        assert!((dialer.weight() - 0.25).abs() < 1e-6);

        for _ in 0..100 {
            dialer.record_error();
        }
        // The floor keeps it alive.
        assert!((dialer.weight() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_last_was_success() {
        let dialer = Dialer::new(DialerKind::TlsFragment, 0.0);
        assert!(!dialer.stats().last_was_success());

        dialer.record_success();
        assert!(dialer.stats().last_was_success());

        dialer.record_error();
        assert!(!dialer.stats().last_was_success());
    }

    #[test]
    fn test_priorities_order_base_kinds() {
        assert!(DialerKind::Tls.priority() < DialerKind::TlsFragment.priority());
        assert!(DialerKind::TlsFragment.priority() < DialerKind::TlsReorder.priority());
        assert!(
            DialerKind::TlsFragmentReorder.priority()
                < DialerKind::Extender(ExtenderConfig::test_config()).priority()
        );
    }
}
