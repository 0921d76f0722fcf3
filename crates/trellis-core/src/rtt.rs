//! Sliding-window RTT estimator
//!
//! Send pacing uses a fixed-capacity window of recent round-trip
//! samples. Callers obtain an opaque tag at send time and close it at
//! receive time; the scaled estimate is the window mean clamped into a
//! configured band.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Configuration for an [`RttWindow`]
#[derive(Debug, Clone)]
pub struct RttWindowConfig {
    /// Maximum samples held
    pub capacity: usize,
    /// Samples older than this are evicted
    pub window_timeout: Duration,
    /// Multiplier applied to the window mean
    pub rtt_scale: f32,
    /// Lower clamp for the scaled estimate
    pub min_scaled_rtt: Duration,
    /// Upper clamp for the scaled estimate
    pub max_scaled_rtt: Duration,
}

impl Default for RttWindowConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            window_timeout: Duration::from_secs(60),
            rtt_scale: 2.0,
            min_scaled_rtt: Duration::from_millis(10),
            max_scaled_rtt: Duration::from_secs(30),
        }
    }
}

/// Opaque tag carrying the send time of an in-flight message
#[derive(Debug, Clone, Copy)]
pub struct RttTag {
    send_time: Instant,
}

#[derive(Debug, Clone, Copy)]
struct RttSample {
    receive_time: Instant,
    rtt: Duration,
}

/// Fixed-capacity sliding window of round-trip samples
pub struct RttWindow {
    config: RttWindowConfig,
    samples: VecDeque<RttSample>,
}

impl RttWindow {
    /// Create an empty window
    pub fn new(config: RttWindowConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
        }
    }

    /// Open a tag at `now`
    pub fn open_tag(&mut self, now: Instant) -> RttTag {
        self.evict(now);
        RttTag { send_time: now }
    }

    /// Close a tag at `now`, recording its round trip
    ///
    /// A tag closed before its own send time is dropped.
    pub fn close_tag(&mut self, tag: RttTag, now: Instant) {
        self.evict(now);
        let Some(rtt) = now.checked_duration_since(tag.send_time) else {
            return;
        };
        if self.samples.len() == self.config.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(RttSample {
            receive_time: now,
            rtt,
        });
    }

    /// Number of live samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window holds no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean round trip over the window; `None` when empty
    pub fn mean_rtt(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().map(|s| s.rtt).sum();
        Some(total / self.samples.len() as u32)
    }

    /// Smallest round trip over the window; `None` when empty
    pub fn min_rtt(&self) -> Option<Duration> {
        self.samples.iter().map(|s| s.rtt).min()
    }

    /// Scaled estimate: `clamp(mean * rtt_scale, min, max)`
    ///
    /// With no samples the lower clamp is returned.
    pub fn scaled_rtt(&self) -> Duration {
        let Some(mean) = self.mean_rtt() else {
            return self.config.min_scaled_rtt;
        };
        mean.mul_f32(self.config.rtt_scale)
            .clamp(self.config.min_scaled_rtt, self.config.max_scaled_rtt)
    }

    fn evict(&mut self, now: Instant) {
        let timeout = self.config.window_timeout;
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.receive_time) >= timeout {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
