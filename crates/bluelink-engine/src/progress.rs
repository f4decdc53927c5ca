//! Transfer progress reporting.
//!
//! Throughput is measured over a sliding window rather than per chunk, so a
//! momentarily idle link reads as a low rate instead of producing a division
//! by zero or a wildly oscillating ETA.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bluelink_shared::types::{TransferId, TransferStatus};

/// One progress tick for a transfer, as consumed by the presentation layer.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub transfer_id: TransferId,
    /// Completed fraction in percent, `acknowledged / total` chunks.
    pub percent: f64,
    /// Smoothed throughput over the measurement window.
    pub throughput_bytes_per_sec: f64,
    /// Estimated seconds remaining; `None` while the rate reads zero.
    pub eta_seconds: Option<u64>,
    pub status: TransferStatus,
}

/// Sliding-window byte-rate meter.
pub struct ThroughputMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record bytes moved just now.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.prune(at);
    }

    /// Bytes per second over the window.
    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&mut self, now: Instant) -> f64 {
        self.prune(now);
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        total as f64 / self.window.as_secs_f64()
    }

    /// Estimated seconds to move `remaining_bytes` at the current rate,
    /// rounded up. `None` while no bytes have moved within the window.
    pub fn eta(&mut self, remaining_bytes: u64) -> Option<u64> {
        let rate = self.rate();
        if rate <= f64::EPSILON {
            return None;
        }
        Some((remaining_bytes as f64 / rate).ceil() as u64)
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
