//! Loss accounting: a lock-free stand-in for the bandwidth controller.
//!
//! Counts what the receive path reports through [`BandwidthFeedback`]:
//!   received: every datagram byte that reached the stream
//!   lost:     bytes dropped outright (corrupt, stale, evicted)
//!   partial:  bytes missing from frames delivered incomplete
//!
//! A real controller turns these into a bitrate; this one only keeps score.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::transport::BandwidthFeedback;

#[derive(Debug, Default)]
pub struct LossCounter {
    received_bytes: AtomicU64,
    lost_bytes: AtomicU64,
    partial_bytes: AtomicU64,
    loss_events: AtomicU64,
}

/// Point-in-time copy of a [`LossCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LossSnapshot {
    pub received_bytes: u64,
    pub lost_bytes: u64,
    pub partial_bytes: u64,
    pub loss_events: u64,
}

impl LossCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> LossSnapshot {
        LossSnapshot {
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            lost_bytes: self.lost_bytes.load(Ordering::Relaxed),
            partial_bytes: self.partial_bytes.load(Ordering::Relaxed),
            loss_events: self.loss_events.load(Ordering::Relaxed),
        }
    }
}

impl LossSnapshot {
    /// Fraction of bytes lost, partial losses included. 0.0 with no traffic.
    pub fn loss_ratio(&self) -> f64 {
        let lost = self.lost_bytes + self.partial_bytes;
        let total = self.received_bytes + lost;
        if total == 0 {
            0.0
        } else {
            lost as f64 / total as f64
        }
    }
}

impl BandwidthFeedback for LossCounter {
    fn add_received(&self, bytes: u32) {
        self.received_bytes
            .fetch_add(u64::from(bytes), Ordering::Relaxed);
    }

    fn add_lost(&self, bytes: u32, is_partial: bool) {
        let counter = if is_partial {
            &self.partial_bytes
        } else {
            &self.lost_bytes
        };
        counter.fetch_add(u64::from(bytes), Ordering::Relaxed);
        self.loss_events.fetch_add(1, Ordering::Relaxed);
    }
}
