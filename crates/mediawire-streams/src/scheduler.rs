//! Playout scheduling and drift correction.
//!
//! Each tick the scheduler computes the sender timestamp that should be
//! playing right now:
//!
//! ```text
//! want = now + difference_to_sender + adjustment
//! ```
//!
//! and asks the playout buffer for the oldest frame near `want`.
//! `difference_to_sender` is the estimated clock offset between the peers
//! (see [`ClockOffsetEstimator`]); `adjustment` is a slow integral
//! controller, negative while buffering, that tracks the round trip time
//! one step per tick.

use std::collections::VecDeque;

use mediawire_core::config::{ControlConfig, DriftConfig, PlayoutConfig};

use crate::playout_buffer::{PlayoutBuffer, PlayoutEntry};

/// Allows an action at most once per interval.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval_ms: u64,
    last_ms: Option<u64>,
}

impl RateLimiter {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_ms: None,
        }
    }

    /// True (and the action is recorded) when the interval has passed.
    pub fn try_acquire(&mut self, now_ms: u64) -> bool {
        let ready = self
            .last_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.interval_ms);
        if ready {
            self.last_ms = Some(now_ms);
        }
        ready
    }
}

/// Outcome of one scheduler tick.
pub struct Tick<T> {
    /// The frame to decode now, if any was due.
    pub entry: Option<PlayoutEntry<T>>,
    /// Entries discarded as too old to play.
    pub stale: Vec<PlayoutEntry<T>>,
    pub want_timestamp: u32,
    /// Ask the sender to lower its frame rate.
    pub request_lower_rate: bool,
}

pub struct DriftCorrector {
    config: DriftConfig,
    tolerance_window_ms: u32,
    startup_grace_ms: u32,
    startup_ticks_remaining: u32,
    difference_to_sender: i64,
    adjustment: i64,
    last_want: u32,
    lower_rate: RateLimiter,
}

impl DriftCorrector {
    pub fn new(playout: &PlayoutConfig, drift: &DriftConfig, control: &ControlConfig) -> Self {
        Self {
            config: drift.clone(),
            tolerance_window_ms: playout.tolerance_window_ms,
            startup_grace_ms: playout.startup_grace_ms,
            startup_ticks_remaining: playout.startup_ticks,
            difference_to_sender: 0,
            adjustment: drift.initial_adjustment_ms,
            last_want: 0,
            lower_rate: RateLimiter::new(control.lower_rate_interval_ms),
        }
    }

    pub fn adjustment(&self) -> i64 {
        self.adjustment
    }

    pub fn difference_to_sender(&self) -> i64 {
        self.difference_to_sender
    }

    pub fn last_want(&self) -> u32 {
        self.last_want
    }

    /// Update the clock offset estimate (sender clock minus local clock).
    pub fn set_difference_to_sender(&mut self, difference_ms: i64) {
        self.difference_to_sender = difference_ms;
    }

    fn want(&self, now_ms: u64) -> u32 {
        (now_ms as i64)
            .wrapping_add(self.difference_to_sender)
            .wrapping_add(self.adjustment) as u32
    }

    /// Pull `want` back toward the buffered range after a clock jump.
    fn fast_correct<T>(&mut self, buffer: &PlayoutBuffer<T>, want: u32) {
        if buffer.size() < self.config.fill_threshold {
            return;
        }
        let Some((min, max)) = buffer.range() else {
            return;
        };
        let ahead = i64::from(want.wrapping_sub(max) as i32);
        let behind = i64::from(min.wrapping_sub(want) as i32);
        if ahead > self.config.clock_jump_ms {
            self.adjustment -= ahead;
        } else if behind > self.config.clock_jump_ms {
            self.adjustment += behind;
        } else {
            return;
        }
        tracing::debug!(
            want,
            min,
            max,
            adjustment = self.adjustment,
            "playout clock jumped, correcting"
        );
    }

    /// One step of the round-trip tracking controller.
    fn track_round_trip(&mut self, buffered: usize, rtt_ms: u32) {
        let step = self.config.step_ms;
        let ceiling = -self.config.min_buffering_ms;
        let margin = -self.adjustment - self.config.latency_floor_ms;

        if i64::from(rtt_ms) > margin {
            if buffered >= self.config.comfortable_entries {
                self.adjustment = (self.adjustment + step).min(ceiling);
            } else {
                self.adjustment -= step;
            }
        } else {
            self.adjustment = (self.adjustment + step).min(ceiling);
        }
    }

    /// Run one scheduling tick against `buffer`.
    pub fn tick<T>(&mut self, buffer: &mut PlayoutBuffer<T>, now_ms: u64, rtt_ms: u32) -> Tick<T> {
        let grace = if self.startup_ticks_remaining > 0 {
            self.startup_ticks_remaining -= 1;
            self.startup_grace_ms
        } else {
            0
        };

        let want = self.want(now_ms);
        self.fast_correct(buffer, want);
        let want = self.want(now_ms);
        self.last_want = want;

        let window = self.tolerance_window_ms.saturating_add(grace);
        let stale = buffer.evict_older_than(want.wrapping_sub(window));
        let entry = buffer.take_oldest_in_range(want, window);

        self.track_round_trip(buffer.size(), rtt_ms);

        let request_lower_rate = !stale.is_empty() && self.lower_rate.try_acquire(now_ms);
        if request_lower_rate {
            tracing::info!(
                skipped = stale.len(),
                want,
                "playout is skipping frames, asking sender for a lower frame rate"
            );
        }

        Tick {
            entry,
            stale,
            want_timestamp: want,
            request_lower_rate,
        }
    }
}

// ── Clock offset ─────────────────────────────────────────────────────────────

/// One request/response timing exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub local_sent_ms: u64,
    /// The peer's clock when it answered.
    pub remote_ms: u64,
    pub local_received_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEstimate {
    /// Remote clock minus local clock.
    pub offset_ms: i64,
    /// Smoothed round trip time.
    pub rtt_ms: u32,
}

const CLOCK_WINDOW: usize = 8;

/// Estimates the peer clock offset from timing samples. The offset comes
/// from the lowest-RTT sample in the window (least queueing); the RTT is
/// smoothed with a 1/8 EWMA.
#[derive(Debug, Default)]
pub struct ClockOffsetEstimator {
    window: VecDeque<(u64, i64)>,
    srtt: Option<i64>,
}

impl ClockOffsetEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample. Samples received before they were sent are ignored.
    pub fn add_sample(&mut self, sample: ClockSample) -> Option<ClockEstimate> {
        let rtt = sample.local_received_ms.checked_sub(sample.local_sent_ms)?;
        let midpoint = sample.local_sent_ms + rtt / 2;
        let offset = sample.remote_ms as i64 - midpoint as i64;

        if self.window.len() == CLOCK_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back((rtt, offset));

        let srtt = match self.srtt {
            None => rtt as i64,
            Some(prev) => prev + (rtt as i64 - prev) / 8,
        };
        self.srtt = Some(srtt);

        self.estimate()
    }

    pub fn estimate(&self) -> Option<ClockEstimate> {
        let &(_, offset_ms) = self.window.iter().min_by_key(|(rtt, _)| *rtt)?;
        Some(ClockEstimate {
            offset_ms,
            rtt_ms: self.srtt?.clamp(0, i64::from(u32::MAX)) as u32,
        })
    }
}
