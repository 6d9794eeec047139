//! Receive streams.
//!
//! Each stream owns its reassembler and buffer behind one mutex. Network
//! receive (producer) and the playout loop (consumer) both go through that
//! lock, but only for short in-memory work: bandwidth feedback, control
//! messages and the decoder are all called after the guard is dropped.

use std::sync::Arc;

use mediawire_core::config::MediaConfig;
use mediawire_core::wire::{MediaKind, Protocol, WireError, WireHeader, PACKET_OVERHEAD};
use parking_lot::Mutex;
use serde::Serialize;

use crate::frame::{MediaFrame, PeerId};
use crate::playout_buffer::PlayoutBuffer;
use crate::reassembler::{FragmentOutcome, FrameSink, ReassemblyStats, Reassembler};
use crate::ring_buffer::RingBuffer;
use crate::scheduler::{DriftCorrector, RateLimiter};
use crate::transport::BandwidthFeedback;

/// Receive-side counters shared by both stream kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiveStats {
    pub packets: u64,
    pub bytes: u64,
    pub partial_frames: u64,
    pub evicted_entries: u64,
    pub skipped_entries: u64,
    pub frames_played: u64,
    pub keyframe_requests: u64,
    pub lower_rate_requests: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub receive: ReceiveStats,
    pub reassembly: ReassemblyStats,
    pub buffered: usize,
    pub in_flight: usize,
    /// Scheduler state (video only).
    pub adjustment_ms: i64,
    pub want_timestamp: u32,
}

/// What the caller must do after a packet was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketReport {
    pub outcome: FragmentOutcome,
    /// A keyframe arrived incomplete; ask the sender for a new one.
    pub request_keyframe: bool,
}

/// What the caller must do after a playout tick.
#[derive(Debug)]
pub struct PlayoutReport {
    pub frame: Option<MediaFrame>,
    pub skipped: usize,
    pub request_lower_rate: bool,
}

/// Byte counts to report once the lock is released.
#[derive(Default)]
struct Losses {
    /// `(bytes, is_partial)`
    pending: Vec<(u32, bool)>,
    partial_frames: u64,
    evicted: u64,
    partial_keyframe: bool,
}

impl Losses {
    fn note_delivered(&mut self, frame: &MediaFrame) {
        if !frame.is_complete() {
            self.partial_frames += 1;
            self.pending.push((frame.missing_bytes(), true));
            if frame.is_keyframe() {
                self.partial_keyframe = true;
            }
        }
    }

    fn note_evicted(&mut self, frame: &MediaFrame) {
        self.evicted += 1;
        self.pending.push((frame.header.received_length, false));
    }

    fn report(&self, bwc: &dyn BandwidthFeedback) {
        for &(bytes, is_partial) in &self.pending {
            if bytes > 0 {
                bwc.add_lost(bytes, is_partial);
            }
        }
    }
}

struct PlayoutSink<'a> {
    buffer: &'a mut PlayoutBuffer<MediaFrame>,
    losses: Losses,
}

impl FrameSink for PlayoutSink<'_> {
    fn deliver(&mut self, frame: MediaFrame) {
        self.losses.note_delivered(&frame);
        let tag = frame.flags().bits();
        let timestamp = frame.playout_timestamp();
        if let Some(evicted) = self.buffer.write(frame, tag, timestamp) {
            self.losses.note_evicted(&evicted.payload);
        }
    }
}

struct RingSink<'a> {
    ring: &'a mut RingBuffer<MediaFrame>,
    losses: Losses,
}

impl FrameSink for RingSink<'_> {
    fn deliver(&mut self, frame: MediaFrame) {
        self.losses.note_delivered(&frame);
        // The ring tag only has room for the low flag bits.
        let tag = frame.flags().bits() as u8;
        if let Some((evicted, _)) = self.ring.write(frame, tag) {
            self.losses.note_evicted(&evicted);
        }
    }
}

fn feed<S: FrameSink>(
    reassembler: &mut Reassembler,
    header: &WireHeader,
    payload: &[u8],
    sink: &mut S,
) -> Result<FragmentOutcome, WireError> {
    Ok(match header.protocol()? {
        Protocol::Current => reassembler.on_fragment_received(header, payload, sink),
        Protocol::Legacy => reassembler.on_legacy_packet(header, payload, sink),
    })
}

fn report_received(bwc: &dyn BandwidthFeedback, outcome: FragmentOutcome, payload: &[u8]) {
    bwc.add_received((PACKET_OVERHEAD + payload.len()) as u32);
    if let FragmentOutcome::Dropped(reason) = outcome {
        if reason.is_loss() {
            bwc.add_lost(payload.len() as u32, false);
        }
    }
}

// ── Video ────────────────────────────────────────────────────────────────────

struct VideoState {
    reassembler: Reassembler,
    playout: PlayoutBuffer<MediaFrame>,
    scheduler: DriftCorrector,
    keyframe_requests: RateLimiter,
    rtt_ms: u32,
    stats: ReceiveStats,
}

pub struct VideoStream {
    peer: PeerId,
    bwc: Arc<dyn BandwidthFeedback>,
    state: Mutex<VideoState>,
}

impl VideoStream {
    pub fn new(peer: PeerId, config: &MediaConfig, bwc: Arc<dyn BandwidthFeedback>) -> Self {
        let state = VideoState {
            reassembler: Reassembler::new(MediaKind::Video, &config.reassembly),
            playout: PlayoutBuffer::new(config.playout.video_capacity),
            scheduler: DriftCorrector::new(&config.playout, &config.drift, &config.control),
            keyframe_requests: RateLimiter::new(config.control.keyframe_request_interval_ms),
            rtt_ms: 0,
            stats: ReceiveStats::default(),
        };
        Self {
            peer,
            bwc,
            state: Mutex::new(state),
        }
    }

    /// Producer side: one datagram's header and payload.
    pub fn on_packet(
        &self,
        header: &WireHeader,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<PacketReport, WireError> {
        let (outcome, losses, request_keyframe) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut sink = PlayoutSink {
                buffer: &mut state.playout,
                losses: Losses::default(),
            };
            let outcome = feed(&mut state.reassembler, header, payload, &mut sink)?;
            let losses = sink.losses;

            state.stats.packets += 1;
            state.stats.bytes += payload.len() as u64;
            state.stats.partial_frames += losses.partial_frames;
            state.stats.evicted_entries += losses.evicted;
            let request = losses.partial_keyframe && state.keyframe_requests.try_acquire(now_ms);
            if request {
                state.stats.keyframe_requests += 1;
            }
            (outcome, losses, request)
        };

        report_received(self.bwc.as_ref(), outcome, payload);
        losses.report(self.bwc.as_ref());
        if request_keyframe {
            tracing::debug!(
                peer = hex::encode(&self.peer[..8]),
                seq = header.sequence_number,
                "keyframe arrived incomplete"
            );
        }

        Ok(PacketReport {
            outcome,
            request_keyframe,
        })
    }

    /// Consumer side: one scheduler tick.
    pub fn iterate(&self, now_ms: u64) -> PlayoutReport {
        let (frame, stale, request_lower_rate) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let tick = state
                .scheduler
                .tick(&mut state.playout, now_ms, state.rtt_ms);
            state.reassembler.set_skipping(!tick.stale.is_empty());

            state.stats.skipped_entries += tick.stale.len() as u64;
            if tick.entry.is_some() {
                state.stats.frames_played += 1;
            }
            if tick.request_lower_rate {
                state.stats.lower_rate_requests += 1;
            }
            (
                tick.entry.map(|e| e.payload),
                tick.stale,
                tick.request_lower_rate,
            )
        };

        for entry in &stale {
            self.bwc.add_lost(entry.payload.header.received_length, false);
        }
        if !stale.is_empty() {
            tracing::debug!(
                peer = hex::encode(&self.peer[..8]),
                skipped = stale.len(),
                "discarded stale video frames"
            );
        }

        PlayoutReport {
            frame,
            skipped: stale.len(),
            request_lower_rate,
        }
    }

    pub fn set_rtt(&self, rtt_ms: u32) {
        self.state.lock().rtt_ms = rtt_ms;
    }

    pub fn set_difference_to_sender(&self, difference_ms: i64) {
        self.state
            .lock()
            .scheduler
            .set_difference_to_sender(difference_ms);
    }

    /// Teardown: free everything buffered or in flight.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let buffered = state.playout.drain().len();
        buffered + state.reassembler.clear()
    }

    pub fn stats(&self) -> StreamStats {
        let state = self.state.lock();
        StreamStats {
            receive: state.stats,
            reassembly: state.reassembler.stats(),
            buffered: state.playout.size(),
            in_flight: state.reassembler.in_flight(),
            adjustment_ms: state.scheduler.adjustment(),
            want_timestamp: state.scheduler.last_want(),
        }
    }
}

// ── Audio ────────────────────────────────────────────────────────────────────

struct AudioState {
    reassembler: Reassembler,
    ring: RingBuffer<MediaFrame>,
    stats: ReceiveStats,
}

/// Audio plays in arrival order out of a small FIFO.
pub struct AudioStream {
    bwc: Arc<dyn BandwidthFeedback>,
    state: Mutex<AudioState>,
}

impl AudioStream {
    pub fn new(config: &MediaConfig, bwc: Arc<dyn BandwidthFeedback>) -> Self {
        let state = AudioState {
            reassembler: Reassembler::new(MediaKind::Audio, &config.reassembly),
            ring: RingBuffer::new(config.playout.audio_capacity),
            stats: ReceiveStats::default(),
        };
        Self {
            bwc,
            state: Mutex::new(state),
        }
    }

    pub fn on_packet(&self, header: &WireHeader, payload: &[u8]) -> Result<FragmentOutcome, WireError> {
        let (outcome, losses) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut sink = RingSink {
                ring: &mut state.ring,
                losses: Losses::default(),
            };
            let outcome = feed(&mut state.reassembler, header, payload, &mut sink)?;
            let losses = sink.losses;

            state.stats.packets += 1;
            state.stats.bytes += payload.len() as u64;
            state.stats.partial_frames += losses.partial_frames;
            state.stats.evicted_entries += losses.evicted;
            (outcome, losses)
        };

        report_received(self.bwc.as_ref(), outcome, payload);
        losses.report(self.bwc.as_ref());
        Ok(outcome)
    }

    /// Next frame to decode, oldest first.
    pub fn iterate(&self) -> Option<MediaFrame> {
        let mut state = self.state.lock();
        let (frame, _tag) = state.ring.read()?;
        state.stats.frames_played += 1;
        Some(frame)
    }

    pub fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let buffered = state.ring.drain().len();
        buffered + state.reassembler.clear()
    }

    pub fn stats(&self) -> StreamStats {
        let state = self.state.lock();
        StreamStats {
            receive: state.stats,
            reassembly: state.reassembler.stats(),
            buffered: state.ring.size(),
            in_flight: state.reassembler.in_flight(),
            ..StreamStats::default()
        }
    }
}
