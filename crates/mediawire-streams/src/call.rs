//! Calls (one per remote peer) and the registry that routes to them.
//!
//! A call bundles the two send sessions, the two receive streams, and the
//! collaborators they report to. Inbound datagrams are routed by their
//! payload-type prefix; inbound control messages update [`RemoteHints`]
//! for the encoder side to act on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use mediawire_core::clock::Clock;
use mediawire_core::config::MediaConfig;
use mediawire_core::control::ControlMessage;
use mediawire_core::wire::{decode_packet, MediaKind, WireError};
use parking_lot::Mutex;
use serde::Serialize;

use crate::frame::{MediaFrame, PeerId};
use crate::reassembler::FragmentOutcome;
use crate::scheduler::{ClockEstimate, ClockOffsetEstimator, ClockSample};
use crate::session::{RtpSession, SendError, SendStats};
use crate::stream::{AudioStream, StreamStats, VideoStream};
use crate::transport::{BandwidthFeedback, ControlChannel, FrameDecoder, LossyTransport, TransportError};

/// Everything a call talks to outside this crate.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn LossyTransport>,
    pub control: Arc<dyn ControlChannel>,
    pub bandwidth: Arc<dyn BandwidthFeedback>,
    pub decoder: Arc<dyn FrameDecoder>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("no active call with peer {0}")]
    UnknownPeer(String),
}

/// What the remote peer has asked of our encoders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteHints {
    /// Send a keyframe as soon as possible.
    pub keyframe_requested: bool,
    /// The remote decoder handles H.264.
    pub h264_decoder: bool,
    /// Frames per second the remote asked us to drop, accumulated.
    pub frame_rate_reduction: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStats {
    pub peer: String,
    pub audio_send: SendStats,
    pub video_send: SendStats,
    pub audio_receive: StreamStats,
    pub video_receive: StreamStats,
    pub remote: RemoteHints,
    pub rtt_ms: Option<u32>,
    pub clock_offset_ms: Option<i64>,
    pub rejected_packets: u64,
    pub control_failures: u64,
}

pub struct Call {
    peer: PeerId,
    clock: Arc<dyn Clock>,
    control: Arc<dyn ControlChannel>,
    decoder: Arc<dyn FrameDecoder>,
    audio_tx: Mutex<RtpSession>,
    video_tx: Mutex<RtpSession>,
    audio_rx: AudioStream,
    video_rx: VideoStream,
    hints: Mutex<RemoteHints>,
    clock_sync: Mutex<ClockOffsetEstimator>,
    lower_rate_step: u8,
    rejected_packets: AtomicU64,
    control_failures: AtomicU64,
}

impl Call {
    pub fn new(peer: PeerId, config: &MediaConfig, with: Collaborators) -> Self {
        let session = |kind| {
            Mutex::new(RtpSession::new(
                kind,
                peer,
                with.transport.clone(),
                with.clock.clone(),
                &config.transport,
            ))
        };
        Self {
            peer,
            audio_tx: session(MediaKind::Audio),
            video_tx: session(MediaKind::Video),
            audio_rx: AudioStream::new(config, with.bandwidth.clone()),
            video_rx: VideoStream::new(peer, config, with.bandwidth.clone()),
            clock: with.clock,
            control: with.control,
            decoder: with.decoder,
            hints: Mutex::new(RemoteHints::default()),
            clock_sync: Mutex::new(ClockOffsetEstimator::new()),
            lower_rate_step: config.control.lower_rate_step,
            rejected_packets: AtomicU64::new(0),
            control_failures: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    // ── Receive ───────────────────────────────────────────────────────────

    /// Handle one media datagram from the peer.
    pub fn on_packet(&self, packet: &[u8]) -> Result<FragmentOutcome, ReceiveError> {
        let result = self.route_packet(packet);
        if let Err(e) = &result {
            self.rejected_packets.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                peer = hex::encode(&self.peer[..8]),
                len = packet.len(),
                error = %e,
                "rejected media packet"
            );
        }
        result
    }

    fn route_packet(&self, packet: &[u8]) -> Result<FragmentOutcome, ReceiveError> {
        let (kind, header, payload) = decode_packet(packet)?;
        match kind {
            MediaKind::Audio => Ok(self.audio_rx.on_packet(&header, payload)?),
            MediaKind::Video => {
                let report = self
                    .video_rx
                    .on_packet(&header, payload, self.clock.now_ms())?;
                if report.request_keyframe {
                    self.send_control(ControlMessage::RequestKeyframe);
                }
                Ok(report.outcome)
            }
        }
    }

    /// Handle one control message from the peer.
    pub fn on_control(&self, message: &[u8]) -> Result<ControlMessage, ReceiveError> {
        let msg = ControlMessage::decode(message)?;
        {
            let mut hints = self.hints.lock();
            match msg {
                ControlMessage::RequestKeyframe => hints.keyframe_requested = true,
                ControlMessage::HaveH264Decoder => hints.h264_decoder = true,
                ControlMessage::LowerFrameRate { step } => {
                    hints.frame_rate_reduction =
                        hints.frame_rate_reduction.saturating_add(u32::from(step))
                }
            }
        }
        tracing::info!(
            peer = hex::encode(&self.peer[..8]),
            message = ?msg,
            "control message from peer"
        );
        Ok(msg)
    }

    /// Feed a timing exchange; updates the video scheduler's clock offset
    /// and round trip estimate.
    pub fn on_clock_sample(&self, sample: ClockSample) -> Option<ClockEstimate> {
        let estimate = self.clock_sync.lock().add_sample(sample)?;
        self.video_rx.set_difference_to_sender(estimate.offset_ms);
        self.video_rx.set_rtt(estimate.rtt_ms);
        Some(estimate)
    }

    // ── Send ──────────────────────────────────────────────────────────────

    pub fn send_audio_frame(&self, payload: &[u8], record_timestamp: u64) -> Result<(), SendError> {
        self.audio_tx
            .lock()
            .send_frame(payload, false, record_timestamp, None)
    }

    /// Send an encoded video frame. A keyframe answers any pending remote
    /// keyframe request.
    pub fn send_video_frame(
        &self,
        payload: &[u8],
        is_keyframe: bool,
        record_timestamp: u64,
        fragment_hint: Option<usize>,
    ) -> Result<(), SendError> {
        let result = self.video_tx.lock().send_frame(
            payload,
            is_keyframe,
            record_timestamp,
            fragment_hint,
        );
        if is_keyframe && !matches!(result, Err(SendError::EmptyFrame | SendError::FrameTooLarge(_))) {
            self.hints.lock().keyframe_requested = false;
        }
        result
    }

    /// Tell the sender side which encoder produced the video frames.
    pub fn set_video_encoder(&self, h264: bool, bitrate_kbps: u32) {
        let mut tx = self.video_tx.lock();
        tx.set_encoder_is_h264(h264);
        tx.set_encoder_bitrate(bitrate_kbps);
    }

    /// Advertise local H.264 decode support to the peer.
    pub fn announce_h264_decoder(&self) -> Result<(), TransportError> {
        self.control
            .send_control(&self.peer, &ControlMessage::HaveH264Decoder.encode())
    }

    pub fn remote_hints(&self) -> RemoteHints {
        *self.hints.lock()
    }

    /// Consume a pending keyframe request.
    pub fn take_keyframe_request(&self) -> bool {
        std::mem::take(&mut self.hints.lock().keyframe_requested)
    }

    fn send_control(&self, msg: ControlMessage) -> bool {
        match self.control.send_control(&self.peer, &msg.encode()) {
            Ok(()) => true,
            Err(e) => {
                self.control_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    peer = hex::encode(&self.peer[..8]),
                    message = ?msg,
                    error = %e,
                    "control message not sent"
                );
                false
            }
        }
    }

    // ── Playout ───────────────────────────────────────────────────────────

    fn decode(&self, frame: MediaFrame) {
        let flags = frame.flags();
        let record_timestamp = frame.record_timestamp();
        self.decoder
            .on_complete_frame(&self.peer, frame.kind, frame.payload, flags, record_timestamp);
    }

    /// Play the next audio frame, if any. Returns whether one was decoded.
    pub fn iterate_audio(&self) -> bool {
        match self.audio_rx.iterate() {
            Some(frame) => {
                self.decode(frame);
                true
            }
            None => false,
        }
    }

    /// Run one video scheduler tick. Returns whether a frame was decoded.
    pub fn iterate_video(&self) -> bool {
        let report = self.video_rx.iterate(self.clock.now_ms());
        if report.request_lower_rate {
            self.send_control(ControlMessage::LowerFrameRate {
                step: self.lower_rate_step,
            });
        }
        match report.frame {
            Some(frame) => {
                self.decode(frame);
                true
            }
            None => false,
        }
    }

    /// Teardown: free everything buffered. Returns the number of frames
    /// (buffered or in flight) discarded.
    pub fn end(&self) -> usize {
        let drained = self.audio_rx.drain() + self.video_rx.drain();
        tracing::info!(
            peer = hex::encode(&self.peer[..8]),
            drained,
            "call ended"
        );
        drained
    }

    pub fn stats(&self) -> CallStats {
        let estimate = self.clock_sync.lock().estimate();
        CallStats {
            peer: hex::encode(self.peer),
            audio_send: self.audio_tx.lock().stats(),
            video_send: self.video_tx.lock().stats(),
            audio_receive: self.audio_rx.stats(),
            video_receive: self.video_rx.stats(),
            remote: self.remote_hints(),
            rtt_ms: estimate.map(|e| e.rtt_ms),
            clock_offset_ms: estimate.map(|e| e.offset_ms),
            rejected_packets: self.rejected_packets.load(Ordering::Relaxed),
            control_failures: self.control_failures.load(Ordering::Relaxed),
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Active calls, keyed by peer. Shared across the receive and playout tasks.
#[derive(Default)]
pub struct CallRegistry {
    calls: DashMap<PeerId, Arc<Call>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a call with `peer`. An existing call with the same peer is
    /// ended and replaced.
    pub fn start(&self, peer: PeerId, config: &MediaConfig, with: Collaborators) -> Arc<Call> {
        let call = Arc::new(Call::new(peer, config, with));
        if let Some(previous) = self.calls.insert(peer, call.clone()) {
            previous.end();
        }
        tracing::info!(peer = hex::encode(&peer[..8]), "call started");
        call
    }

    pub fn get(&self, peer: &PeerId) -> Option<Arc<Call>> {
        self.calls.get(peer).map(|entry| entry.value().clone())
    }

    /// End and forget the call with `peer`.
    pub fn end(&self, peer: &PeerId) -> bool {
        match self.calls.remove(peer) {
            Some((_, call)) => {
                call.end();
                true
            }
            None => false,
        }
    }

    /// Inbound transport callback for media datagrams.
    pub fn on_packet(&self, peer: &PeerId, packet: &[u8]) -> Result<FragmentOutcome, ReceiveError> {
        self.lookup(peer)?.on_packet(packet)
    }

    /// Inbound transport callback for control messages.
    pub fn on_control(&self, peer: &PeerId, message: &[u8]) -> Result<ControlMessage, ReceiveError> {
        self.lookup(peer)?.on_control(message)
    }

    fn lookup(&self, peer: &PeerId) -> Result<Arc<Call>, ReceiveError> {
        // Clone out of the map so no shard lock is held while processing.
        self.get(peer)
            .ok_or_else(|| ReceiveError::UnknownPeer(hex::encode(&peer[..8])))
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.calls.iter().map(|entry| *entry.key()).collect()
    }
}
