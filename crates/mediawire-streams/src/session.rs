//! Send side of a media stream: splits encoded frames into datagrams.
//!
//! Each frame gets one sequence number; its fragments share it and differ
//! only in `fragment_offset` / `fragment_index` / `packet_number`. Sending
//! is best effort: a fragment the transport refuses is counted and the rest
//! of the frame still goes out.

use std::sync::Arc;

use mediawire_core::clock::Clock;
use mediawire_core::config::TransportConfig;
use mediawire_core::wire::{
    encode_packet, HeaderFlags, MediaKind, WireHeader, FRAGMENT_INDEX_NONE, PACKET_OVERHEAD,
    PROTOCOL_VERSION,
};
use serde::Serialize;

use crate::frame::PeerId;
use crate::transport::{LossyTransport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("refusing to send an empty frame")]
    EmptyFrame,

    #[error("frame of {0} bytes does not fit the 32-bit length field")]
    FrameTooLarge(usize),

    #[error("{failed} of {total} fragments were not sent: {last}")]
    Partial {
        failed: u32,
        total: u32,
        last: TransportError,
    },
}

/// Send counters, exposed in call statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendStats {
    pub frames_sent: u64,
    pub fragments_sent: u64,
    pub fragments_failed: u64,
    pub bytes_sent: u64,
    pub last_error: Option<String>,
}

pub struct RtpSession {
    kind: MediaKind,
    peer: PeerId,
    transport: Arc<dyn LossyTransport>,
    clock: Arc<dyn Clock>,
    sync_source_id: u32,
    sequence_number: u16,
    frame_number: u32,
    packet_number: u32,
    max_datagram_size: usize,
    encoder_is_h264: bool,
    encoder_bitrate: u32,
    capture_delay_ms: u32,
    scratch: Vec<u8>,
    stats: SendStats,
}

impl RtpSession {
    pub fn new(
        kind: MediaKind,
        peer: PeerId,
        transport: Arc<dyn LossyTransport>,
        clock: Arc<dyn Clock>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            kind,
            peer,
            transport,
            clock,
            sync_source_id: rand::random(),
            sequence_number: 0,
            frame_number: 0,
            packet_number: 0,
            max_datagram_size: config.max_datagram_size,
            encoder_is_h264: false,
            encoder_bitrate: 0,
            capture_delay_ms: 0,
            scratch: Vec::with_capacity(config.max_datagram_size),
            stats: SendStats::default(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn sync_source_id(&self) -> u32 {
        self.sync_source_id
    }

    /// Sequence number the next frame will carry.
    pub fn next_sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn stats(&self) -> SendStats {
        self.stats.clone()
    }

    pub fn set_encoder_is_h264(&mut self, h264: bool) {
        self.encoder_is_h264 = h264;
    }

    pub fn set_encoder_bitrate(&mut self, kbps: u32) {
        self.encoder_bitrate = kbps;
    }

    pub fn set_capture_delay(&mut self, ms: u32) {
        self.capture_delay_ms = ms;
    }

    /// Payload bytes per datagram for a given hint.
    pub fn fragment_size(&self, hint: Option<usize>) -> usize {
        let limit = self.max_datagram_size.saturating_sub(PACKET_OVERHEAD).max(1);
        hint.map_or(limit, |h| h.clamp(1, limit))
    }

    fn frame_header(&self, len: u32, is_keyframe: bool, record_timestamp: u64) -> WireHeader {
        let mut flags = HeaderFlags::LARGE_FRAME | HeaderFlags::HAS_RECORD_TIMESTAMP;
        flags.set(HeaderFlags::KEY_FRAME, is_keyframe);
        flags.set(HeaderFlags::ENCODER_IS_H264, self.encoder_is_h264);

        WireHeader {
            version: PROTOCOL_VERSION,
            keyframe: is_keyframe,
            payload_type: self.kind.payload_type(),
            sequence_number: self.sequence_number,
            timestamp: self.clock.now_ms() as u32,
            sync_source_id: self.sync_source_id,
            frame_record_timestamp: record_timestamp,
            frame_number: self.frame_number,
            encoder_bitrate: self.encoder_bitrate,
            capture_delay_ms: self.capture_delay_ms,
            full_payload_length: len,
            legacy_length: len as u16,
            flags,
            ..WireHeader::default()
        }
    }

    /// Fragment and send one encoded frame.
    ///
    /// `fragment_hint` caps the payload bytes per datagram below the
    /// transport limit. Every fragment is attempted even if some fail; the
    /// sequence number advances once per frame either way.
    pub fn send_frame(
        &mut self,
        payload: &[u8],
        is_keyframe: bool,
        record_timestamp: u64,
        fragment_hint: Option<usize>,
    ) -> Result<(), SendError> {
        if payload.is_empty() {
            return Err(SendError::EmptyFrame);
        }
        let len = u32::try_from(payload.len()).map_err(|_| SendError::FrameTooLarge(payload.len()))?;

        let piece = self.fragment_size(fragment_hint);
        let total = payload.len().div_ceil(piece) as u32;
        let mut header = self.frame_header(len, is_keyframe, record_timestamp);
        let mut failed = 0u32;
        let mut last_error = None;

        for (index, chunk) in payload.chunks(piece).enumerate() {
            let offset = (index * piece) as u32;
            header.fragment_offset = offset;
            header.legacy_offset = offset as u16;
            header.fragment_index = if total == 1 {
                FRAGMENT_INDEX_NONE
            } else {
                index as i32
            };
            header.packet_number = self.packet_number;
            self.packet_number = self.packet_number.wrapping_add(1);

            self.scratch.clear();
            encode_packet(self.kind, &header, chunk, &mut self.scratch);

            match self.transport.send_lossy(&self.peer, &self.scratch) {
                Ok(()) => {
                    self.stats.fragments_sent += 1;
                    self.stats.bytes_sent += self.scratch.len() as u64;
                }
                Err(e) => {
                    failed += 1;
                    self.stats.fragments_failed += 1;
                    last_error = Some(e);
                }
            }
        }

        tracing::trace!(
            peer = hex::encode(&self.peer[..8]),
            kind = self.kind.as_str(),
            seq = self.sequence_number,
            bytes = len,
            fragments = total,
            keyframe = is_keyframe,
            "frame sent"
        );

        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.frame_number = self.frame_number.wrapping_add(1);
        self.stats.frames_sent += 1;

        match last_error {
            None => Ok(()),
            Some(last) => {
                tracing::warn!(
                    peer = hex::encode(&self.peer[..8]),
                    kind = self.kind.as_str(),
                    failed,
                    total,
                    error = %last,
                    "fragments not sent"
                );
                self.stats.last_error = Some(last.to_string());
                Err(SendError::Partial {
                    failed,
                    total,
                    last,
                })
            }
        }
    }
}
