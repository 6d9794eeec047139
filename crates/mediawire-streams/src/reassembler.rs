//! Fragment reassembly. Turns fragments back into frames.
//!
//! A small list of work buffers ("slots") holds frames that are still
//! arriving, keyed by `(sequence_number, timestamp)`. Slots stay in
//! insertion order so slot 0 is always the oldest frame in flight. When a
//! frame's last byte arrives its slot is removed and the frame is handed to
//! a [`FrameSink`] synchronously.
//!
//! When every slot is taken, a new frame either evicts slot 0 (which is
//! flushed downstream as a partial frame) or, if slot 0 is a keyframe still
//! being assembled, is dropped so the keyframe can finish.

use std::ops::Range;

use bytes::{Bytes, BytesMut};
use mediawire_core::config::ReassemblyConfig;
use mediawire_core::wire::{MediaKind, WireHeader, FRAGMENT_INDEX_NONE};
use serde::Serialize;

use crate::frame::MediaFrame;

/// Receives frames as reassembly finishes with them.
pub trait FrameSink {
    fn deliver(&mut self, frame: MediaFrame);
}

impl FrameSink for Vec<MediaFrame> {
    fn deliver(&mut self, frame: MediaFrame) {
        self.push(frame);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Normal,
    Key,
}

/// What happened to one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Stored in a slot; the frame is not complete yet.
    Buffered,
    /// The fragment completed a frame, which was delivered.
    Completed,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Offset or length inconsistent with the announced frame, or a
    /// fragment that partly overlaps bytes already received.
    Corrupt,
    /// Announced frame larger than `max_frame_bytes`.
    TooLarge,
    /// Frame older than the last one delivered.
    Stale,
    /// Every byte of the fragment was already received for this slot.
    Duplicate,
    /// All slots busy and slot 0 holds a keyframe in progress.
    KeyframeProtected,
}

impl DropReason {
    /// Whether the dropped bytes count as lost media.
    pub fn is_loss(self) -> bool {
        !matches!(self, DropReason::Duplicate)
    }
}

/// Result of the slot admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Continuation of the frame in this slot.
    Existing(usize),
    /// A slot is free for a new frame.
    Free,
    /// Flush slot 0 to make room.
    EvictOldest,
    /// Keep slot 0; drop the incoming fragment.
    DropIncoming,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblyStats {
    pub completed: u64,
    pub partial_flushed: u64,
    pub dropped_corrupt: u64,
    pub dropped_stale: u64,
    pub dropped_duplicate: u64,
    pub dropped_keyframe_protected: u64,
}

struct ReassemblySlot {
    frame_type: FrameType,
    bytes_received: u32,
    total_bytes: u32,
    timestamp: u32,
    sequence_number: u16,
    /// Byte ranges already copied in, sorted and merged.
    covered: Vec<Range<u32>>,
    header: WireHeader,
    buffer: BytesMut,
}

impl ReassemblySlot {
    fn new(header: &WireHeader) -> Self {
        let total = header.full_payload_length;
        Self {
            frame_type: if header.is_keyframe() {
                FrameType::Key
            } else {
                FrameType::Normal
            },
            bytes_received: 0,
            total_bytes: total,
            timestamp: header.timestamp,
            sequence_number: header.sequence_number,
            covered: Vec::new(),
            header: header.clone(),
            buffer: BytesMut::zeroed(total as usize),
        }
    }

    fn is_complete(&self) -> bool {
        self.bytes_received == self.total_bytes
    }

    /// Copy a fragment in. Only bytes not seen before are accepted, so
    /// `bytes_received` counts distinct bytes.
    fn fill(&mut self, offset: u32, fragment: &[u8]) -> Result<(), DropReason> {
        let len = u32::try_from(fragment.len()).map_err(|_| DropReason::Corrupt)?;
        let end = offset.checked_add(len).ok_or(DropReason::Corrupt)?;
        if len == 0 || end > self.total_bytes {
            return Err(DropReason::Corrupt);
        }

        // First range that ends past `offset`; everything before it is clear.
        let at = self.covered.partition_point(|r| r.end <= offset);
        if let Some(next) = self.covered.get(at) {
            if next.start <= offset && end <= next.end {
                return Err(DropReason::Duplicate);
            }
            if next.start < end {
                return Err(DropReason::Corrupt);
            }
        }

        let target = self
            .buffer
            .get_mut(offset as usize..end as usize)
            .ok_or(DropReason::Corrupt)?;
        target.copy_from_slice(fragment);
        self.bytes_received += len;

        let joins_prev = at > 0 && self.covered[at - 1].end == offset;
        let joins_next = self.covered.get(at).is_some_and(|r| r.start == end);
        match (joins_prev, joins_next) {
            (true, true) => {
                let next = self.covered.remove(at);
                self.covered[at - 1].end = next.end;
            }
            (true, false) => self.covered[at - 1].end = end,
            (false, true) => self.covered[at].start = offset,
            (false, false) => self.covered.insert(at, offset..end),
        }
        Ok(())
    }

    fn into_frame(self, kind: MediaKind) -> MediaFrame {
        let mut header = self.header;
        header.received_length = self.bytes_received;
        MediaFrame {
            kind,
            header,
            payload: self.buffer.freeze(),
        }
    }
}

/// Fixed-capacity slot list, oldest first.
struct WorkBufferList {
    slots: Vec<ReassemblySlot>,
    capacity: usize,
}

impl WorkBufferList {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    fn find(&self, sequence_number: u16, timestamp: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.sequence_number == sequence_number && s.timestamp == timestamp)
    }

    fn oldest(&self) -> Option<&ReassemblySlot> {
        self.slots.first()
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut ReassemblySlot> {
        self.slots.get_mut(index)
    }

    fn insert_at_end(&mut self, slot: ReassemblySlot) -> usize {
        self.slots.push(slot);
        self.slots.len() - 1
    }

    fn remove_and_compact(&mut self, index: usize) -> Option<ReassemblySlot> {
        (index < self.slots.len()).then(|| self.slots.remove(index))
    }

    fn clear(&mut self) -> usize {
        let n = self.slots.len();
        self.slots.clear();
        n
    }
}

pub struct Reassembler {
    kind: MediaKind,
    slots: WorkBufferList,
    keyframe_protect_ms: u32,
    skip_tolerance: u16,
    max_frame_bytes: u32,
    last_delivered: Option<u16>,
    skipping: bool,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(kind: MediaKind, config: &ReassemblyConfig) -> Self {
        Self {
            kind,
            slots: WorkBufferList::new(config.slots),
            keyframe_protect_ms: config.keyframe_protect_ms,
            skip_tolerance: config.skip_tolerance,
            max_frame_bytes: config.max_frame_bytes,
            last_delivered: None,
            skipping: false,
            stats: ReassemblyStats::default(),
        }
    }

    /// Frames currently being assembled.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    pub fn last_delivered(&self) -> Option<u16> {
        self.last_delivered
    }

    /// The scheduler is discarding stale frames; relax the ordering guard.
    pub fn set_skipping(&mut self, skipping: bool) {
        self.skipping = skipping;
    }

    /// Slot admission policy for a fragment of a frame not matched yet
    /// (or matched, for continuations).
    pub fn admit(&self, header: &WireHeader, multipart: bool) -> Admission {
        if multipart {
            if let Some(index) = self.slots.find(header.sequence_number, header.timestamp) {
                return Admission::Existing(index);
            }
        }
        if !self.slots.is_full() {
            return Admission::Free;
        }
        if header.is_keyframe() {
            return Admission::EvictOldest;
        }
        match self.slots.oldest() {
            Some(oldest)
                if oldest.frame_type == FrameType::Key
                    && !oldest.is_complete()
                    && (header.timestamp.wrapping_sub(oldest.timestamp) as i32).unsigned_abs()
                        < self.keyframe_protect_ms =>
            {
                Admission::DropIncoming
            }
            _ => Admission::EvictOldest,
        }
    }

    /// Whether a new frame with this sequence number is too old to accept.
    fn is_stale(&self, sequence_number: u16) -> bool {
        let Some(last) = self.last_delivered else {
            return false;
        };
        let behind = last.wrapping_sub(sequence_number) as i16;
        if behind < 0 {
            return false;
        }
        !(self.skipping && behind > 0 && behind as u16 <= self.skip_tolerance)
    }

    fn validate(&self, header: &WireHeader, fragment: &[u8]) -> Result<(), DropReason> {
        let total = header.full_payload_length;
        let offset = header.fragment_offset;
        if fragment.is_empty() || offset >= total {
            return Err(DropReason::Corrupt);
        }
        if u64::from(offset) + fragment.len() as u64 > u64::from(total) {
            return Err(DropReason::Corrupt);
        }
        if total > self.max_frame_bytes {
            return Err(DropReason::TooLarge);
        }
        Ok(())
    }

    fn deliver<S: FrameSink>(&mut self, frame: MediaFrame, sink: &mut S) {
        let seq = frame.header.sequence_number;
        let newer = self
            .last_delivered
            .map_or(true, |last| (seq.wrapping_sub(last) as i16) > 0);
        if newer {
            self.last_delivered = Some(seq);
        }
        if frame.is_complete() {
            self.stats.completed += 1;
        } else {
            self.stats.partial_flushed += 1;
        }
        sink.deliver(frame);
    }

    fn flush_oldest<S: FrameSink>(&mut self, sink: &mut S) {
        if let Some(slot) = self.slots.remove_and_compact(0) {
            tracing::debug!(
                seq = slot.sequence_number,
                received = slot.bytes_received,
                total = slot.total_bytes,
                keyframe = slot.frame_type == FrameType::Key,
                "evicting oldest reassembly slot"
            );
            let frame = slot.into_frame(self.kind);
            self.deliver(frame, sink);
        }
    }

    fn drop_fragment(&mut self, header: &WireHeader, reason: DropReason) -> FragmentOutcome {
        match reason {
            DropReason::Corrupt | DropReason::TooLarge => self.stats.dropped_corrupt += 1,
            DropReason::Stale => self.stats.dropped_stale += 1,
            DropReason::Duplicate => self.stats.dropped_duplicate += 1,
            DropReason::KeyframeProtected => self.stats.dropped_keyframe_protected += 1,
        }
        tracing::trace!(
            seq = header.sequence_number,
            offset = header.fragment_offset,
            total = header.full_payload_length,
            reason = ?reason,
            "dropping fragment"
        );
        FragmentOutcome::Dropped(reason)
    }

    /// Feed one fragment of a current-protocol frame.
    pub fn on_fragment_received<S: FrameSink>(
        &mut self,
        header: &WireHeader,
        fragment: &[u8],
        sink: &mut S,
    ) -> FragmentOutcome {
        if let Err(reason) = self.validate(header, fragment) {
            return self.drop_fragment(header, reason);
        }

        let single = header.fragment_offset == 0
            && fragment.len() as u32 == header.full_payload_length;

        let index = match self.admit(header, !single) {
            Admission::Existing(index) => index,
            Admission::DropIncoming => {
                return self.drop_fragment(header, DropReason::KeyframeProtected)
            }
            admission => {
                if self.is_stale(header.sequence_number) {
                    return self.drop_fragment(header, DropReason::Stale);
                }
                if admission == Admission::EvictOldest {
                    self.flush_oldest(sink);
                }
                if single {
                    let mut header = header.clone();
                    header.received_length = header.full_payload_length;
                    let frame = MediaFrame {
                        kind: self.kind,
                        header,
                        payload: Bytes::copy_from_slice(fragment),
                    };
                    self.deliver(frame, sink);
                    return FragmentOutcome::Completed;
                }
                self.slots.insert_at_end(ReassemblySlot::new(header))
            }
        };

        let Some(slot) = self.slots.get_mut(index) else {
            return self.drop_fragment(header, DropReason::Corrupt);
        };
        if slot.total_bytes != header.full_payload_length {
            return self.drop_fragment(header, DropReason::Corrupt);
        }
        if let Err(reason) = slot.fill(header.fragment_offset, fragment) {
            return self.drop_fragment(header, reason);
        }
        if !slot.is_complete() {
            return FragmentOutcome::Buffered;
        }

        match self.slots.remove_and_compact(index) {
            Some(slot) => {
                let frame = slot.into_frame(self.kind);
                self.deliver(frame, sink);
                FragmentOutcome::Completed
            }
            None => FragmentOutcome::Buffered,
        }
    }

    /// Feed a version-2 packet: the whole payload is one frame.
    pub fn on_legacy_packet<S: FrameSink>(
        &mut self,
        header: &WireHeader,
        payload: &[u8],
        sink: &mut S,
    ) -> FragmentOutcome {
        if payload.is_empty() {
            return self.drop_fragment(header, DropReason::Corrupt);
        }
        if payload.len() as u64 > u64::from(self.max_frame_bytes) {
            return self.drop_fragment(header, DropReason::TooLarge);
        }
        if self.is_stale(header.sequence_number) {
            return self.drop_fragment(header, DropReason::Stale);
        }

        let length = payload.len() as u32;
        let mut header = header.clone();
        header.fragment_offset = 0;
        header.fragment_index = FRAGMENT_INDEX_NONE;
        header.full_payload_length = length;
        header.received_length = length;
        let frame = MediaFrame {
            kind: self.kind,
            header,
            payload: Bytes::copy_from_slice(payload),
        };
        self.deliver(frame, sink);
        FragmentOutcome::Completed
    }

    /// Discard every frame in flight. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        self.slots.clear()
    }
}
