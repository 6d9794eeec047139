//! Frame types: the unit handed from reassembly to playout to decoder.

use bytes::Bytes;
use mediawire_core::wire::{HeaderFlags, MediaKind, WireHeader};

/// Identity of the remote peer (its long-term public key).
pub type PeerId = [u8; 32];

/// A reassembled media frame.
///
/// Not `Clone`: the payload has exactly one owner at every stage
/// (reassembler → playout buffer → scheduler → decoder).
#[derive(Debug)]
pub struct MediaFrame {
    pub kind: MediaKind,
    /// Header of the first fragment seen for this frame, with
    /// `received_length` set to the bytes actually received.
    pub header: WireHeader,
    /// Exactly `full_payload_length` bytes. Missing ranges of a partial
    /// frame are zero-filled.
    pub payload: Bytes,
}

impl MediaFrame {
    pub fn is_keyframe(&self) -> bool {
        self.header.is_keyframe()
    }

    pub fn is_complete(&self) -> bool {
        self.header.received_length >= self.header.full_payload_length
    }

    /// Bytes of the frame that never arrived.
    pub fn missing_bytes(&self) -> u32 {
        self.header
            .full_payload_length
            .saturating_sub(self.header.received_length)
    }

    pub fn playout_timestamp(&self) -> u32 {
        self.header.playout_timestamp()
    }

    /// Capture instant in the sender's clock.
    pub fn record_timestamp(&self) -> u64 {
        if self.header.flags.contains(HeaderFlags::HAS_RECORD_TIMESTAMP) {
            self.header.frame_record_timestamp
        } else {
            u64::from(self.header.timestamp)
        }
    }

    /// Flags for the decoder, with the keyframe bit folded in.
    pub fn flags(&self) -> HeaderFlags {
        let mut flags = self.header.flags;
        flags.set(HeaderFlags::KEY_FRAME, self.is_keyframe());
        flags
    }
}
