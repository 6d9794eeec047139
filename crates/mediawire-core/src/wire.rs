//! Mediawire wire format: the header carried on every media fragment.
//!
//! These types ARE the protocol. Every field, every size, every reserved byte
//! is part of the wire format and must stay identical across the protocol
//! versions that talk to each other. Changing the layout is a breaking change.
//!
//! A datagram is laid out as:
//!
//! ```text
//! [payload-type prefix (1)] [RawHeader (80)] [fragment payload (..)]
//! ```
//!
//! `RawHeader` is the byte-exact on-wire image: every multi-byte field is a
//! big-endian zerocopy integer, so layout and byte order never depend on the
//! host. `WireHeader` is the decoded, host-friendly view with the RTP bit
//! fields split out. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, I32, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Sizes and protocol constants ─────────────────────────────────────────────

/// Size of the fixed media header in bytes.
pub const HEADER_SIZE: usize = 80;

/// Bytes in front of the media payload in every datagram (prefix + header).
pub const PACKET_OVERHEAD: usize = 1 + HEADER_SIZE;

/// Largest datagram the encrypted lossy transport accepts.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1373;

/// Current protocol: fragmentation, record timestamps, large frames.
pub const PROTOCOL_VERSION: u8 = 3;

/// Legacy protocol: the whole datagram payload is one frame.
pub const LEGACY_PROTOCOL_VERSION: u8 = 2;

/// `fragment_index` value for frames sent in a single datagram.
pub const FRAGMENT_INDEX_NONE: i32 = -1;

/// Contributing-source slots kept for RTP layout compatibility. Unused.
pub const LEGACY_CSRC_SLOTS: usize = 4;

/// Datagram prefix byte for audio fragments.
pub const AUDIO_PACKET_ID: u8 = 192;

/// Datagram prefix byte for video fragments.
pub const VIDEO_PACKET_ID: u8 = 193;

// ── Media kind ───────────────────────────────────────────────────────────────

/// Which media stream a datagram belongs to. Selected by the prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// The datagram prefix byte for this stream.
    pub fn packet_id(self) -> u8 {
        match self {
            MediaKind::Audio => AUDIO_PACKET_ID,
            MediaKind::Video => VIDEO_PACKET_ID,
        }
    }

    /// The 7-bit payload type carried inside the header.
    pub fn payload_type(self) -> u8 {
        self.packet_id() % 128
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl TryFrom<u8> for MediaKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            AUDIO_PACKET_ID => Ok(MediaKind::Audio),
            VIDEO_PACKET_ID => Ok(MediaKind::Video),
            other => Err(WireError::UnknownPacketId(other)),
        }
    }
}

// ── Flags ────────────────────────────────────────────────────────────────────

/// 64-bit flag word carried at offset 68.
///
/// Unknown bits are preserved on decode so a newer peer's flags survive a
/// relay through this code unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeaderFlags(u64);

impl HeaderFlags {
    /// Sender speaks the fragmenting protocol (32-bit offsets/lengths).
    pub const LARGE_FRAME: HeaderFlags = HeaderFlags(1 << 0);
    /// Frame decodes without reference to earlier frames.
    pub const KEY_FRAME: HeaderFlags = HeaderFlags(1 << 1);
    /// Video payload is H.264 rather than VPx.
    pub const ENCODER_IS_H264: HeaderFlags = HeaderFlags(1 << 2);
    /// `frame_record_timestamp` is meaningful.
    pub const HAS_RECORD_TIMESTAMP: HeaderFlags = HeaderFlags(1 << 3);

    pub const fn empty() -> Self {
        HeaderFlags(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        HeaderFlags(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: HeaderFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: HeaderFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: HeaderFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: HeaderFlags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl std::ops::BitOr for HeaderFlags {
    type Output = HeaderFlags;

    fn bitor(self, rhs: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.0 | rhs.0)
    }
}

// ── Raw on-wire header ───────────────────────────────────────────────────────

/// Byte-exact image of the 80-byte header. All integers are big-endian.
///
/// Wire size: 80 bytes.
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct RawHeader {
    /// version(2) | padding(1) | keyframe(1) | contributing_count(4)
    first: u8,
    /// marker(1) | payload_type(7)
    second: u8,
    sequence_number: U16<BigEndian>,
    timestamp: U32<BigEndian>,
    sync_source_id: U32<BigEndian>,
    contributing_sources: [U32<BigEndian>; LEGACY_CSRC_SLOTS],
    frame_record_timestamp: U64<BigEndian>,
    fragment_index: I32<BigEndian>,
    frame_number: U32<BigEndian>,
    encoder_bitrate: U32<BigEndian>,
    capture_delay_ms: U32<BigEndian>,
    packet_number: U32<BigEndian>,
    fragment_offset: U32<BigEndian>,
    full_payload_length: U32<BigEndian>,
    received_length: U32<BigEndian>,
    flags: U64<BigEndian>,
    legacy_offset: U16<BigEndian>,
    legacy_length: U16<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(RawHeader, [u8; HEADER_SIZE]);

// ── Decoded header ───────────────────────────────────────────────────────────

/// The decoded media header.
///
/// Bit fields are stored widened (`version` in a `u8`, flags as `bool`);
/// `encode` masks them back to their wire width, so `decode(encode(h)) == h`
/// holds for every header whose fields fit their widths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHeader {
    /// Protocol version (2 bits). See [`Protocol`].
    pub version: u8,
    pub padding: bool,
    pub keyframe: bool,
    /// Number of contributing sources (4 bits). Always zero on send.
    pub contributing_count: u8,
    pub marker: bool,
    /// 7-bit payload type, `packet_id % 128`.
    pub payload_type: u8,

    /// Per-frame sequence number. Wraps at 65536.
    pub sequence_number: u16,
    /// Sender's local send time in milliseconds.
    pub timestamp: u32,
    pub sync_source_id: u32,
    pub contributing_sources: [u32; LEGACY_CSRC_SLOTS],

    /// Sender's monotonic capture instant of the frame, in milliseconds.
    pub frame_record_timestamp: u64,
    /// Index of this fragment within its frame, or [`FRAGMENT_INDEX_NONE`].
    pub fragment_index: i32,
    /// Per-session frame counter (never wraps in practice).
    pub frame_number: u32,
    /// Encoder bitrate the sender is currently using, kbit/s.
    pub encoder_bitrate: u32,
    pub capture_delay_ms: u32,
    /// Per-session datagram counter.
    pub packet_number: u32,

    /// Byte offset of this fragment within the reassembled frame.
    pub fragment_offset: u32,
    /// Length of the reassembled frame.
    pub full_payload_length: u32,
    /// Receiver-local: bytes of this frame received so far.
    pub received_length: u32,
    pub flags: HeaderFlags,

    /// Low 16 bits of the offset, kept for version-2 receivers.
    pub legacy_offset: u16,
    /// Low 16 bits of the frame length, kept for version-2 receivers.
    pub legacy_length: u16,
}

/// Which receive path a header selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Version 3: fragment reassembly keyed by sequence number + timestamp.
    Current,
    /// Version 2: the datagram payload is one complete frame.
    Legacy,
}

impl Default for WireHeader {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            padding: false,
            keyframe: false,
            contributing_count: 0,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            sync_source_id: 0,
            contributing_sources: [0; LEGACY_CSRC_SLOTS],
            frame_record_timestamp: 0,
            fragment_index: FRAGMENT_INDEX_NONE,
            frame_number: 0,
            encoder_bitrate: 0,
            capture_delay_ms: 0,
            packet_number: 0,
            fragment_offset: 0,
            full_payload_length: 0,
            received_length: 0,
            flags: HeaderFlags::empty(),
            legacy_offset: 0,
            legacy_length: 0,
        }
    }
}

impl WireHeader {
    /// Encode into the fixed 80-byte wire image.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let first = ((self.version & 0x03) << 6)
            | (u8::from(self.padding) << 5)
            | (u8::from(self.keyframe) << 4)
            | (self.contributing_count & 0x0f);
        let second = (u8::from(self.marker) << 7) | (self.payload_type & 0x7f);

        let raw = RawHeader {
            first,
            second,
            sequence_number: U16::new(self.sequence_number),
            timestamp: U32::new(self.timestamp),
            sync_source_id: U32::new(self.sync_source_id),
            contributing_sources: self.contributing_sources.map(U32::new),
            frame_record_timestamp: U64::new(self.frame_record_timestamp),
            fragment_index: I32::new(self.fragment_index),
            frame_number: U32::new(self.frame_number),
            encoder_bitrate: U32::new(self.encoder_bitrate),
            capture_delay_ms: U32::new(self.capture_delay_ms),
            packet_number: U32::new(self.packet_number),
            fragment_offset: U32::new(self.fragment_offset),
            full_payload_length: U32::new(self.full_payload_length),
            received_length: U32::new(self.received_length),
            flags: U64::new(self.flags.bits()),
            legacy_offset: U16::new(self.legacy_offset),
            legacy_length: U16::new(self.legacy_length),
        };

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Decode the fixed 80-byte wire image. Total: every bit pattern decodes.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        // The array type pins the length, so the fallback never triggers.
        let raw = RawHeader::read_from(&bytes[..]).unwrap_or_else(RawHeader::new_zeroed);

        Self {
            version: raw.first >> 6,
            padding: raw.first & 0x20 != 0,
            keyframe: raw.first & 0x10 != 0,
            contributing_count: raw.first & 0x0f,
            marker: raw.second & 0x80 != 0,
            payload_type: raw.second & 0x7f,
            sequence_number: raw.sequence_number.get(),
            timestamp: raw.timestamp.get(),
            sync_source_id: raw.sync_source_id.get(),
            contributing_sources: raw.contributing_sources.map(|c| c.get()),
            frame_record_timestamp: raw.frame_record_timestamp.get(),
            fragment_index: raw.fragment_index.get(),
            frame_number: raw.frame_number.get(),
            encoder_bitrate: raw.encoder_bitrate.get(),
            capture_delay_ms: raw.capture_delay_ms.get(),
            packet_number: raw.packet_number.get(),
            fragment_offset: raw.fragment_offset.get(),
            full_payload_length: raw.full_payload_length.get(),
            received_length: raw.received_length.get(),
            flags: HeaderFlags::from_bits(raw.flags.get()),
            legacy_offset: raw.legacy_offset.get(),
            legacy_length: raw.legacy_length.get(),
        }
    }

    /// Decode from the front of an arbitrary slice. Never reads past 80 bytes.
    pub fn decode_prefix(bytes: &[u8]) -> Result<Self, WireError> {
        let fixed: &[u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(WireError::Truncated {
                len: bytes.len(),
                need: HEADER_SIZE,
            })?;
        Ok(Self::decode(fixed))
    }

    /// The receive path this header selects.
    pub fn protocol(&self) -> Result<Protocol, WireError> {
        match self.version {
            PROTOCOL_VERSION => Ok(Protocol::Current),
            LEGACY_PROTOCOL_VERSION => Ok(Protocol::Legacy),
            other => Err(WireError::UnknownVersion(other)),
        }
    }

    /// Keyframe marker, either the header bit or the flag word.
    pub fn is_keyframe(&self) -> bool {
        self.keyframe || self.flags.contains(HeaderFlags::KEY_FRAME)
    }

    /// The 32-bit logical time the playout buffer schedules against.
    ///
    /// Frames without a record timestamp (legacy senders) fall back to the
    /// send timestamp.
    pub fn playout_timestamp(&self) -> u32 {
        if self.flags.contains(HeaderFlags::HAS_RECORD_TIMESTAMP) {
            self.frame_record_timestamp as u32
        } else {
            self.timestamp
        }
    }
}

// ── Datagram framing ─────────────────────────────────────────────────────────

/// Append `prefix ++ header ++ payload` to `out`.
pub fn encode_packet(kind: MediaKind, header: &WireHeader, payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(PACKET_OVERHEAD + payload.len());
    out.push(kind.packet_id());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
}

/// Split a received datagram into its stream, header and fragment payload.
///
/// Rejects datagrams that are too short to hold a header, carry an unknown
/// prefix, or whose header payload type disagrees with the prefix.
pub fn decode_packet(packet: &[u8]) -> Result<(MediaKind, WireHeader, &[u8]), WireError> {
    let (&packet_id, rest) = packet.split_first().ok_or(WireError::Truncated {
        len: 0,
        need: PACKET_OVERHEAD,
    })?;
    let kind = MediaKind::try_from(packet_id)?;

    if rest.len() < HEADER_SIZE {
        return Err(WireError::Truncated {
            len: packet.len(),
            need: PACKET_OVERHEAD,
        });
    }
    let header = WireHeader::decode_prefix(rest)?;

    if header.payload_type != kind.payload_type() {
        return Err(WireError::PayloadTypeMismatch {
            packet_id,
            payload_type: header.payload_type,
        });
    }

    Ok((kind, header, &rest[HEADER_SIZE..]))
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {len} bytes is shorter than the {need} byte minimum")]
    Truncated { len: usize, need: usize },

    #[error("unknown packet id: 0x{0:02x}")]
    UnknownPacketId(u8),

    #[error("header payload type {payload_type} does not match packet id {packet_id}")]
    PayloadTypeMismatch { packet_id: u8, payload_type: u8 },

    #[error("unknown protocol version: {0}")]
    UnknownVersion(u8),

    #[error("fragment offset {offset} is outside frame of {length} bytes")]
    CorruptOffset { offset: u32, length: u32 },

    #[error("unknown control message tag: 0x{0:02x}")]
    UnknownControlTag(u8),

    #[error("control message of {0} bytes is malformed")]
    MalformedControl(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────
