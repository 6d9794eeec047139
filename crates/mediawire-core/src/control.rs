//! Out-of-band control messages. Tiny tagged byte strings carried on the
//! reliable control channel, never on the lossy media path.
//!
//! Every message starts with [`CONTROL_PACKET_ID`] followed by a one-byte
//! tag; some tags carry a single argument byte:
//!
//! ```text
//! [172, 0]      request a keyframe
//! [172, 1]      local decoder handles H.264
//! [172, 2, n]   lower your video frame rate by n
//! ```
//!
//! The format is not versioned further. Unknown tags are rejected.

use crate::wire::WireError;

/// Prefix byte of every control message.
pub const CONTROL_PACKET_ID: u8 = 172;

/// Control message tags.
pub mod tag {
    pub const REQUEST_KEYFRAME: u8 = 0x00;
    pub const HAVE_H264_DECODER: u8 = 0x01;
    pub const LOWER_FRAME_RATE: u8 = 0x02;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// The receiver lost a keyframe and cannot decode until it gets a new one.
    RequestKeyframe,
    /// The receiver can decode H.264, so the sender may switch encoders.
    HaveH264Decoder,
    /// The receiver cannot keep up; drop `step` frames per second.
    LowerFrameRate { step: u8 },
}

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            ControlMessage::RequestKeyframe => vec![CONTROL_PACKET_ID, tag::REQUEST_KEYFRAME],
            ControlMessage::HaveH264Decoder => vec![CONTROL_PACKET_ID, tag::HAVE_H264_DECODER],
            ControlMessage::LowerFrameRate { step } => {
                vec![CONTROL_PACKET_ID, tag::LOWER_FRAME_RATE, step]
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        match bytes {
            [CONTROL_PACKET_ID, tag::REQUEST_KEYFRAME] => Ok(ControlMessage::RequestKeyframe),
            [CONTROL_PACKET_ID, tag::HAVE_H264_DECODER] => Ok(ControlMessage::HaveH264Decoder),
            [CONTROL_PACKET_ID, tag::LOWER_FRAME_RATE, step] => {
                Ok(ControlMessage::LowerFrameRate { step: *step })
            }
            [CONTROL_PACKET_ID, t, ..]
                if ![tag::REQUEST_KEYFRAME, tag::HAVE_H264_DECODER, tag::LOWER_FRAME_RATE]
                    .contains(t) =>
            {
                Err(WireError::UnknownControlTag(*t))
            }
            other => Err(WireError::MalformedControl(other.len())),
        }
    }
}
