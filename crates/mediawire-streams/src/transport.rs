//! Collaborator contracts.
//!
//! The transport layer sits between the codecs and the encrypted datagram
//! transport. Everything it talks to is behind one of these traits, so the
//! engine can be driven by a real messenger, a simulator, or a test double.

use bytes::Bytes;
use mediawire_core::wire::{HeaderFlags, MediaKind};

use crate::frame::PeerId;

/// Best-effort datagram delivery to a peer (the encrypted lossy channel).
pub trait LossyTransport: Send + Sync {
    /// Queue one datagram. Must not block.
    fn send_lossy(&self, peer: &PeerId, packet: &[u8]) -> Result<(), TransportError>;
}

/// Reliable, ordered delivery of small control messages.
pub trait ControlChannel: Send + Sync {
    fn send_control(&self, peer: &PeerId, message: &[u8]) -> Result<(), TransportError>;
}

/// Feedback API of the bandwidth controller.
pub trait BandwidthFeedback: Send + Sync {
    fn add_received(&self, bytes: u32);

    /// `is_partial` marks bytes missing from a frame that was still
    /// delivered, as opposed to bytes of data dropped outright.
    fn add_lost(&self, bytes: u32, is_partial: bool);
}

/// Decoder side hand-off. Called once per frame released by playout,
/// never while a buffer lock is held.
pub trait FrameDecoder: Send + Sync {
    fn on_complete_frame(
        &self,
        peer: &PeerId,
        kind: MediaKind,
        payload: Bytes,
        flags: HeaderFlags,
        record_timestamp: u64,
    );
}

/// Failure reported by a transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer is not connected")]
    NotConnected,

    #[error("datagram of {0} bytes exceeds the transport limit")]
    TooLarge(usize),

    #[error("send queue is full")]
    QueueFull,

    #[error("transport failure: {0}")]
    Other(String),
}
