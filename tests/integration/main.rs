//! Mediawire integration test harness.
//!
//! Two peers, A and B, each with a call to the other, joined by an
//! in-memory lossy link. Nothing is delivered until the test pumps the
//! link, so every test controls ordering, loss and timing exactly. Both
//! peers share one manually advanced clock.
//!
//!   RUST_LOG=mediawire_streams=trace cargo test --test integration

use std::sync::{Arc, Once};

use anyhow::Result;
use bytes::Bytes;
use mediawire_core::wire::{HeaderFlags, MediaKind};
use mediawire_core::{Clock, ManualClock, MediaConfig};
use mediawire_streams::{
    Call, Collaborators, ControlChannel, FrameDecoder, LossCounter, LossyTransport, PeerId,
    TransportError,
};
use parking_lot::Mutex;

mod concurrency;
mod control;
mod loss;
mod media;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const PEER_A: PeerId = [0xaa; 32];
pub const PEER_B: PeerId = [0xbb; 32];

static TRACING: Once = Once::new();

/// Install a subscriber once per test binary. Honours RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One direction of the link: datagrams and control messages waiting to
/// be delivered.
#[derive(Default)]
pub struct Wire {
    pub media: Mutex<Vec<Vec<u8>>>,
    pub control: Mutex<Vec<Vec<u8>>>,
    /// Refuse every send while set.
    pub down: Mutex<bool>,
}

impl LossyTransport for Wire {
    fn send_lossy(&self, _peer: &PeerId, packet: &[u8]) -> Result<(), TransportError> {
        if *self.down.lock() {
            return Err(TransportError::NotConnected);
        }
        self.media.lock().push(packet.to_vec());
        Ok(())
    }
}

impl ControlChannel for Wire {
    fn send_control(&self, _peer: &PeerId, message: &[u8]) -> Result<(), TransportError> {
        self.control.lock().push(message.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Decoded {
    pub kind: MediaKind,
    pub payload: Bytes,
    pub flags: HeaderFlags,
    pub record_timestamp: u64,
}

#[derive(Default)]
pub struct Decoder {
    pub frames: Mutex<Vec<Decoded>>,
}

impl FrameDecoder for Decoder {
    fn on_complete_frame(
        &self,
        _peer: &PeerId,
        kind: MediaKind,
        payload: Bytes,
        flags: HeaderFlags,
        record_timestamp: u64,
    ) {
        self.frames.lock().push(Decoded {
            kind,
            payload,
            flags,
            record_timestamp,
        });
    }
}

impl Decoder {
    pub fn take(&self) -> Vec<Decoded> {
        std::mem::take(&mut *self.frames.lock())
    }
}

pub struct Peer {
    pub call: Arc<Call>,
    /// What this peer has sent, waiting for the other side.
    pub outbox: Arc<Wire>,
    pub decoder: Arc<Decoder>,
    pub losses: Arc<LossCounter>,
}

pub struct Link {
    pub clock: ManualClock,
    pub a: Peer,
    pub b: Peer,
}

fn peer(remote: PeerId, config: &MediaConfig, clock: &ManualClock) -> Peer {
    let outbox = Arc::new(Wire::default());
    let decoder = Arc::new(Decoder::default());
    let losses = Arc::new(LossCounter::new());
    let call = Call::new(
        remote,
        config,
        Collaborators {
            transport: outbox.clone(),
            control: outbox.clone(),
            bandwidth: losses.clone(),
            decoder: decoder.clone(),
            clock: Arc::new(clock.clone()),
        },
    );
    Peer {
        call: Arc::new(call),
        outbox,
        decoder,
        losses,
    }
}

impl Link {
    pub fn new(config: &MediaConfig) -> Self {
        init_tracing();
        let clock = ManualClock::new(100_000);
        let a = peer(PEER_B, config, &clock);
        let b = peer(PEER_A, config, &clock);
        Self { clock, a, b }
    }

    /// Datagrams A has sent and B has not received yet.
    pub fn take_a_to_b(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.a.outbox.media.lock())
    }

    /// Deliver everything A sent, in order. Returns the number delivered.
    pub fn pump_a_to_b(&self) -> Result<usize> {
        let packets = self.take_a_to_b();
        for p in &packets {
            self.b.call.on_packet(p)?;
        }
        Ok(packets.len())
    }

    /// Deliver B's control messages to A.
    pub fn pump_control_b_to_a(&self) -> Result<usize> {
        let messages = std::mem::take(&mut *self.b.outbox.control.lock());
        for m in &messages {
            self.a.call.on_control(m)?;
        }
        Ok(messages.len())
    }
}

/// Deterministic test payload.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed))
        .collect()
}
