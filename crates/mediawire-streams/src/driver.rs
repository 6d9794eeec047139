//! Async drivers: the playout loop that ticks a call's streams, and the
//! receive loop that feeds inbound datagrams into the registry.
//!
//! Both run until a broadcast shutdown signal. On shutdown the playout
//! loop drains the call so no frame outlives it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mediawire_core::config::PlayoutConfig;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::call::{Call, CallRegistry};
use crate::frame::PeerId;

/// A datagram handed over by the transport's receive path.
#[derive(Debug, Clone)]
pub enum Inbound {
    Media { peer: PeerId, packet: Bytes },
    Control { peer: PeerId, message: Bytes },
}

pub struct PlayoutDriver {
    call: Arc<Call>,
    audio_interval: Duration,
    video_interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl PlayoutDriver {
    pub fn new(call: Arc<Call>, config: &PlayoutConfig, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            call,
            audio_interval: Duration::from_millis(config.audio_interval_ms.max(1)),
            video_interval: Duration::from_millis(config.video_interval_ms.max(1)),
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut audio = tokio::time::interval(self.audio_interval);
        let mut video = tokio::time::interval(self.video_interval);
        audio.set_missed_tick_behavior(MissedTickBehavior::Skip);
        video.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    let drained = self.call.end();
                    tracing::info!(
                        peer = hex::encode(&self.call.peer()[..8]),
                        drained,
                        "playout loop shutting down"
                    );
                    return Ok(());
                }

                _ = audio.tick() => {
                    // Drain whatever audio piled up since the last tick.
                    while self.call.iterate_audio() {}
                }

                _ = video.tick() => {
                    self.call.iterate_video();
                }
            }
        }
    }
}

/// Spawn the playout loop for `call` on the current runtime.
pub fn spawn_playout(
    call: Arc<Call>,
    config: &PlayoutConfig,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(PlayoutDriver::new(call, config, shutdown).run())
}

/// Route inbound datagrams to their calls until shutdown or until the
/// transport closes its end of the channel.
pub async fn receive_loop(
    registry: Arc<CallRegistry>,
    mut inbound: mpsc::Receiver<Inbound>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("receive loop shutting down");
                return Ok(());
            }

            item = inbound.recv() => {
                let Some(item) = item else {
                    tracing::info!("transport closed, receive loop exiting");
                    return Ok(());
                };
                let result = match &item {
                    Inbound::Media { peer, packet } => registry.on_packet(peer, packet).map(|_| ()),
                    Inbound::Control { peer, message } => registry.on_control(peer, message).map(|_| ()),
                };
                if let Err(e) = result {
                    tracing::debug!(error = %e, "inbound datagram dropped");
                }
            }
        }
    }
}
