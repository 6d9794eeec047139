use crate::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use mediawire_streams::driver::{receive_loop, spawn_playout, Inbound};
use mediawire_streams::CallRegistry;
use tokio::sync::{broadcast, mpsc};

/// Network thread writes while the playout thread reads. Every frame is
/// either played, in order, or accounted for as evicted.
#[test]
fn test_producer_and_consumer_threads() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    let total = 300usize;
    for n in 0..total {
        link.a.call.send_audio_frame(&(n as u32).to_be_bytes(), 0)?;
    }
    let packets = link.take_a_to_b();
    assert_eq!(packets.len(), total);

    let done = AtomicBool::new(false);
    let call = &link.b.call;
    thread::scope(|s| {
        s.spawn(|| {
            for p in &packets {
                call.on_packet(p).expect("valid packet");
                if p[4] % 16 == 0 {
                    thread::yield_now();
                }
            }
            done.store(true, Ordering::SeqCst);
        });
        s.spawn(|| loop {
            let finished = done.load(Ordering::SeqCst);
            while call.iterate_audio() {}
            if finished {
                break;
            }
            thread::sleep(Duration::from_micros(50));
        });
    });

    let played: Vec<u32> = link
        .b
        .decoder
        .take()
        .iter()
        .map(|d| u32::from_be_bytes([d.payload[0], d.payload[1], d.payload[2], d.payload[3]]))
        .collect();
    assert!(played.windows(2).all(|w| w[0] < w[1]));

    let evicted = link.b.call.stats().audio_receive.receive.evicted_entries;
    assert_eq!(played.len() as u64 + evicted, total as u64);
    Ok(())
}

/// The async receive loop and playout driver, end to end, then shutdown.
#[tokio::test]
async fn test_async_drivers_deliver_and_drain() -> Result<()> {
    init_tracing();
    let config = MediaConfig::default();
    let clock = ManualClock::new(50_000);

    let a_outbox = Arc::new(Wire::default());
    let b_decoder = Arc::new(Decoder::default());
    let registry = Arc::new(CallRegistry::new());

    let sender = Call::new(
        PEER_B,
        &config,
        Collaborators {
            transport: a_outbox.clone(),
            control: a_outbox.clone(),
            bandwidth: Arc::new(LossCounter::new()),
            decoder: Arc::new(Decoder::default()),
            clock: Arc::new(clock.clone()),
        },
    );
    let b_outbox = Arc::new(Wire::default());
    let receiver = registry.start(
        PEER_A,
        &config,
        Collaborators {
            transport: b_outbox.clone(),
            control: b_outbox,
            bandwidth: Arc::new(LossCounter::new()),
            decoder: b_decoder.clone(),
            clock: Arc::new(clock.clone()),
        },
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let rx_task = tokio::spawn(receive_loop(registry.clone(), inbound_rx, shutdown_tx.subscribe()));
    let player = spawn_playout(receiver.clone(), &config.playout, shutdown_tx.subscribe());

    // Frames captured 200 ms in the past play as soon as they land.
    for n in 0..5u8 {
        sender.send_audio_frame(&[n; 60], 0)?;
        sender.send_video_frame(&pattern(2500, n), n == 0, clock.now_ms() - 200, None)?;
        clock.advance(33);
        let packets = std::mem::take(&mut *a_outbox.media.lock());
        for packet in packets {
            inbound_tx
                .send(Inbound::Media {
                    peer: PEER_A,
                    packet: Bytes::from(packet),
                })
                .await?;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while b_decoder.frames.lock().len() < 10 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let decoded = b_decoder.take();
    assert_eq!(decoded.iter().filter(|d| d.kind == MediaKind::Audio).count(), 5);
    assert_eq!(decoded.iter().filter(|d| d.kind == MediaKind::Video).count(), 5);

    shutdown_tx.send(())?;
    player.await??;
    rx_task.await??;
    assert_eq!(receiver.stats().video_receive.buffered, 0);
    assert_eq!(registry.len(), 1);
    Ok(())
}
