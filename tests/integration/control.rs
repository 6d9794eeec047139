use crate::*;
use mediawire_streams::{ClockSample, ReceiveError};

#[test]
fn test_h264_capability_reaches_the_sender() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    link.b.call.announce_h264_decoder()?;
    assert_eq!(link.pump_control_b_to_a()?, 1);
    assert!(link.a.call.remote_hints().h264_decoder);

    // The sender switches encoders and marks its frames.
    link.a.call.set_video_encoder(true, 1_500);
    link.a.call.send_video_frame(b"h264 frame", true, link.clock.now_ms(), None)?;
    link.pump_a_to_b()?;
    link.clock.advance(200);
    assert!(link.b.call.iterate_video());
    let decoded = link.b.decoder.take();
    assert!(decoded[0].flags.contains(HeaderFlags::ENCODER_IS_H264));
    Ok(())
}

#[test]
fn test_malformed_control_is_rejected() {
    let link = Link::new(&MediaConfig::default());
    let err = link.a.call.on_control(&[172]).unwrap_err();
    assert!(matches!(err, ReceiveError::Wire(_)));
    assert_eq!(link.a.call.remote_hints(), Default::default());
}

/// The receiver learns the sender's clock is 5 s ahead and schedules
/// against the sender's timeline.
#[test]
fn test_clock_offset_aligns_playout() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    let now = link.clock.now_ms();
    link.b.call.on_clock_sample(ClockSample {
        local_sent_ms: now,
        remote_ms: now + 5_000 + 10,
        local_received_ms: now + 20,
    });
    link.clock.advance(20);

    // Captured on the sender's clock.
    let sender_now = link.clock.now_ms() + 5_000;
    link.a.call.send_video_frame(b"ahead", true, sender_now, None)?;
    link.pump_a_to_b()?;

    // Burn through the startup grace so the narrow window applies.
    for _ in 0..40 {
        link.b.call.iterate_video();
    }
    let _ = link.b.decoder.take();
    link.a.call.send_video_frame(b"steady", false, sender_now + 100, None)?;
    link.pump_a_to_b()?;
    link.clock.advance(100);
    let mut played = false;
    for _ in 0..30 {
        played |= link.b.call.iterate_video();
        link.clock.advance(10);
    }
    assert!(played);
    let decoded = link.b.decoder.take();
    assert_eq!(&decoded[0].payload[..], b"steady");

    let stats = link.b.call.stats();
    assert_eq!(stats.clock_offset_ms, Some(5_000));
    assert_eq!(stats.rtt_ms, Some(20));
    Ok(())
}

#[test]
fn test_stats_serialize_for_status_output() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    link.a.call.send_audio_frame(b"hello", link.clock.now_ms())?;
    link.pump_a_to_b()?;

    let json = serde_json::to_value(link.b.call.stats())?;
    assert_eq!(json["audio_receive"]["receive"]["packets"], 1);
    assert_eq!(json["peer"], serde_json::Value::String("aa".repeat(32)));
    Ok(())
}

#[test]
fn test_config_file_tunes_the_call() -> Result<()> {
    let config = MediaConfig::from_toml(
        "[reassembly]\nslots = 1\n\n[control]\nlower_rate_step = 4\n",
    )?;
    config.validate()?;
    let link = Link::new(&config);

    link.a.call.send_video_frame(&pattern(2000, 0), false, link.clock.now_ms(), Some(1000))?;
    link.b.call.on_packet(&link.take_a_to_b()[0])?;
    link.a.call.send_video_frame(&pattern(2000, 1), false, link.clock.now_ms(), Some(1000))?;
    link.b.call.on_packet(&link.take_a_to_b()[0])?;
    // One slot: the second frame pushed the first out.
    assert_eq!(link.b.call.stats().video_receive.reassembly.partial_flushed, 1);

    link.clock.advance(20_000);
    link.b.call.iterate_video();
    let control = std::mem::take(&mut *link.b.outbox.control.lock());
    assert_eq!(control, vec![vec![172, 2, 4]]);
    Ok(())
}
