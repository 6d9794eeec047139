use crate::*;
use mediawire_core::wire::MediaKind;

/// A 5000 byte keyframe in 1200 byte fragments, delivered in reverse,
/// plays back byte for byte.
#[test]
fn test_keyframe_reassembled_from_reverse_order() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    let frame = pattern(5000, 3);
    let captured = link.clock.now_ms();

    link.a.call.send_video_frame(&frame, true, captured, Some(1200))?;
    let mut packets = link.take_a_to_b();
    assert_eq!(packets.len(), 5);
    packets.reverse();
    for p in &packets {
        link.b.call.on_packet(p)?;
    }

    // Default buffering holds frames back 200 ms.
    link.clock.advance(200);
    assert!(link.b.call.iterate_video());

    let decoded = link.b.decoder.take();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].kind, MediaKind::Video);
    assert_eq!(&decoded[0].payload[..], &frame[..]);
    assert!(decoded[0].flags.contains(HeaderFlags::KEY_FRAME));
    assert_eq!(decoded[0].record_timestamp, captured);
    Ok(())
}

/// Two frames in flight at once, their fragments interleaved and scrambled
/// on the way, both play back byte for byte and in order.
#[test]
fn test_interleaved_frames_reassembled_from_scrambled_order() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    let first = pattern(5000, 5);
    let second = pattern(3000, 6);

    link.a.call.send_video_frame(&first, true, link.clock.now_ms(), Some(700))?;
    link.clock.advance(33);
    link.a.call.send_video_frame(&second, false, link.clock.now_ms(), Some(700))?;
    let packets = link.take_a_to_b();
    assert_eq!(packets.len(), 8 + 5);

    // Stride 5 over 13 packets visits each once and mixes the two frames.
    for i in 0..packets.len() {
        link.b.call.on_packet(&packets[(i * 5) % packets.len()])?;
    }

    for _ in 0..30 {
        link.b.call.iterate_video();
        link.clock.advance(10);
    }

    let decoded = link.b.decoder.take();
    assert_eq!(decoded.len(), 2);
    assert_eq!(&decoded[0].payload[..], &first[..]);
    assert_eq!(&decoded[1].payload[..], &second[..]);
    assert!(decoded[0].flags.contains(HeaderFlags::KEY_FRAME));
    Ok(())
}

#[test]
fn test_audio_plays_in_arrival_order() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    for i in 0..3u8 {
        link.a.call.send_audio_frame(&[i; 40], link.clock.now_ms())?;
        link.clock.advance(20);
    }
    assert_eq!(link.pump_a_to_b()?, 3);

    while link.b.call.iterate_audio() {}
    let decoded = link.b.decoder.take();
    let firsts: Vec<u8> = decoded.iter().map(|d| d.payload[0]).collect();
    assert_eq!(firsts, vec![0, 1, 2]);
    assert!(decoded.iter().all(|d| d.kind == MediaKind::Audio));
    Ok(())
}

/// 30 fps video, playout ticking every 10 ms: every frame plays, in order.
#[test]
fn test_video_stream_plays_every_frame_in_order() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    let frames = 20;

    for n in 0..frames {
        let keyframe = n == 0;
        let payload = pattern(3000, n as u8);
        link.a.call.send_video_frame(&payload, keyframe, link.clock.now_ms(), None)?;
        link.pump_a_to_b()?;
        for _ in 0..3 {
            link.b.call.iterate_video();
            link.clock.advance(11);
        }
    }
    for _ in 0..40 {
        link.b.call.iterate_video();
        link.clock.advance(10);
    }

    let decoded = link.b.decoder.take();
    assert_eq!(decoded.len(), frames);
    for (n, d) in decoded.iter().enumerate() {
        assert_eq!(d.payload[0], pattern(1, n as u8)[0]);
    }
    assert!(decoded
        .windows(2)
        .all(|w| w[0].record_timestamp < w[1].record_timestamp));

    let stats = link.b.call.stats();
    assert_eq!(stats.video_receive.receive.frames_played, frames as u64);
    assert_eq!(stats.video_receive.receive.skipped_entries, 0);
    assert_eq!(link.b.losses.snapshot().lost_bytes, 0);
    Ok(())
}

/// A version-2 sender's packets carry one whole frame each.
#[test]
fn test_legacy_sender_is_accepted() -> Result<()> {
    use mediawire_core::wire::{encode_packet, WireHeader, LEGACY_PROTOCOL_VERSION};

    let link = Link::new(&MediaConfig::default());
    let header = WireHeader {
        version: LEGACY_PROTOCOL_VERSION,
        payload_type: MediaKind::Audio.payload_type(),
        sequence_number: 1,
        timestamp: 5,
        legacy_length: 6,
        ..WireHeader::default()
    };
    let mut packet = Vec::new();
    encode_packet(MediaKind::Audio, &header, b"legacy", &mut packet);

    link.b.call.on_packet(&packet)?;
    assert!(link.b.call.iterate_audio());
    let decoded = link.b.decoder.take();
    assert_eq!(&decoded[0].payload[..], b"legacy");
    assert_eq!(decoded[0].record_timestamp, 5);
    Ok(())
}
