use crate::*;
use mediawire_core::control::ControlMessage;
use mediawire_streams::{DropReason, FragmentOutcome, SendError};

fn two_slots() -> MediaConfig {
    let mut config = MediaConfig::default();
    config.reassembly.slots = 2;
    config
}

/// With every slot busy, a half-received keyframe in the oldest slot keeps
/// its place against newer delta frames and still completes.
#[test]
fn test_keyframe_survives_slot_pressure() -> Result<()> {
    let link = Link::new(&two_slots());
    let keyframe = pattern(5000, 1);

    link.a.call.send_video_frame(&keyframe, true, link.clock.now_ms(), Some(1200))?;
    let key_packets = link.take_a_to_b();
    for p in &key_packets[..2] {
        link.b.call.on_packet(p)?;
    }

    let mut delta_heads = Vec::new();
    for n in 0..3 {
        link.clock.advance(33);
        link.a.call.send_video_frame(&pattern(2000, n), false, link.clock.now_ms(), Some(1000))?;
        delta_heads.push(link.take_a_to_b().remove(0));
    }

    // The first delta frame takes the free slot, the next two bounce.
    assert_eq!(link.b.call.on_packet(&delta_heads[0])?, FragmentOutcome::Buffered);
    for head in &delta_heads[1..] {
        assert_eq!(
            link.b.call.on_packet(head)?,
            FragmentOutcome::Dropped(DropReason::KeyframeProtected)
        );
    }

    let mut outcome = FragmentOutcome::Buffered;
    for p in &key_packets[2..] {
        outcome = link.b.call.on_packet(p)?;
    }
    assert_eq!(outcome, FragmentOutcome::Completed);

    link.clock.advance(200);
    assert!(link.b.call.iterate_video());
    let decoded = link.b.decoder.take();
    assert_eq!(&decoded[0].payload[..], &keyframe[..]);

    let stats = link.b.call.stats();
    assert_eq!(stats.video_receive.reassembly.dropped_keyframe_protected, 2);
    assert_eq!(link.b.losses.snapshot().lost_bytes, 2000);
    Ok(())
}

/// An arriving keyframe is admitted even when the oldest slot holds one.
#[test]
fn test_new_keyframe_evicts_old_keyframe() -> Result<()> {
    let mut config = MediaConfig::default();
    config.reassembly.slots = 1;
    let link = Link::new(&config);

    link.a.call.send_video_frame(&pattern(3000, 0), true, link.clock.now_ms(), Some(1000))?;
    let first = link.take_a_to_b();
    link.b.call.on_packet(&first[0])?;

    link.clock.advance(10);
    link.a.call.send_video_frame(&pattern(3000, 1), true, link.clock.now_ms(), Some(1000))?;
    let second = link.take_a_to_b();
    assert_eq!(link.b.call.on_packet(&second[0])?, FragmentOutcome::Buffered);

    // The evicted keyframe went downstream partial, so B asks for another.
    assert_eq!(link.pump_control_b_to_a()?, 1);
    assert!(link.a.call.remote_hints().keyframe_requested);
    assert_eq!(link.b.losses.snapshot().partial_bytes, 2000);

    // Answering with a keyframe clears the request.
    link.a.call.send_video_frame(&pattern(100, 2), true, link.clock.now_ms(), None)?;
    assert!(!link.a.call.remote_hints().keyframe_requested);
    Ok(())
}

/// A receiver that falls far behind discards stale frames and asks the
/// sender to slow down, at most once per interval.
#[test]
fn test_stalled_receiver_requests_lower_frame_rate() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    for n in 0..5 {
        link.a.call.send_video_frame(&pattern(500, n), n == 0, link.clock.now_ms(), None)?;
        link.clock.advance(33);
    }
    link.pump_a_to_b()?;

    // Well past the startup grace window.
    link.clock.advance(10_000);
    assert!(!link.b.call.iterate_video());
    assert!(!link.b.call.iterate_video());

    let control = std::mem::take(&mut *link.b.outbox.control.lock());
    assert_eq!(control, vec![ControlMessage::LowerFrameRate { step: 1 }.encode()]);
    for m in &control {
        link.a.call.on_control(m)?;
    }
    assert_eq!(link.a.call.remote_hints().frame_rate_reduction, 1);

    let stats = link.b.call.stats();
    assert_eq!(stats.video_receive.receive.skipped_entries, 5);
    assert_eq!(stats.video_receive.receive.lower_rate_requests, 1);
    assert_eq!(link.b.losses.snapshot().lost_bytes, 5 * 500);
    Ok(())
}

/// Dropping a fragment of every frame yields partial frames and loss
/// reports, never an error.
#[test]
fn test_fragment_loss_degrades_gracefully() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    for n in 0..10 {
        link.a.call.send_video_frame(&pattern(4000, n), false, link.clock.now_ms(), Some(1000))?;
        let mut packets = link.take_a_to_b();
        packets.remove(1);
        for p in &packets {
            assert_eq!(link.b.call.on_packet(p)?, FragmentOutcome::Buffered);
        }
        link.clock.advance(33);
    }

    let stats = link.b.call.stats().video_receive;
    // Five slots in flight; the other five were flushed partial.
    assert_eq!(stats.in_flight, 5);
    assert_eq!(stats.reassembly.partial_flushed, 5);
    assert_eq!(link.b.losses.snapshot().partial_bytes, 5 * 1000);
    Ok(())
}

#[test]
fn test_send_failures_are_counted_not_fatal() -> Result<()> {
    let link = Link::new(&MediaConfig::default());
    *link.a.outbox.down.lock() = true;
    let err = link
        .a
        .call
        .send_video_frame(&pattern(3000, 0), true, 0, Some(1000))
        .unwrap_err();
    assert!(matches!(err, SendError::Partial { failed: 3, total: 3, .. }));

    *link.a.outbox.down.lock() = false;
    link.a.call.send_video_frame(&pattern(3000, 1), true, 0, Some(1000))?;

    let sent = link.a.call.stats().video_send;
    assert_eq!(sent.frames_sent, 2);
    assert_eq!(sent.fragments_failed, 3);
    assert_eq!(sent.fragments_sent, 3);
    assert_eq!(link.pump_a_to_b()?, 3);
    Ok(())
}
