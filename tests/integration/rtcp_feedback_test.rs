//! Integration tests for RTCP feedback handling
//!
//! TMMBR limits reaching the encoder, compound packets with a damaged tail
//! and events posted from other threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use media_stream::{
    Encoder, ManualClock, MediaType, PayloadType, RtcpPacket, RtcpPacketType, RtpProfile,
    RtpSession, SessionMode, SessionOptions, StreamEvent, StreamResult, StreamSession,
    StreamSessions, TransportFeedback,
};
use parking_lot::Mutex;

const T0: u64 = 500;

/// Receiver report with one block: SSRC 0x1111 reporting on 0x2222
const RR_FIXTURE: &str = "81c90007000011110000222200000000000000640000000a0000000000000000";

fn init() {
    let _ = media_stream_logging::init_console_logging("rtcp-feedback-test", "debug");
}

#[derive(Clone, Default)]
struct SharedEncoder {
    bitrates: Arc<Mutex<Vec<i32>>>,
}

impl Encoder for SharedEncoder {
    fn name(&self) -> &str {
        "opus"
    }

    fn set_bitrate(&mut self, bitrate: i32) -> StreamResult<()> {
        self.bitrates.lock().push(bitrate);
        Ok(())
    }
}

fn audio_stream(clock: Arc<ManualClock>) -> anyhow::Result<(StreamSession, SharedEncoder)> {
    let mut stream = StreamSession::new(
        MediaType::Audio,
        StreamSessions::new(RtpSession::new(SessionMode::SendRecv)),
        SessionOptions {
            clock,
            ..Default::default()
        },
    )?;
    stream.set_transport_polling(false);
    let encoder = SharedEncoder::default();
    stream.set_encoder(Box::new(encoder.clone()));
    Ok((stream, encoder))
}

#[test]
fn test_tmmbr_capped_and_deduplicated() -> anyhow::Result<()> {
    init();
    let (mut stream, encoder) = audio_stream(Arc::new(ManualClock::new(T0)))?;
    stream.set_max_network_bitrate(300_000);

    assert_eq!(stream.process_tmmbr(500_000), Some(300_000));
    assert_eq!(stream.process_tmmbr(500_000), None);
    assert_eq!(*encoder.bitrates.lock(), vec![300_000]);

    let state = stream.bitrate_state();
    assert_eq!(state.target_bitrate, 300_000);
    assert_eq!(state.last_applied_limit, Some(300_000));
    assert_eq!(stream.rtp_session().unwrap().target_upload_bandwidth(), 300_000);

    // A lower limit goes through
    assert_eq!(stream.process_tmmbr(64_000), Some(64_000));
    assert_eq!(*encoder.bitrates.lock(), vec![300_000, 64_000]);
    Ok(())
}

#[test]
fn test_tmmbr_without_encoder() -> anyhow::Result<()> {
    init();
    let mut stream = StreamSession::new(
        MediaType::Audio,
        StreamSessions::new(RtpSession::new(SessionMode::SendRecv)),
        SessionOptions {
            clock: Arc::new(ManualClock::new(T0)),
            ..Default::default()
        },
    )?;

    assert_eq!(stream.process_tmmbr(100_000), None);
    assert_eq!(stream.bitrate_state().last_applied_limit, None);
    Ok(())
}

#[test]
fn test_tmmbr_audio_duplicate_correction() -> anyhow::Result<()> {
    init();
    let (mut stream, encoder) = audio_stream(Arc::new(ManualClock::new(T0)))?;
    stream.rtp_session_mut().unwrap().enable_audio_bandwidth_estimator(4);

    assert_eq!(stream.process_tmmbr(100_000), Some(75_000));
    assert_eq!(*encoder.bitrates.lock(), vec![75_000]);
    Ok(())
}

#[test]
fn test_tmmbr_unchanged_by_fec() -> anyhow::Result<()> {
    init();
    let (mut stream, encoder) = audio_stream(Arc::new(ManualClock::new(T0)))?;
    let mut profile = RtpProfile::new("RTP/AVP");
    profile.set_payload(PayloadType::new(111, "opus", 48_000));
    profile.set_payload(PayloadType::new(120, "flexfec", 48_000).with_recv_fmtp("L=4"));
    stream.handle_fec(&profile)?;
    assert!(stream.fec_stream().is_some());

    assert_eq!(stream.process_tmmbr(125_000), Some(125_000));
    assert_eq!(*encoder.bitrates.lock(), vec![125_000]);
    Ok(())
}

#[test]
fn test_tmmbr_default_fec_and_duplicates() -> anyhow::Result<()> {
    init();
    let (mut stream, encoder) = audio_stream(Arc::new(ManualClock::new(T0)))?;
    let mut profile = RtpProfile::new("RTP/AVP");
    profile.set_payload(PayloadType::new(120, "flexfec", 48_000));
    stream.handle_fec(&profile)?;
    assert_eq!(stream.process_tmmbr(500_000), Some(500_000));

    // Only the duplicate correction applies
    stream.rtp_session_mut().unwrap().enable_audio_bandwidth_estimator(4);
    assert_eq!(stream.process_tmmbr(400_000), Some(300_000));
    assert_eq!(*encoder.bitrates.lock(), vec![500_000, 300_000]);
    Ok(())
}

#[test]
fn test_tmmbr_through_compound_rtcp() -> anyhow::Result<()> {
    init();
    let (mut stream, encoder) = audio_stream(Arc::new(ManualClock::new(T0)))?;
    stream.start()?;

    let mut compound = hex::decode(RR_FIXTURE)?;
    compound.extend_from_slice(&TransportFeedback::tmmbr(0x2222, 0x1111, 256_000).serialize());
    stream.process_rtcp(Bytes::from(compound));

    assert_eq!(*encoder.bitrates.lock(), vec![256_000]);
    assert_eq!(stream.bitrate_state().last_applied_limit, Some(256_000));
    Ok(())
}

#[test]
fn test_damaged_tail_keeps_valid_sub_packets() -> anyhow::Result<()> {
    init();
    let clock = Arc::new(ManualClock::new(T0));
    let (mut stream, _) = audio_stream(clock.clone())?;
    stream.start()?;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    stream.connect_rtcp_handler(
        RtcpPacketType::ReceiverReport,
        Box::new(move |packet: &RtcpPacket| {
            if let RtcpPacket::ReceiverReport(rr) = packet {
                assert_eq!(rr.ssrc, 0x1111);
                assert_eq!(rr.reception_reports.len(), 1);
                assert_eq!(rr.reception_reports[0].ssrc, 0x2222);
            }
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let mut data = hex::decode(RR_FIXTURE)?;
    data.extend_from_slice(&[0x81, 0xC9, 0x00, 0x07, 0xde, 0xad]);

    clock.set(T0 + 9);
    stream.process_rtcp(Bytes::from(data));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    // RTCP alone refreshes liveness
    clock.set(T0 + 15);
    assert!(stream.alive(10));
    Ok(())
}

#[test]
fn test_disconnected_handler_not_called() -> anyhow::Result<()> {
    init();
    let (mut stream, _) = audio_stream(Arc::new(ManualClock::new(T0)))?;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let token = stream.connect_rtcp_handler(
        RtcpPacketType::ReceiverReport,
        Box::new(move |_: &RtcpPacket| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    stream.process_rtcp(Bytes::from(hex::decode(RR_FIXTURE)?));
    assert!(stream.disconnect_rtcp_handler(token));
    assert!(!stream.disconnect_rtcp_handler(token));
    stream.process_rtcp(Bytes::from(hex::decode(RR_FIXTURE)?));

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_events_posted_from_another_thread() -> anyhow::Result<()> {
    init();
    let (mut stream, encoder) = audio_stream(Arc::new(ManualClock::new(T0)))?;
    stream.start()?;

    let sender = stream.event_sender();
    let tmmbr = TransportFeedback::tmmbr(0x2222, 0x1111, 96_000).serialize().freeze();
    let poster = std::thread::spawn(move || {
        assert!(sender.post(StreamEvent::Unknown(42)));
        assert!(sender.post(StreamEvent::RtcpReceived(tmmbr)));
    });
    poster.join().expect("poster thread panicked");

    // Nothing happens until the stream ticks
    assert!(encoder.bitrates.lock().is_empty());
    stream.iterate();
    assert_eq!(*encoder.bitrates.lock(), vec![96_000]);
    Ok(())
}

#[test]
fn test_events_dropped_after_stream_is_gone() -> anyhow::Result<()> {
    init();
    let (stream, _) = audio_stream(Arc::new(ManualClock::new(T0)))?;
    let sender = stream.event_sender();
    drop(stream);

    assert!(!sender.post(StreamEvent::RtcpEmitted));
    Ok(())
}
