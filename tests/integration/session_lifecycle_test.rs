//! Integration tests for the stream lifecycle
//!
//! Liveness, ticker creation, FEC setup and session reclaim, driven through
//! a manual clock. One test binds real loopback sockets.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use media_stream::{
    ManualClock, MediaType, PayloadType, RtpProfile, RtpSession, RtpStats, SessionMode, SessionOptions,
    StreamSession, StreamSessions, StreamState,
};
use media_stream_config::{EngineConfig, PriorityOverrides, TickerPriority};

const T0: u64 = 1_000;

fn init() {
    let _ = media_stream_logging::init_console_logging("session-lifecycle-test", "debug");
}

fn stream(media_type: MediaType, clock: Arc<ManualClock>) -> anyhow::Result<StreamSession> {
    let options = SessionOptions {
        clock,
        ..Default::default()
    };
    let mut stream = StreamSession::new(
        media_type,
        StreamSessions::new(RtpSession::new(SessionMode::SendRecv)),
        options,
    )?;
    stream.set_transport_polling(false);
    Ok(stream)
}

fn rtp_packet(seq: u16) -> Vec<u8> {
    let mut packet = vec![0x80, 0x00];
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&160u32.wrapping_mul(seq as u32).to_be_bytes());
    packet.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
    packet.extend_from_slice(&[0u8; 160]);
    packet
}

#[test]
fn test_alive_before_start() -> anyhow::Result<()> {
    init();
    let clock = Arc::new(ManualClock::new(T0));
    let mut stream = stream(MediaType::Audio, clock.clone())?;

    assert_eq!(stream.state(), StreamState::Idle);
    assert!(stream.alive(0));
    clock.advance(3600);
    assert!(stream.alive(0));
    assert!(stream.alive(10));
    Ok(())
}

#[test]
fn test_not_alive_without_packets() -> anyhow::Result<()> {
    init();
    let clock = Arc::new(ManualClock::new(T0));
    let mut stream = stream(MediaType::Audio, clock.clone())?;
    stream.start()?;

    clock.set(T0 + 10);
    assert!(stream.alive(10));
    clock.set(T0 + 11);
    assert!(!stream.alive(10));
    Ok(())
}

#[test]
fn test_packet_keeps_stream_alive() -> anyhow::Result<()> {
    init();
    let clock = Arc::new(ManualClock::new(T0));
    let mut stream = stream(MediaType::Audio, clock.clone())?;
    stream.start()?;

    clock.set(T0 + 9);
    assert!(stream.rtp_session_mut().unwrap().on_rtp_received(&rtp_packet(1)));

    clock.set(T0 + 11);
    assert!(stream.alive(10));

    // Nothing new since: times out again
    clock.set(T0 + 22);
    assert!(!stream.alive(10));
    Ok(())
}

#[test]
fn test_rtcp_refreshes_liveness() -> anyhow::Result<()> {
    init();
    let clock = Arc::new(ManualClock::new(T0));
    let mut stream = stream(MediaType::Video, clock.clone())?;
    stream.start()?;

    clock.set(T0 + 9);
    let rr = hex::decode("81c90007000011110000222200000000000000640000000a0000000000000000")?;
    stream.process_rtcp(Bytes::from(rr));

    clock.set(T0 + 15);
    assert!(stream.alive(10));
    clock.set(T0 + 20);
    assert!(!stream.alive(10));
    Ok(())
}

#[test]
fn test_ticker_priority_from_overrides() -> anyhow::Result<()> {
    init();
    let options = SessionOptions {
        engine: EngineConfig {
            priorities: PriorityOverrides {
                audio: Some("realtime".to_string()),
                video: Some("not-a-priority".to_string()),
            },
            ..Default::default()
        },
        clock: Arc::new(ManualClock::new(T0)),
        ..Default::default()
    };

    let mut audio = StreamSession::new(
        MediaType::Audio,
        StreamSessions::new(RtpSession::new(SessionMode::SendRecv)),
        options.clone(),
    )?;
    audio.start()?;
    let ticker = audio.ticker().expect("ticker created on start");
    assert_eq!(ticker.name(), "Audio MSTicker");
    assert_eq!(ticker.priority(), TickerPriority::Realtime);

    let mut video = StreamSession::new(
        MediaType::Video,
        StreamSessions::new(RtpSession::new(SessionMode::SendRecv)),
        options,
    )?;
    video.start_ticker()?;
    video.start_ticker()?;
    let ticker = video.ticker().expect("ticker created");
    assert_eq!(ticker.name(), "Video MSTicker");
    assert_eq!(ticker.priority(), TickerPriority::default_for(true));
    Ok(())
}

fn fec_profile(fmtp: &str) -> RtpProfile {
    let mut profile = RtpProfile::new("RTP/AVP");
    profile.set_payload(PayloadType::new(96, "VP8", 90_000));
    profile.set_payload(PayloadType::new(120, "flexfec", 90_000).with_recv_fmtp(fmtp));
    profile
}

#[test]
fn test_handle_fec_sets_up_bundle_once() -> anyhow::Result<()> {
    init();
    let clock = Arc::new(ManualClock::new(T0));
    let mut stream = stream(MediaType::Video, clock)?;
    let profile = fec_profile("repair-window=50000;L=4;D=2");

    stream.handle_fec(&profile)?;

    let rtp = stream.rtp_session().unwrap();
    assert_eq!(rtp.jitter_compensation(), 200);
    let fec = stream.fec_session().expect("FEC session created");
    assert_eq!(fec.payload_type(), 120);
    assert!(fec.avpf_tmmbr_enabled());
    assert!(fec.is_bundled_secondary());
    let bundle = &rtp.bundle().expect("primary joined a bundle").bundle;
    assert_eq!(bundle.primary_session(), Some(rtp.id()));
    assert_eq!(bundle.fec_session_of(rtp.id()), Some(fec.id()));

    let fec_stream = stream.fec_stream().expect("FEC stream created");
    assert!(fec_stream.is_initialized());
    let params = fec_stream.params();
    assert_eq!((params.repair_window, params.l, params.d), (50_000, 4, 2));

    let fec_id = fec.id();
    stream.handle_fec(&fec_profile("L=20"))?;
    assert_eq!(stream.fec_session().unwrap().id(), fec_id);
    assert_eq!(stream.fec_stream().unwrap().params().l, 4);
    Ok(())
}

#[test]
fn test_handle_fec_without_flexfec() -> anyhow::Result<()> {
    init();
    let clock = Arc::new(ManualClock::new(T0));
    let mut stream = stream(MediaType::Audio, clock)?;
    let before = stream.rtp_session().unwrap().jitter_compensation();

    let mut profile = RtpProfile::new("RTP/AVP");
    profile.set_payload(PayloadType::new(0, "PCMU", 8_000));
    stream.handle_fec(&profile)?;

    assert!(stream.fec_session().is_none());
    assert_eq!(stream.rtp_session().unwrap().jitter_compensation(), before);
    Ok(())
}

#[test]
fn test_reclaim_moves_sessions_out() -> anyhow::Result<()> {
    init();
    let clock = Arc::new(ManualClock::new(T0));
    let mut stream = stream(MediaType::Video, clock.clone())?;
    stream.handle_fec(&fec_profile("L=5"))?;
    stream.start()?;
    let rtp_id = stream.rtp_session().unwrap().id();

    let reclaimed = stream.reclaim_sessions();
    assert_eq!(reclaimed.rtp_session.as_ref().map(|s| s.id()), Some(rtp_id));
    assert!(reclaimed.fec_session.is_some());
    assert!(reclaimed.ticker.is_some());

    assert!(stream.rtp_session().is_none());
    assert!(stream.ticker().is_none());
    assert_eq!(stream.local_rtp_stats(), RtpStats::default());
    assert_eq!(stream.send_ssrc(), 0);
    assert!(stream.set_dscp(46).is_err());
    drop(stream);

    // The sessions outlive the stream and can be handed to a new one
    let next = StreamSession::new(
        MediaType::Video,
        reclaimed,
        SessionOptions {
            clock,
            ..Default::default()
        },
    )?;
    assert_eq!(next.rtp_session().unwrap().id(), rtp_id);
    assert!(next.ticker().is_some());
    Ok(())
}

#[test]
fn test_duplex_transport_receives_rtp() -> anyhow::Result<()> {
    init();
    let clock = Arc::new(ManualClock::new(T0));
    let mut stream = StreamSession::with_duplex_transport(
        MediaType::Audio,
        Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        0,
        0,
        SessionOptions {
            clock: clock.clone(),
            ..Default::default()
        },
    )?;
    stream.start()?;

    let local = stream.rtp_session().unwrap().local_rtp_addr().expect("bound");
    let peer = UdpSocket::bind("127.0.0.1:0")?;
    peer.send_to(&rtp_packet(1), local)?;
    peer.send_to(&rtp_packet(2), local)?;

    for _ in 0..100 {
        stream.iterate();
        if stream.local_rtp_stats().packet_recv >= 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(stream.local_rtp_stats().packet_recv, 2);
    assert_eq!(stream.recv_ssrc(), 0xCAFE_BABE);
    assert_eq!(stream.rtp_session().unwrap().remote_rtp_addr(), Some(peer.local_addr()?));

    clock.set(T0 + 30);
    assert!(stream.alive(60));
    Ok(())
}
