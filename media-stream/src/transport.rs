//! RTP transport session
//!
//! A duplex UDP session carrying RTP and RTCP. Sockets are non-blocking and
//! polled from the tick thread; received RTCP and STUN are posted to the owning
//! stream's event queue, RTP is only accounted for.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use media_stream_config::EngineConfig;

use crate::error::{StreamError, StreamResult};
use crate::events::{EventSender, StreamEvent};
use crate::profile::RtpProfile;
use crate::rtcp::{ReceiverReport, ReceptionReport};

/// RTP header size without CSRCs
const RTP_HEADER_SIZE: usize = 12;

/// Default jitter buffer compensation (ms)
const DEFAULT_JITTER_COMPENSATION_MS: u32 = 60;

/// Default AVPF regular RTCP interval (ms)
const DEFAULT_AVPF_RR_INTERVAL_MS: u16 = 5000;

/// Datagrams read from one socket per poll; the rest wait for the next tick
pub const MAX_DATAGRAMS_PER_POLL: usize = 64;

/// Direction(s) a session is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Send only
    SendOnly,
    /// Receive only
    RecvOnly,
    /// Send and receive
    SendRecv,
}

/// Packet counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpStats {
    /// RTP packets sent
    pub packet_sent: u64,
    /// RTP bytes sent (header included)
    pub bytes_sent: u64,
    /// RTP packets received
    pub packet_recv: u64,
    /// RTP bytes received (header included)
    pub bytes_recv: u64,
    /// Cumulative packets lost, from sequence gaps
    pub cum_packet_loss: i64,
    /// Packets received more than once
    pub duplicated: u64,
}

/// Interarrival jitter and buffer state
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JitterStats {
    /// Interarrival jitter (RFC 3550), timestamp units
    pub jitter: u32,
    /// Largest jitter observed
    pub max_jitter: u32,
    /// Current jitter buffer size (ms)
    pub jitter_buffer_size_ms: u32,
}

/// Receiver-side duplicate packet estimator used for redundant audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioBandwidthEstimator {
    /// One packet in `duplicate_rate` is a duplicate
    pub duplicate_rate: u64,
}

/// Sliding one-second throughput meter
#[derive(Debug, Clone, Copy)]
struct BandwidthMeter {
    bytes: u64,
    window_start: Instant,
    bps: f32,
}

impl BandwidthMeter {
    fn new(now: Instant) -> Self {
        BandwidthMeter {
            bytes: 0,
            window_start: now,
            bps: 0.0,
        }
    }

    fn add(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
    }

    fn sample(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= Duration::from_secs(1) {
            self.bps = (self.bytes as f64 * 8.0 / elapsed.as_secs_f64()) as f32;
            self.bytes = 0;
            self.window_start = now;
        }
    }
}

/// Sequence and jitter tracking for the current remote source
#[derive(Debug, Clone, Copy, Default)]
struct ReceptionTracker {
    base_seq: u32,
    max_seq: u32,
    cycles: u32,
    received: u64,
    last_transit: Option<i64>,
    jitter: f64,
    started: bool,
    last_sr: u32,
    last_sr_arrival: Option<Instant>,
}

impl ReceptionTracker {
    fn extended_max(&self) -> u32 {
        self.cycles.wrapping_add(self.max_seq)
    }

    fn expected(&self) -> i64 {
        if !self.started {
            return 0;
        }
        self.extended_max() as i64 - self.base_seq as i64 + 1
    }

    fn lost(&self) -> i64 {
        self.expected() - self.received as i64
    }

    /// Returns false for a duplicate
    fn on_sequence(&mut self, seq: u16) -> bool {
        let seq = seq as u32;
        if !self.started {
            self.started = true;
            self.base_seq = seq;
            self.max_seq = seq;
            self.received = 1;
            return true;
        }
        let delta = seq.wrapping_sub(self.max_seq) & 0xFFFF;
        if delta == 0 {
            return false;
        }
        if delta < 0x8000 {
            if seq < self.max_seq {
                self.cycles = self.cycles.wrapping_add(1 << 16);
            }
            self.max_seq = seq;
        }
        self.received += 1;
        true
    }

    fn on_transit(&mut self, transit: i64) {
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }
}

/// Bundle membership of a session
#[derive(Debug, Clone)]
pub struct BundleMembership {
    /// The bundle
    pub bundle: RtpBundle,
    /// Whether this session owns the bundle transport
    pub primary: bool,
}

#[derive(Debug, Default)]
struct BundleState {
    primary: Option<Uuid>,
    members: Vec<Uuid>,
    fec_links: Vec<(Uuid, Uuid)>,
}

/// Several RTP sessions multiplexed on one transport
#[derive(Debug, Clone, Default)]
pub struct RtpBundle {
    id: Uuid,
    state: Arc<Mutex<BundleState>>,
}

impl RtpBundle {
    /// Create an empty bundle
    pub fn new() -> Self {
        RtpBundle {
            id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(BundleState::default())),
        }
    }

    /// Bundle identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Add a session. The first session added becomes the primary.
    pub fn add_session(&self, session: &mut RtpSession) {
        let mut state = self.state.lock();
        let primary = state.primary.is_none();
        if primary {
            state.primary = Some(session.id());
        }
        if !state.members.contains(&session.id()) {
            state.members.push(session.id());
        }
        session.bundle = Some(BundleMembership {
            bundle: self.clone(),
            primary,
        });
    }

    /// Link a FEC session to the media session it protects
    pub fn add_fec_session(&self, primary: &RtpSession, fec: &mut RtpSession) {
        {
            let mut state = self.state.lock();
            if !state.members.contains(&fec.id()) {
                state.members.push(fec.id());
            }
            state.fec_links.push((primary.id(), fec.id()));
        }
        fec.bundle = Some(BundleMembership {
            bundle: self.clone(),
            primary: false,
        });
    }

    /// FEC session protecting `session_id`
    pub fn fec_session_of(&self, session_id: Uuid) -> Option<Uuid> {
        self.state
            .lock()
            .fec_links
            .iter()
            .find(|(primary, _)| *primary == session_id)
            .map(|(_, fec)| *fec)
    }

    /// Session owning the transport
    pub fn primary_session(&self) -> Option<Uuid> {
        self.state.lock().primary
    }

    /// Number of sessions in the bundle
    pub fn len(&self) -> usize {
        self.state.lock().members.len()
    }

    /// True when no session was added
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RTP/RTCP transport session
#[derive(Debug)]
pub struct RtpSession {
    id: Uuid,
    mode: SessionMode,
    rtp_socket: Option<UdpSocket>,
    rtcp_socket: Option<UdpSocket>,
    remote_rtp: Option<SocketAddr>,
    remote_rtcp: Option<SocketAddr>,
    recv_buf_size: usize,
    scheduling_mode: bool,
    blocking_mode: bool,
    adaptive_jittcomp: bool,
    jitter_compensation_ms: u32,
    symmetric_rtp: bool,
    ssrc_changed_threshold: u32,
    rtcp_report_interval_ms: u32,
    last_rtcp_report: Option<Instant>,
    multicast_loopback: bool,
    send_ts_offset: u32,
    send_seq: u16,
    send_ssrc: u32,
    recv_ssrc: u32,
    payload_type: u8,
    clock_rate: u32,
    profile: Option<RtpProfile>,
    avpf_enabled: bool,
    avpf_tmmbr: bool,
    avpf_rr_interval_ms: u16,
    dscp: u8,
    target_upload_bandwidth: i32,
    cname: Option<String>,
    tool: Option<String>,
    stats: RtpStats,
    tracker: ReceptionTracker,
    max_jitter: u32,
    created: Instant,
    rtp_send_bw: BandwidthMeter,
    rtp_recv_bw: BandwidthMeter,
    rtcp_send_bw: BandwidthMeter,
    rtcp_recv_bw: BandwidthMeter,
    audio_bw_estimator: Option<AudioBandwidthEstimator>,
    bundle: Option<BundleMembership>,
}

/// Create a duplex session bound to `local_ip` (or the IPv6 wildcard, falling
/// back to IPv4) with settings tuned for real-time media.
pub fn create_duplex_rtp_session(
    local_ip: Option<IpAddr>,
    rtp_port: u16,
    rtcp_port: u16,
    config: &EngineConfig,
) -> StreamResult<RtpSession> {
    let mut session = RtpSession::new(SessionMode::SendRecv);
    session.recv_buf_size = config.recv_buffer_size();
    session.scheduling_mode = false;
    session.blocking_mode = false;
    session.adaptive_jittcomp = true;
    session.symmetric_rtp = true;
    session.ssrc_changed_threshold = 0;
    session.rtcp_report_interval_ms = config.rtcp_report_interval_ms;
    session.multicast_loopback = true;
    session.avpf_tmmbr = true;

    let candidates: Vec<IpAddr> = match local_ip {
        Some(ip) => vec![ip],
        None => vec![
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        ],
    };

    let mut last_err = None;
    for ip in candidates {
        match bind_pair(ip, rtp_port, rtcp_port, config.socket_buffer_size) {
            Ok((rtp, rtcp)) => {
                session.rtp_socket = Some(rtp);
                session.rtcp_socket = rtcp;
                last_err = None;
                break;
            }
            Err(e) => {
                debug!(%ip, error = %e, "Could not bind RTP session, trying next address");
                last_err = Some(e);
            }
        }
    }
    if let Some(e) = last_err {
        return Err(StreamError::Transport(format!(
            "Failed to bind RTP session on port {}: {}",
            rtp_port, e
        )));
    }

    info!(
        session_id = %session.id,
        rtp = ?session.local_rtp_addr(),
        rtcp = ?session.local_rtcp_addr(),
        send_ssrc = session.send_ssrc,
        "RTP session created"
    );
    Ok(session)
}

fn bind_pair(
    ip: IpAddr,
    rtp_port: u16,
    rtcp_port: u16,
    buffer_size: usize,
) -> std::io::Result<(UdpSocket, Option<UdpSocket>)> {
    let rtp = bind_udp(SocketAddr::new(ip, rtp_port), buffer_size)?;
    if rtcp_port != 0 && rtcp_port == rtp_port {
        // rtcp-mux
        return Ok((rtp, None));
    }
    let rtcp = bind_udp(SocketAddr::new(ip, rtcp_port), buffer_size)?;
    Ok((rtp, Some(rtcp)))
}

fn bind_udp(addr: SocketAddr, buffer_size: usize) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        warn!(error = %e, "Could not set socket receive buffer size");
    }
    if let Err(e) = socket.set_send_buffer_size(buffer_size) {
        warn!(error = %e, "Could not set socket send buffer size");
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    let loopback = if addr.is_ipv6() {
        socket.set_multicast_loop_v6(true)
    } else {
        socket.set_multicast_loop_v4(true)
    };
    if let Err(e) = loopback {
        debug!(error = %e, "Multicast loopback not available");
    }
    Ok(socket.into())
}

fn parse_rtp_header(packet: &[u8]) -> Option<(u8, u16, u32, u32)> {
    if packet.len() < RTP_HEADER_SIZE || packet[0] >> 6 != 2 {
        return None;
    }
    let csrc_len = (packet[0] & 0x0F) as usize * 4;
    if packet.len() < RTP_HEADER_SIZE + csrc_len {
        return None;
    }
    let payload_type = packet[1] & 0x7F;
    let seq = u16::from_be_bytes([packet[2], packet[3]]);
    let ts = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
    let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
    Some((payload_type, seq, ts, ssrc))
}

/// STUN messages start with two zero bits (RFC 7983)
fn is_stun(datagram: &[u8]) -> bool {
    datagram.first().map(|b| b >> 6 == 0).unwrap_or(false)
}

/// RTCP multiplexed on the RTP port (RFC 5761)
fn is_muxed_rtcp(datagram: &[u8]) -> bool {
    datagram.len() >= 8 && datagram[0] >> 6 == 2 && (192..=223).contains(&datagram[1])
}

impl RtpSession {
    /// Create an unbound session. Used for FEC sessions riding a bundle.
    pub fn new(mode: SessionMode) -> Self {
        let now = Instant::now();
        RtpSession {
            id: Uuid::new_v4(),
            mode,
            rtp_socket: None,
            rtcp_socket: None,
            remote_rtp: None,
            remote_rtcp: None,
            recv_buf_size: media_stream_config::MINIMAL_MTU,
            scheduling_mode: true,
            blocking_mode: true,
            adaptive_jittcomp: false,
            jitter_compensation_ms: DEFAULT_JITTER_COMPENSATION_MS,
            symmetric_rtp: false,
            ssrc_changed_threshold: 50,
            rtcp_report_interval_ms: media_stream_config::DEFAULT_RTCP_REPORT_INTERVAL_MS,
            last_rtcp_report: None,
            multicast_loopback: false,
            send_ts_offset: rand::random(),
            send_seq: rand::random(),
            send_ssrc: rand::random(),
            recv_ssrc: 0,
            payload_type: 0,
            clock_rate: 8000,
            profile: None,
            avpf_enabled: false,
            avpf_tmmbr: false,
            avpf_rr_interval_ms: DEFAULT_AVPF_RR_INTERVAL_MS,
            dscp: 0,
            target_upload_bandwidth: 0,
            cname: None,
            tool: None,
            stats: RtpStats::default(),
            tracker: ReceptionTracker::default(),
            max_jitter: 0,
            created: now,
            rtp_send_bw: BandwidthMeter::new(now),
            rtp_recv_bw: BandwidthMeter::new(now),
            rtcp_send_bw: BandwidthMeter::new(now),
            rtcp_recv_bw: BandwidthMeter::new(now),
            audio_bw_estimator: None,
            bundle: None,
        }
    }

    /// Session identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Session mode
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Local RTP address
    pub fn local_rtp_addr(&self) -> Option<SocketAddr> {
        self.rtp_socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Local RTCP address (same as RTP with rtcp-mux)
    pub fn local_rtcp_addr(&self) -> Option<SocketAddr> {
        match &self.rtcp_socket {
            Some(socket) => socket.local_addr().ok(),
            None => self.local_rtp_addr(),
        }
    }

    /// Set remote RTP and RTCP destinations
    pub fn set_remote_addr(&mut self, rtp: SocketAddr, rtcp: Option<SocketAddr>) {
        self.remote_rtp = Some(rtp);
        self.remote_rtcp = rtcp.or(Some(rtp));
    }

    /// Remote RTP destination
    pub fn remote_rtp_addr(&self) -> Option<SocketAddr> {
        self.remote_rtp
    }

    /// Receive buffer size
    pub fn recv_buf_size(&self) -> usize {
        self.recv_buf_size
    }

    /// Whether the scheduler drives this session
    pub fn scheduling_mode(&self) -> bool {
        self.scheduling_mode
    }

    /// Copy scheduling and blocking modes into another session
    pub fn copy_modes_to(&self, other: &mut RtpSession) {
        other.scheduling_mode = self.scheduling_mode;
        other.blocking_mode = self.blocking_mode;
    }

    /// Whether receive calls may block
    pub fn blocking_mode(&self) -> bool {
        self.blocking_mode
    }

    /// Whether symmetric RTP is on
    pub fn symmetric_rtp(&self) -> bool {
        self.symmetric_rtp
    }

    /// Packets from a new SSRC needed before switching to it
    pub fn ssrc_changed_threshold(&self) -> u32 {
        self.ssrc_changed_threshold
    }

    /// Whether multicast loopback was requested
    pub fn multicast_loopback(&self) -> bool {
        self.multicast_loopback
    }

    /// Random offset added to outgoing timestamps
    pub fn send_ts_offset(&self) -> u32 {
        self.send_ts_offset
    }

    /// Toggle adaptive jitter compensation
    pub fn enable_adaptive_jitter_compensation(&mut self, enabled: bool) {
        self.adaptive_jittcomp = enabled;
    }

    /// Whether adaptive jitter compensation is on
    pub fn adaptive_jitter_compensation(&self) -> bool {
        self.adaptive_jittcomp
    }

    /// Set the jitter buffer compensation (ms)
    pub fn set_jitter_compensation(&mut self, ms: u32) {
        self.jitter_compensation_ms = ms;
    }

    /// Jitter buffer compensation (ms)
    pub fn jitter_compensation(&self) -> u32 {
        self.jitter_compensation_ms
    }

    /// Set the RTCP report interval (ms)
    pub fn set_rtcp_report_interval(&mut self, ms: u32) {
        debug!(session_id = %self.id, interval_ms = ms, "RTCP report interval changed");
        self.rtcp_report_interval_ms = ms;
    }

    /// RTCP report interval (ms)
    pub fn rtcp_report_interval(&self) -> u32 {
        self.rtcp_report_interval_ms
    }

    /// Bind a profile and select the payload type used for sending
    pub fn set_profile(&mut self, profile: RtpProfile) {
        self.profile = Some(profile);
    }

    /// Bound profile
    pub fn profile(&self) -> Option<&RtpProfile> {
        self.profile.as_ref()
    }

    /// Select the payload type; picks up its clock rate from the profile
    pub fn set_payload_type(&mut self, number: u8) {
        self.payload_type = number;
        if let Some(pt) = self.profile.as_ref().and_then(|p| p.payload(number)) {
            self.clock_rate = pt.clock_rate;
        }
    }

    /// Selected payload type
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Enable AVPF with the given regular RTCP interval
    pub fn set_avpf(&mut self, enabled: bool, rr_interval_ms: u16) {
        self.avpf_enabled = enabled;
        self.avpf_rr_interval_ms = rr_interval_ms;
    }

    /// Whether AVPF is on
    pub fn avpf_enabled(&self) -> bool {
        self.avpf_enabled
    }

    /// AVPF regular RTCP interval (ms)
    pub fn avpf_rr_interval(&self) -> u16 {
        self.avpf_rr_interval_ms
    }

    /// Toggle the TMMBR AVPF feature
    pub fn enable_avpf_tmmbr(&mut self, enabled: bool) {
        self.avpf_tmmbr = enabled;
    }

    /// Whether the TMMBR AVPF feature is on
    pub fn avpf_tmmbr_enabled(&self) -> bool {
        self.avpf_tmmbr
    }

    /// Apply a DSCP value to outgoing packets
    pub fn set_dscp(&mut self, dscp: u8) -> StreamResult<()> {
        if dscp > 63 {
            return Err(StreamError::Configuration(format!("DSCP {} out of range", dscp)));
        }
        self.dscp = dscp;
        for socket in self.rtp_socket.iter().chain(self.rtcp_socket.iter()) {
            SockRef::from(socket).set_tos((dscp as u32) << 2)?;
        }
        debug!(session_id = %self.id, dscp, "DSCP applied");
        Ok(())
    }

    /// Current DSCP value
    pub fn dscp(&self) -> u8 {
        self.dscp
    }

    /// Set CNAME and tool advertised in SDES
    pub fn set_source_description(&mut self, cname: impl Into<String>, tool: impl Into<String>) {
        self.cname = Some(cname.into());
        self.tool = Some(tool.into());
    }

    /// Advertised CNAME
    pub fn cname(&self) -> Option<&str> {
        self.cname.as_deref()
    }

    /// Advertised tool name
    pub fn tool(&self) -> Option<&str> {
        self.tool.as_deref()
    }

    /// Join a multicast group on the RTP and RTCP sockets
    pub fn join_multicast_group(&self, group: IpAddr) -> StreamResult<()> {
        if !group.is_multicast() {
            return Err(StreamError::Configuration(format!("{} is not a multicast address", group)));
        }
        for socket in self.rtp_socket.iter().chain(self.rtcp_socket.iter()) {
            match group {
                IpAddr::V4(addr) => socket.join_multicast_v4(&addr, &Ipv4Addr::UNSPECIFIED)?,
                IpAddr::V6(addr) => socket.join_multicast_v6(&addr, 0)?,
            }
        }
        info!(session_id = %self.id, %group, "Joined multicast group");
        Ok(())
    }

    /// Outgoing SSRC
    pub fn send_ssrc(&self) -> u32 {
        self.send_ssrc
    }

    /// SSRC of the current remote source (0 before any packet)
    pub fn recv_ssrc(&self) -> u32 {
        self.recv_ssrc
    }

    /// Packet counters
    pub fn stats(&self) -> RtpStats {
        self.stats
    }

    /// Jitter statistics
    pub fn jitter_stats(&self) -> JitterStats {
        JitterStats {
            jitter: self.tracker.jitter as u32,
            max_jitter: self.max_jitter,
            jitter_buffer_size_ms: self.jitter_compensation_ms,
        }
    }

    /// RTP clock rate of the selected payload
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Outgoing RTP bandwidth (bps)
    pub fn rtp_send_bandwidth(&self) -> f32 {
        self.rtp_send_bw.bps
    }

    /// Incoming RTP bandwidth (bps)
    pub fn rtp_recv_bandwidth(&self) -> f32 {
        self.rtp_recv_bw.bps
    }

    /// Outgoing RTCP bandwidth (bps)
    pub fn rtcp_send_bandwidth(&self) -> f32 {
        self.rtcp_send_bw.bps
    }

    /// Incoming RTCP bandwidth (bps)
    pub fn rtcp_recv_bandwidth(&self) -> f32 {
        self.rtcp_recv_bw.bps
    }

    /// Roll the bandwidth windows
    pub fn update_bandwidth(&mut self) {
        let now = Instant::now();
        self.rtp_send_bw.sample(now);
        self.rtp_recv_bw.sample(now);
        self.rtcp_send_bw.sample(now);
        self.rtcp_recv_bw.sample(now);
    }

    /// Limit announced to the bandwidth-aware sender (bps)
    pub fn set_target_upload_bandwidth(&mut self, bitrate: i32) {
        self.target_upload_bandwidth = bitrate;
    }

    /// Limit announced to the bandwidth-aware sender (bps)
    pub fn target_upload_bandwidth(&self) -> i32 {
        self.target_upload_bandwidth
    }

    /// Install the duplicate packet estimator used with redundant audio
    pub fn enable_audio_bandwidth_estimator(&mut self, duplicate_rate: u64) {
        self.audio_bw_estimator = Some(AudioBandwidthEstimator { duplicate_rate });
    }

    /// Duplicate packet estimator, if any
    pub fn audio_bandwidth_estimator(&self) -> Option<&AudioBandwidthEstimator> {
        self.audio_bw_estimator.as_ref()
    }

    /// Bundle membership, if any
    pub fn bundle(&self) -> Option<&BundleMembership> {
        self.bundle.as_ref()
    }

    /// True when the session is in a bundle but does not own its transport
    pub fn is_bundled_secondary(&self) -> bool {
        self.bundle.as_ref().map(|m| !m.primary).unwrap_or(false)
    }

    /// Account for a received RTP packet
    ///
    /// Called by [`RtpSession::poll_incoming`] and by hosts that read RTP
    /// through their own receive path.
    pub fn on_rtp_received(&mut self, packet: &[u8]) -> bool {
        let Some((_, seq, ts, ssrc)) = parse_rtp_header(packet) else {
            debug!(session_id = %self.id, len = packet.len(), "Dropping non-RTP datagram");
            return false;
        };

        if ssrc != self.recv_ssrc {
            if self.recv_ssrc != 0 {
                info!(
                    session_id = %self.id,
                    old_ssrc = self.recv_ssrc,
                    new_ssrc = ssrc,
                    "Remote SSRC changed"
                );
            }
            // Threshold 0: switch on the first packet from the new source
            self.recv_ssrc = ssrc;
            self.tracker = ReceptionTracker::default();
        }

        if !self.tracker.on_sequence(seq) {
            self.stats.duplicated += 1;
            return false;
        }

        let arrival = (self.created.elapsed().as_secs_f64() * self.clock_rate as f64) as i64;
        self.tracker.on_transit(arrival - ts as i64);
        self.max_jitter = self.max_jitter.max(self.tracker.jitter as u32);

        self.stats.packet_recv += 1;
        self.stats.bytes_recv += packet.len() as u64;
        self.stats.cum_packet_loss = self.tracker.lost();
        self.rtp_recv_bw.add(packet.len());
        true
    }

    /// Send one RTP packet to the remote destination
    pub fn send_rtp(&mut self, timestamp: u32, marker: bool, payload: &[u8]) -> StreamResult<usize> {
        let (Some(socket), Some(remote)) = (self.rtp_socket.as_ref(), self.remote_rtp) else {
            return Err(StreamError::InvalidState {
                state: "no RTP socket or remote address".to_string(),
            });
        };
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + payload.len());
        buf.put_u8(0x80);
        buf.put_u8(((marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.send_seq);
        buf.put_u32(timestamp.wrapping_add(self.send_ts_offset));
        buf.put_u32(self.send_ssrc);
        buf.put_slice(payload);

        let sent = socket.send_to(&buf, remote)?;
        self.send_seq = self.send_seq.wrapping_add(1);
        self.stats.packet_sent += 1;
        self.stats.bytes_sent += sent as u64;
        self.rtp_send_bw.add(sent);
        Ok(sent)
    }

    /// Read pending datagrams from both sockets, at most
    /// [`MAX_DATAGRAMS_PER_POLL`] each. RTP is accounted for, RTCP and STUN
    /// are posted to `events`. Returns the number of datagrams read.
    pub fn poll_incoming(&mut self, events: &EventSender) -> StreamResult<usize> {
        let rtp = read_pending(self.rtp_socket.as_ref(), self.recv_buf_size, MAX_DATAGRAMS_PER_POLL)?;
        let rtcp = read_pending(self.rtcp_socket.as_ref(), self.recv_buf_size, MAX_DATAGRAMS_PER_POLL)?;
        let count = rtp.len() + rtcp.len();

        for (datagram, from) in rtp {
            if is_stun(&datagram) {
                events.post(StreamEvent::StunReceived(datagram));
            } else if is_muxed_rtcp(&datagram) {
                self.learn_remote_rtcp(from);
                self.rtcp_recv_bw.add(datagram.len());
                events.post(StreamEvent::RtcpReceived(datagram));
            } else if self.on_rtp_received(&datagram) {
                self.learn_remote_rtp(from);
            }
        }

        for (datagram, from) in rtcp {
            if is_stun(&datagram) {
                events.post(StreamEvent::StunReceived(datagram));
            } else {
                self.learn_remote_rtcp(from);
                self.rtcp_recv_bw.add(datagram.len());
                events.post(StreamEvent::RtcpReceived(datagram));
            }
        }
        Ok(count)
    }

    fn learn_remote_rtp(&mut self, from: SocketAddr) {
        if self.symmetric_rtp && self.remote_rtp != Some(from) {
            debug!(session_id = %self.id, %from, "Symmetric RTP: remote RTP address learned");
            self.remote_rtp = Some(from);
        }
    }

    fn learn_remote_rtcp(&mut self, from: SocketAddr) {
        if self.symmetric_rtp && self.remote_rtcp != Some(from) {
            debug!(session_id = %self.id, %from, "Symmetric RTP: remote RTCP address learned");
            self.remote_rtcp = Some(from);
        }
    }

    /// Build the reception report for the current remote source
    pub fn reception_report(&self) -> Option<ReceptionReport> {
        if !self.tracker.started {
            return None;
        }
        let expected = self.tracker.expected().max(1);
        let fraction_lost = ((self.tracker.lost().max(0) * 256) / expected).min(255) as u8;
        let delay_since_last_sr = self
            .tracker
            .last_sr_arrival
            .map(|at| (at.elapsed().as_secs_f64() * 65536.0) as u32)
            .unwrap_or(0);
        Some(ReceptionReport {
            ssrc: self.recv_ssrc,
            fraction_lost,
            cumulative_packets_lost: self.tracker.lost().clamp(-(1 << 23), (1 << 23) - 1) as i32,
            extended_sequence_number: self.tracker.extended_max(),
            jitter: self.tracker.jitter as u32,
            last_sr_timestamp: self.tracker.last_sr,
            delay_since_last_sr,
        })
    }

    /// Remember the middle 32 bits of a received SR's NTP timestamp
    pub fn note_sender_report(&mut self, ntp_middle: u32) {
        self.tracker.last_sr = ntp_middle;
        self.tracker.last_sr_arrival = Some(Instant::now());
    }

    /// Emit a receiver report when the report interval has elapsed.
    /// Posts [`StreamEvent::RtcpEmitted`] on success.
    pub fn maybe_emit_rtcp(&mut self, events: &EventSender) -> StreamResult<bool> {
        let interval = Duration::from_millis(self.rtcp_report_interval_ms as u64);
        if let Some(last) = self.last_rtcp_report {
            if last.elapsed() < interval {
                return Ok(false);
            }
        }
        let socket = self.rtcp_socket.as_ref().or(self.rtp_socket.as_ref());
        let (Some(socket), Some(remote)) = (socket, self.remote_rtcp) else {
            return Ok(false);
        };

        let report = ReceiverReport::new(self.send_ssrc, self.reception_report().into_iter().collect());
        let sent = socket.send_to(&report.serialize(), remote)?;
        self.rtcp_send_bw.add(sent);
        self.last_rtcp_report = Some(Instant::now());
        events.post(StreamEvent::RtcpEmitted);
        Ok(true)
    }
}

fn read_pending(
    socket: Option<&UdpSocket>,
    buf_size: usize,
    limit: usize,
) -> StreamResult<Vec<(Bytes, SocketAddr)>> {
    let mut datagrams = Vec::new();
    let Some(socket) = socket else {
        return Ok(datagrams);
    };
    let mut buf = vec![0u8; buf_size];
    for _ in 0..limit {
        match socket.recv_from(&mut buf) {
            Ok((0, _)) => continue,
            Ok((len, from)) => datagrams.push((Bytes::copy_from_slice(&buf[..len]), from)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                // ICMP port unreachable from a previous send
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(datagrams)
}
