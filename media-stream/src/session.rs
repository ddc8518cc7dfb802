//! Stream session
//!
//! [`StreamSession`] ties one media stream together: its transport, security
//! context, optional FEC session and ticker, the event queue fed by the
//! transport, RTCP feedback processing, TMMBR bitrate control and liveness.
//! Everything here runs on the thread that calls [`StreamSession::iterate`].
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

use bytes::Bytes;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use media_stream_config::{EngineConfig, TickerPriority};

use crate::bitrate::{BitrateController, BitrateControllerState, TmmbrTarget};
use crate::clock::{Clock, SystemClock};
use crate::codec::{
    DecodeStatus, Decoder, DecoderGate, EncodedFrame, Encoder, DEFAULT_FRAME_SLOT_CAPACITY,
};
use crate::crypto_suite::CryptoSuite;
use crate::error::{StreamError, StreamResult};
use crate::events::{EventDispatcher, EventQueue, EventSender, HandlerToken, RtcpHandler, StreamEvent};
use crate::fec::{extract_fec_params, FecStream};
use crate::ice::IceCheckList;
use crate::profile::RtpProfile;
use crate::quality::QualityIndicator;
use crate::rate_control::{BitrateAlgorithm, RateControlConfig, RateController};
use crate::rtcp::{CompoundPacket, RtcpPacket, RtcpPacketType, RtpfbType};
use crate::security::{
    DtlsSrtpParams, KeyExchange, SecurityContext, SecurityEngineFactory, SessionBinding, SrtpKeySource,
    ZrtpParams,
};
use crate::ticker::{ExternalTickerFactory, Ticker, TickerFactory, TickerParams};
use crate::transport::{create_duplex_rtp_session, RtpBundle, RtpSession, RtpStats, SessionMode};
use crate::types::{MediaType, StreamDirection, StreamState};

/// MIME name of the FlexFEC payload
const FLEXFEC_MIME: &str = "flexfec";

/// Jitter compensation applied once FEC is negotiated (ms)
const FEC_JITTER_COMPENSATION_MS: u32 = 200;

/// RTCP report interval once the session has settled (ms)
const SETTLED_RTCP_REPORT_INTERVAL_MS: u32 = 5000;

/// Seconds after start during which RTCP is sent more often
const BEGINNING_PERIOD_SECS: u64 = 15;

/// PSFB picture loss indication
const PSFB_PLI: u8 = 1;
/// PSFB full intra request
const PSFB_FIR: u8 = 4;

/// Resources a stream owns and can hand over to another owner
#[derive(Default)]
pub struct StreamSessions {
    /// Media RTP session
    pub rtp_session: Option<RtpSession>,
    /// Key exchange
    pub security: SecurityContext,
    /// FlexFEC session
    pub fec_session: Option<RtpSession>,
    /// Ticker driving the stream
    pub ticker: Option<Box<dyn Ticker>>,
}

impl StreamSessions {
    /// Sessions around an RTP session
    pub fn new(rtp_session: RtpSession) -> Self {
        StreamSessions {
            rtp_session: Some(rtp_session),
            ..Default::default()
        }
    }

    /// True when nothing is owned
    pub fn is_empty(&self) -> bool {
        self.rtp_session.is_none()
            && self.fec_session.is_none()
            && self.ticker.is_none()
            && self.security.kind().is_none()
    }
}

/// Whether dummy STUN packets are sent to keep NAT bindings open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StunSending {
    /// STUN keepalives are sent
    pub enabled: bool,
    /// Sent even before any RTP goes out (DTLS handshake pending)
    pub forced: bool,
}

/// Construction options
#[derive(Clone)]
pub struct SessionOptions {
    /// Engine-wide configuration
    pub engine: EngineConfig,
    /// Ticker priority; overrides the configuration knobs
    pub ticker_priority: Option<TickerPriority>,
    /// Time source for liveness and tick bookkeeping
    pub clock: Arc<dyn Clock>,
    /// Creates ZRTP and DTLS-SRTP engines
    pub security_factory: Option<Arc<dyn SecurityEngineFactory>>,
    /// Creates the ticker
    pub ticker_factory: Arc<dyn TickerFactory>,
    /// CPUs available to the encoder
    pub cpu_count: usize,
    /// Video encoder preset name
    pub video_preset: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            engine: EngineConfig::default(),
            ticker_priority: None,
            clock: Arc::new(SystemClock),
            security_factory: None,
            ticker_factory: Arc::new(ExternalTickerFactory),
            cpu_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            video_preset: None,
        }
    }
}

fn no_transport() -> StreamError {
    StreamError::InvalidState {
        state: "no RTP session (sessions reclaimed)".to_string(),
    }
}

/// One media stream
pub struct StreamSession {
    id: Uuid,
    media_type: MediaType,
    config: EngineConfig,
    ticker_priority: Option<TickerPriority>,
    clock: Arc<dyn Clock>,
    security_factory: Option<Arc<dyn SecurityEngineFactory>>,
    ticker_factory: Arc<dyn TickerFactory>,
    sessions: StreamSessions,
    queue: EventQueue,
    dispatcher: EventDispatcher,
    quality: Option<QualityIndicator>,
    bitrate: BitrateController,
    rate_control: Option<RateController>,
    rc_enabled: bool,
    rc_algorithm: BitrateAlgorithm,
    encoder: Option<Box<dyn Encoder>>,
    decoder: Option<DecoderGate>,
    ice_check_list: Option<Box<dyn IceCheckList>>,
    fec_stream: Option<FecStream>,
    state: StreamState,
    direction: StreamDirection,
    start_time: Option<u64>,
    last_packet_time: u64,
    last_packet_count: u64,
    last_iterate_time: u64,
    is_beginning: bool,
    stun_allowed: bool,
    stun_sending: StunSending,
    video_preset: Option<String>,
    cpu_count: usize,
    poll_transport: bool,
}

impl StreamSession {
    /// Build a stream around `sessions`, which must hold an RTP session
    pub fn new(media_type: MediaType, mut sessions: StreamSessions, options: SessionOptions) -> StreamResult<Self> {
        let rtp = sessions
            .rtp_session
            .as_ref()
            .ok_or_else(|| StreamError::Resource("a stream needs an RTP session".to_string()))?;

        let id = Uuid::new_v4();
        let binding = SessionBinding {
            stream_id: id,
            rtp_session_id: rtp.id(),
            fec_session_id: sessions.fec_session.as_ref().map(|s| s.id()),
        };
        // Engines point back at the sessions they secure
        sessions.security.bind(Some(binding));

        info!(
            stream_id = %id,
            media = %media_type,
            rtp_session_id = %rtp.id(),
            "Stream session created"
        );

        Ok(StreamSession {
            id,
            media_type,
            config: options.engine,
            ticker_priority: options.ticker_priority,
            clock: options.clock,
            security_factory: options.security_factory,
            ticker_factory: options.ticker_factory,
            sessions,
            queue: EventQueue::new(),
            dispatcher: EventDispatcher::new(),
            quality: None,
            bitrate: BitrateController::new(),
            rate_control: None,
            rc_enabled: false,
            rc_algorithm: BitrateAlgorithm::default(),
            encoder: None,
            decoder: None,
            ice_check_list: None,
            fec_stream: None,
            state: StreamState::Idle,
            direction: StreamDirection::SendRecv,
            start_time: None,
            last_packet_time: 0,
            last_packet_count: 0,
            last_iterate_time: 0,
            is_beginning: false,
            stun_allowed: true,
            stun_sending: StunSending::default(),
            video_preset: options.video_preset,
            cpu_count: options.cpu_count,
            poll_transport: true,
        })
    }

    /// Build a stream over a freshly bound duplex RTP session
    pub fn with_duplex_transport(
        media_type: MediaType,
        local_ip: Option<IpAddr>,
        rtp_port: u16,
        rtcp_port: u16,
        options: SessionOptions,
    ) -> StreamResult<Self> {
        let rtp = create_duplex_rtp_session(local_ip, rtp_port, rtcp_port, &options.engine)?;
        Self::new(media_type, StreamSessions::new(rtp), options)
    }

    /// Stream identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Media type
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Media RTP session, unless reclaimed
    pub fn rtp_session(&self) -> Option<&RtpSession> {
        self.sessions.rtp_session.as_ref()
    }

    /// Media RTP session, unless reclaimed
    pub fn rtp_session_mut(&mut self) -> Option<&mut RtpSession> {
        self.sessions.rtp_session.as_mut()
    }

    /// FEC session, once negotiated
    pub fn fec_session(&self) -> Option<&RtpSession> {
        self.sessions.fec_session.as_ref()
    }

    /// FEC stream, once negotiated
    pub fn fec_stream(&self) -> Option<&FecStream> {
        self.fec_stream.as_ref()
    }

    /// Ticker, once started
    pub fn ticker(&self) -> Option<&dyn Ticker> {
        self.sessions.ticker.as_deref()
    }

    fn transport_mut(&mut self) -> StreamResult<&mut RtpSession> {
        self.sessions.rtp_session.as_mut().ok_or_else(no_transport)
    }

    fn binding(&self) -> StreamResult<SessionBinding> {
        let rtp = self.sessions.rtp_session.as_ref().ok_or_else(no_transport)?;
        Ok(SessionBinding {
            stream_id: self.id,
            rtp_session_id: rtp.id(),
            fec_session_id: self.sessions.fec_session.as_ref().map(|s| s.id()),
        })
    }

    // ---- Lifecycle ----

    /// Create the ticker, named after the media type, at the resolved
    /// priority. No-op when one exists.
    pub fn start_ticker(&mut self) -> StreamResult<()> {
        if self.sessions.ticker.is_some() {
            return Ok(());
        }
        let priority = self
            .config
            .ticker_priority(self.ticker_priority, self.media_type.is_video());
        let ticker = self
            .ticker_factory
            .create(TickerParams::for_stream(self.media_type, priority))?;
        info!(
            stream_id = %self.id,
            ticker = ticker.name(),
            priority = %ticker.priority(),
            "Ticker started"
        );
        self.sessions.ticker = Some(ticker);
        Ok(())
    }

    /// Attach to the ticker and enter `Started`. Can only happen once.
    pub fn start(&mut self) -> StreamResult<()> {
        if self.state == StreamState::Started {
            return Err(StreamError::InvalidState {
                state: "stream already started".to_string(),
            });
        }
        let clock_rate = self.sessions.rtp_session.as_ref().ok_or_else(no_transport)?.clock_rate();

        self.start_ticker()?;
        if let Some(ticker) = self.sessions.ticker.as_mut() {
            ticker.attach(self.id)?;
        }

        let now = self.clock.now_secs();
        self.quality = Some(QualityIndicator::new(clock_rate));
        if self.rc_enabled && self.rate_control.is_none() {
            self.rate_control = Some(self.new_rate_controller(self.rc_algorithm));
        }
        self.start_time = Some(now);
        self.last_packet_time = now;
        self.last_iterate_time = now;
        self.is_beginning = true;
        self.state = StreamState::Started;
        self.configure_stun_packet_sending();

        info!(stream_id = %self.id, media = %self.media_type, start_time = now, "Stream started");
        Ok(())
    }

    /// Lifecycle state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// True once [`StreamSession::start`] succeeded
    pub fn started(&self) -> bool {
        self.start_time.is_some()
    }

    /// Time the stream started (seconds)
    pub fn start_time(&self) -> Option<u64> {
        self.start_time
    }

    /// Let the host feed the transport itself instead of having
    /// [`StreamSession::iterate`] poll its sockets
    pub fn set_transport_polling(&mut self, enabled: bool) {
        self.poll_transport = enabled;
    }

    /// Run one tick: ICE, RTCP interval, local quality, rate control, then
    /// every queued event in arrival order.
    pub fn iterate(&mut self) {
        let now = self.clock.now_secs();

        if let (Some(ice), Some(rtp)) = (self.ice_check_list.as_mut(), self.sessions.rtp_session.as_ref()) {
            ice.process(rtp);
        }

        if self.state == StreamState::Started {
            if let Some(rtp) = self.sessions.rtp_session.as_mut() {
                let elapsed = now.saturating_sub(self.start_time.unwrap_or(now));
                if self.is_beginning && elapsed > BEGINNING_PERIOD_SECS {
                    rtp.set_rtcp_report_interval(SETTLED_RTCP_REPORT_INTERVAL_MS);
                    self.is_beginning = false;
                }
                // Local statistics are meaningless when we only send
                if let Some(qi) = self.quality.as_mut() {
                    if now > self.last_iterate_time && self.direction != StreamDirection::SendOnly {
                        qi.update_local(now, &rtp.stats(), &rtp.jitter_stats());
                    }
                }
            }
        }
        self.last_iterate_time = now;

        if let Some(rc) = self.rate_control.as_mut() {
            let state = self.bitrate.state();
            let ceiling = [state.max_target_bitrate, state.last_applied_limit.unwrap_or(0)]
                .into_iter()
                .filter(|b| *b > 0)
                .min();
            if let Some(bitrate) = rc.update(self.encoder.as_deref_mut(), ceiling) {
                self.bitrate.set_target_bitrate(bitrate);
            }
        }

        if self.poll_transport {
            self.poll_transport_once();
        }

        for event in self.queue.drain() {
            self.handle_event(event);
        }
    }

    fn poll_transport_once(&mut self) {
        let sender = self.queue.sender();
        let Some(rtp) = self.sessions.rtp_session.as_mut() else {
            return;
        };
        if let Err(e) = rtp.poll_incoming(&sender) {
            warn!(stream_id = %self.id, error = %e, "Failed to read from transport");
        }
        if let Err(e) = rtp.maybe_emit_rtcp(&sender) {
            warn!(stream_id = %self.id, error = %e, "Failed to emit RTCP report");
        }
        rtp.update_bandwidth();
    }

    fn handle_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::RtcpReceived(packet) => self.process_rtcp(packet),
            StreamEvent::RtcpEmitted => {
                if let Some(rtp) = self.sessions.rtp_session.as_ref() {
                    info!(
                        stream_id = %self.id,
                        media = %self.media_type,
                        jitter_buffer_size_ms = rtp.jitter_stats().jitter_buffer_size_ms,
                        "Local statistics available"
                    );
                }
            }
            StreamEvent::StunReceived(packet) => {
                match (self.ice_check_list.as_mut(), self.sessions.rtp_session.as_ref()) {
                    (Some(ice), Some(rtp)) => ice.handle_stun(rtp, &packet),
                    _ => trace!(stream_id = %self.id, "STUN packet ignored, no ICE check list"),
                }
            }
            StreamEvent::ZrtpEncryptionChanged { .. } | StreamEvent::DtlsEncryptionChanged { .. } => {
                info!(
                    stream_id = %self.id,
                    media = %self.media_type,
                    encrypted = self.secured(),
                    "Encryption state changed"
                );
                self.recover_security();
            }
            StreamEvent::Unknown(kind) => {
                debug!(stream_id = %self.id, kind, "Ignoring unknown event");
            }
        }
    }

    /// Walk a received compound RTCP packet. Liveness is refreshed once;
    /// each sub-packet then feeds rate control, the quality indicator,
    /// registered handlers and the per-type hook. A sub-packet that does
    /// not parse is dropped and the walk goes on.
    pub fn process_rtcp(&mut self, packet: Bytes) {
        self.last_packet_time = self.clock.now_secs();
        debug!(
            stream_id = %self.id,
            media = %self.media_type,
            first = ?CompoundPacket::first_type(&packet),
            "Receiving RTCP"
        );

        for sub in CompoundPacket::new(packet) {
            let sub = match sub {
                Ok(sub) => sub,
                Err(e) => {
                    debug!(stream_id = %self.id, error = %e, "Dropping malformed RTCP sub-packet");
                    continue;
                }
            };
            if self.rc_enabled {
                if let Some(rc) = self.rate_control.as_mut() {
                    rc.process_rtcp(&sub);
                }
            }
            if let Some(qi) = self.quality.as_mut() {
                qi.update_from_feedback(&sub);
            }
            self.dispatcher.dispatch(&sub);
            self.on_rtcp_packet(&sub);
        }
    }

    fn on_rtcp_packet(&mut self, packet: &RtcpPacket) {
        match packet {
            RtcpPacket::SenderReport(sr) => {
                if let Some(rtp) = self.sessions.rtp_session.as_mut() {
                    rtp.note_sender_report((sr.ntp_timestamp_msw << 16) | (sr.ntp_timestamp_lsw >> 16));
                }
            }
            RtcpPacket::TransportFeedback(fb) if fb.feedback_type == RtpfbType::Tmmbr => {
                match fb.tmmbr_max_bitrate() {
                    Ok(Some(max_bitrate)) => {
                        self.process_tmmbr(max_bitrate);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(stream_id = %self.id, error = %e, "Dropping malformed TMMBR"),
                }
            }
            RtcpPacket::PayloadFeedback(fb) if self.media_type.is_video() && (fb.fmt == PSFB_PLI || fb.fmt == PSFB_FIR) => {
                if let Some(encoder) = self.encoder.as_mut() {
                    debug!(stream_id = %self.id, fmt = fb.fmt, "Key frame requested by peer");
                    encoder.request_key_frame();
                }
            }
            _ => {}
        }
    }

    /// Apply a TMMBR maximum bitrate. Returns the limit applied.
    pub fn process_tmmbr(&mut self, max_bitrate: u64) -> Option<i32> {
        info!(stream_id = %self.id, kbps = max_bitrate / 1000, "Received TMMBR");
        let Some(transport) = self.sessions.rtp_session.as_mut() else {
            warn!(stream_id = %self.id, "TMMBR ignored, no RTP session");
            return None;
        };
        let target = TmmbrTarget {
            media_type: self.media_type,
            transport,
            encoder: self.encoder.as_deref_mut(),
            video_preset: self.video_preset.as_deref(),
            cpu_count: self.cpu_count,
            fec_active: self.fec_stream.is_some(),
        };
        self.bitrate.process_tmmbr(target, max_bitrate)
    }

    /// False once no packet has been received for more than `timeout`
    /// seconds. Always true before the stream starts.
    pub fn alive(&mut self, timeout: u64) -> bool {
        if self.state != StreamState::Started {
            return true;
        }
        let now = self.clock.now_secs();
        let received = self
            .sessions
            .rtp_session
            .as_ref()
            .map(|rtp| rtp.stats().packet_recv)
            .unwrap_or(0);
        if received != 0 && received != self.last_packet_count {
            self.last_packet_count = received;
            self.last_packet_time = now;
        }
        now.saturating_sub(self.last_packet_time) <= timeout
    }

    // ---- Transport settings ----

    /// Set the media direction
    pub fn set_direction(&mut self, direction: StreamDirection) {
        self.direction = direction;
    }

    /// Media direction
    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    /// Set the RTCP SDES CNAME and tool
    pub fn set_rtcp_information(&mut self, cname: &str, tool: &str) {
        if let Some(rtp) = self.sessions.rtp_session.as_mut() {
            rtp.set_source_description(cname, tool);
        }
    }

    /// Transport packet counters; zeroed once reclaimed
    pub fn local_rtp_stats(&self) -> RtpStats {
        self.sessions
            .rtp_session
            .as_ref()
            .map(|rtp| rtp.stats())
            .unwrap_or_default()
    }

    /// Apply a DSCP value to outgoing packets
    pub fn set_dscp(&mut self, dscp: u8) -> StreamResult<()> {
        info!(stream_id = %self.id, media = %self.media_type, dscp, "Setting DSCP");
        self.transport_mut()?.set_dscp(dscp)
    }

    /// Join a multicast group on the RTP socket
    pub fn join_multicast_group(&self, group: IpAddr) -> StreamResult<()> {
        self.sessions.rtp_session.as_ref().ok_or_else(no_transport)?.join_multicast_group(group)
    }

    /// Toggle RTCP-driven rate control. Takes effect at start if the
    /// stream is not running yet.
    pub fn enable_adaptive_bitrate_control(&mut self, enabled: bool) {
        self.rc_enabled = enabled;
        self.bitrate.set_rate_control(enabled, self.rc_algorithm);
        if enabled && self.started() && self.rate_control.is_none() {
            self.rate_control = Some(self.new_rate_controller(self.rc_algorithm));
        }
    }

    /// Select the rate control algorithm
    pub fn set_adaptive_bitrate_algorithm(&mut self, algorithm: BitrateAlgorithm) {
        self.rc_algorithm = algorithm;
        self.bitrate.set_rate_control(self.rc_enabled, algorithm);
        let stale = self
            .rate_control
            .as_ref()
            .map(|rc| rc.algorithm() != algorithm)
            .unwrap_or(false);
        if stale {
            self.rate_control = Some(self.new_rate_controller(algorithm));
        }
    }

    // Seeded with the bitrate the encoder already runs at, when known
    fn new_rate_controller(&self, algorithm: BitrateAlgorithm) -> RateController {
        let state = self.bitrate.state();
        let config = RateControlConfig::default();
        let current = [state.target_bitrate, state.last_applied_limit.unwrap_or(0)]
            .into_iter()
            .find(|b| *b > 0);
        match current {
            Some(bitrate) => RateController::with_current_rate(algorithm, config, bitrate),
            None => RateController::new(algorithm, config),
        }
    }

    /// Toggle adaptive jitter compensation on the transport
    pub fn enable_adaptive_jittcomp(&mut self, enabled: bool) {
        if let Some(rtp) = self.sessions.rtp_session.as_mut() {
            rtp.enable_adaptive_jitter_compensation(enabled);
        }
    }

    /// Allow STUN keepalives
    pub fn set_stun_allowed(&mut self, allowed: bool) {
        self.stun_allowed = allowed;
    }

    /// Current STUN keepalive decision
    pub fn stun_sending(&self) -> StunSending {
        self.stun_sending
    }

    /// Attach (or detach) the ICE check list handling this stream
    pub fn set_ice_check_list(&mut self, check_list: Option<Box<dyn IceCheckList>>) {
        self.ice_check_list = check_list;
        if let (Some(ice), Some(rtp)) = (self.ice_check_list.as_mut(), self.sessions.rtp_session.as_ref()) {
            ice.set_rtp_session(rtp.id());
        }
        self.configure_stun_packet_sending();
    }

    // Dummy STUN packets open the firewall when nothing else does. With
    // DTLS no RTP leaves before the handshake, so they are forced.
    fn configure_stun_packet_sending(&mut self) {
        let bundled_secondary = self
            .sessions
            .rtp_session
            .as_ref()
            .map(|rtp| rtp.is_bundled_secondary())
            .unwrap_or(false);
        let enabled = self.stun_allowed && self.ice_check_list.is_none() && !bundled_secondary;
        self.stun_sending = StunSending {
            enabled,
            forced: enabled && self.sessions.security.has_dtls(),
        };
        debug!(stream_id = %self.id, stun = ?self.stun_sending, "STUN packet sending configured");
    }

    // ---- Security ----

    fn factory(&self) -> StreamResult<Arc<dyn SecurityEngineFactory>> {
        self.security_factory
            .clone()
            .ok_or_else(|| StreamError::SecurityEngine("no security engine factory configured".to_string()))
    }

    /// Enable ZRTP. Returns `Ok(false)` when ZRTP was already active.
    pub fn enable_zrtp(&mut self, params: ZrtpParams) -> StreamResult<bool> {
        let factory = self.factory()?;
        let binding = self.binding()?;
        self.sessions.security.enable_zrtp(factory.as_ref(), &binding, params)
    }

    /// Enable DTLS-SRTP. An MTU of 0 takes the engine MTU. Returns
    /// `Ok(false)` when DTLS was already active.
    pub fn enable_dtls(&mut self, params: DtlsSrtpParams) -> StreamResult<bool> {
        let factory = self.factory()?;
        let binding = self.binding()?;
        let created = self
            .sessions
            .security
            .enable_dtls(factory.as_ref(), &binding, params, self.config.mtu)?;
        if created {
            self.configure_stun_packet_sending();
        }
        Ok(created)
    }

    /// Install SDES keys
    pub fn enable_sdes(&mut self, suite: CryptoSuite, send_key: &str, recv_key: &str) -> StreamResult<()> {
        self.sessions.security.enable_sdes(suite, send_key, recv_key)
    }

    /// Tear down the active key exchange
    pub fn disable_security(&mut self) -> Option<KeyExchange> {
        let kind = self.sessions.security.teardown();
        self.configure_stun_packet_sending();
        kind
    }

    /// Active security context
    pub fn security(&self) -> &SecurityContext {
        &self.sessions.security
    }

    /// Whether DTLS-SRTP can be used
    pub fn dtls_supported(&self) -> bool {
        self.security_factory
            .as_ref()
            .map(|f| f.dtls_available())
            .unwrap_or(false)
    }

    /// Whether media in the stream's direction is encrypted. False until
    /// the stream starts.
    pub fn secured(&self) -> bool {
        if self.state != StreamState::Started {
            return false;
        }
        match self.media_type {
            MediaType::Audio | MediaType::Video | MediaType::Text => self.sessions.security.secured(self.direction),
            MediaType::Unknown => false,
        }
    }

    /// Origin of the SRTP keys for `direction`
    pub fn srtp_key_source(&self, direction: StreamDirection, inner: bool) -> SrtpKeySource {
        if self.state != StreamState::Started {
            return SrtpKeySource::Unavailable;
        }
        match self.media_type {
            MediaType::Audio | MediaType::Video | MediaType::Text => {
                self.sessions.security.key_source(direction, inner)
            }
            MediaType::Unknown => SrtpKeySource::Unavailable,
        }
    }

    /// SRTP crypto suite for `direction`
    pub fn srtp_crypto_suite(&self, direction: StreamDirection, inner: bool) -> CryptoSuite {
        if self.state != StreamState::Started {
            return CryptoSuite::Invalid;
        }
        match self.media_type {
            MediaType::Audio | MediaType::Video | MediaType::Text => {
                self.sessions.security.crypto_suite(direction, inner)
            }
            MediaType::Unknown => CryptoSuite::Invalid,
        }
    }

    fn recover_security(&mut self) {
        let (Ok(factory), Ok(binding)) = (self.factory(), self.binding()) else {
            return;
        };
        match self.sessions.security.recover(factory.as_ref(), &binding) {
            Ok(true) => {
                if let Some(gate) = self.decoder.as_mut() {
                    gate.freeze();
                }
            }
            Ok(false) => {}
            Err(e) => error!(stream_id = %self.id, error = %e, "Failed to recreate security session"),
        }
    }

    // ---- Bitrate ----

    /// Set the bitrate requested from the encoder (bps)
    pub fn set_target_network_bitrate(&mut self, bitrate: i32) {
        self.bitrate.set_target_bitrate(bitrate);
    }

    /// Bitrate requested from the encoder (bps)
    pub fn target_network_bitrate(&self) -> i32 {
        self.bitrate.target_bitrate()
    }

    /// Cap applied to TMMBR requests (bps); 0 or less disables it
    pub fn set_max_network_bitrate(&mut self, bitrate: i32) {
        self.bitrate.set_max_target_bitrate(bitrate);
    }

    /// Cap applied to TMMBR requests (bps)
    pub fn max_network_bitrate(&self) -> i32 {
        self.bitrate.max_target_bitrate()
    }

    /// Bitrate controller state
    pub fn bitrate_state(&self) -> BitrateControllerState {
        self.bitrate.state()
    }

    /// Set the video encoder preset
    pub fn set_video_preset(&mut self, preset: Option<String>) {
        self.video_preset = preset;
    }

    /// Outgoing RTP bandwidth (bps)
    pub fn up_bw(&self) -> f32 {
        self.rtp_session().map(|r| r.rtp_send_bandwidth()).unwrap_or(0.0)
    }

    /// Incoming RTP bandwidth (bps)
    pub fn down_bw(&self) -> f32 {
        self.rtp_session().map(|r| r.rtp_recv_bandwidth()).unwrap_or(0.0)
    }

    /// Outgoing RTCP bandwidth (bps)
    pub fn rtcp_up_bw(&self) -> f32 {
        self.rtp_session().map(|r| r.rtcp_send_bandwidth()).unwrap_or(0.0)
    }

    /// Incoming RTCP bandwidth (bps)
    pub fn rtcp_down_bw(&self) -> f32 {
        self.rtp_session().map(|r| r.rtcp_recv_bandwidth()).unwrap_or(0.0)
    }

    /// Whether AVPF is on
    pub fn avpf_enabled(&self) -> bool {
        self.rtp_session().map(|r| r.avpf_enabled()).unwrap_or(false)
    }

    /// AVPF regular RTCP interval (ms)
    pub fn avpf_rr_interval(&self) -> u16 {
        self.rtp_session().map(|r| r.avpf_rr_interval()).unwrap_or(0)
    }

    /// Outgoing SSRC
    pub fn send_ssrc(&self) -> u32 {
        self.rtp_session().map(|r| r.send_ssrc()).unwrap_or(0)
    }

    /// Remote SSRC
    pub fn recv_ssrc(&self) -> u32 {
        self.rtp_session().map(|r| r.recv_ssrc()).unwrap_or(0)
    }

    // ---- Quality ----

    /// Quality indicator, once started
    pub fn quality_indicator(&self) -> Option<&QualityIndicator> {
        self.quality.as_ref()
    }

    /// Latest rating, -1 without a quality indicator
    pub fn quality_rating(&self) -> f32 {
        self.quality.as_ref().map(|qi| qi.rating()).unwrap_or(-1.0)
    }

    /// Average rating, -1 without a quality indicator
    pub fn average_quality_rating(&self) -> f32 {
        self.quality.as_ref().map(|qi| qi.average_rating()).unwrap_or(-1.0)
    }

    /// Latest local rating, -1 without a quality indicator
    pub fn lq_quality_rating(&self) -> f32 {
        self.quality.as_ref().map(|qi| qi.lq_rating()).unwrap_or(-1.0)
    }

    /// Average local rating, -1 without a quality indicator
    pub fn average_lq_quality_rating(&self) -> f32 {
        self.quality.as_ref().map(|qi| qi.average_lq_rating()).unwrap_or(-1.0)
    }

    // ---- Codecs ----

    /// Install the encoder TMMBR and rate control act upon
    pub fn set_encoder(&mut self, encoder: Box<dyn Encoder>) {
        debug!(stream_id = %self.id, encoder = encoder.name(), "Encoder set");
        self.encoder = Some(encoder);
    }

    /// Install the decoder. Video decoders freeze on failure until the
    /// next key frame.
    pub fn set_decoder(&mut self, decoder: Box<dyn Decoder>) {
        debug!(stream_id = %self.id, decoder = decoder.name(), "Decoder set");
        self.decoder = Some(DecoderGate::new(
            decoder,
            DEFAULT_FRAME_SLOT_CAPACITY,
            self.queue.teardown_handle(),
            self.media_type.is_video(),
        ));
    }

    /// Hand an encoded frame to the decoder. `Ok(false)` when it was
    /// dropped while waiting for a key frame.
    pub fn feed_encoded(&mut self, frame: &EncodedFrame) -> StreamResult<bool> {
        let gate = self.decoder.as_mut().ok_or_else(|| StreamError::InvalidState {
            state: "no decoder".to_string(),
        })?;
        gate.feed(frame)
    }

    /// Next decoded frame
    pub fn fetch_decoded(&mut self) -> DecodeStatus {
        match self.decoder.as_mut() {
            Some(gate) => gate.fetch(),
            None => DecodeStatus::NoFrameAvailable,
        }
    }

    /// Whether the decoder waits for a key frame
    pub fn decoder_frozen(&self) -> bool {
        self.decoder.as_ref().map(|g| g.is_frozen()).unwrap_or(false)
    }

    // ---- FEC ----

    /// Stand up the FlexFEC session when `profile` carries a `flexfec`
    /// payload. Idempotent once the FEC session exists.
    pub fn handle_fec(&mut self, profile: &RtpProfile) -> StreamResult<()> {
        let Some(payload) = profile.payload_from_mime(FLEXFEC_MIME) else {
            return Ok(());
        };
        let stream_id = self.id;
        let rtp = self.sessions.rtp_session.as_mut().ok_or_else(no_transport)?;
        rtp.set_jitter_compensation(FEC_JITTER_COMPENSATION_MS);

        if self.sessions.fec_session.is_some() {
            debug!(%stream_id, "FEC session already set up");
            return Ok(());
        }

        let mut fec = RtpSession::new(SessionMode::SendRecv);
        rtp.copy_modes_to(&mut fec);
        fec.enable_avpf_tmmbr(true);
        fec.set_profile(profile.clone());
        fec.set_payload_type(payload.number);

        let existing = rtp.bundle().map(|membership| membership.bundle.clone());
        let bundle = match existing {
            Some(bundle) => bundle,
            None => {
                let bundle = RtpBundle::new();
                bundle.add_session(rtp);
                bundle
            }
        };
        bundle.add_fec_session(rtp, &mut fec);

        let params = extract_fec_params(payload.recv_fmtp.as_deref());
        let mut fec_stream = FecStream::new(params, rtp.id(), fec.id());
        fec_stream.init();
        info!(
            %stream_id,
            fec_session_id = %fec.id(),
            payload_type = payload.number,
            bundle_id = %bundle.id(),
            "FEC session created"
        );

        self.fec_stream = Some(fec_stream);
        self.sessions.fec_session = Some(fec);
        let binding = self.binding()?;
        self.sessions.security.bind(Some(binding));
        Ok(())
    }

    // ---- Events ----

    /// Sender for collaborators posting events from other threads
    pub fn event_sender(&self) -> EventSender {
        self.queue.sender()
    }

    /// Register a handler invoked for each received sub-packet of
    /// `packet_type`
    pub fn connect_rtcp_handler(&mut self, packet_type: RtcpPacketType, handler: RtcpHandler) -> HandlerToken {
        self.dispatcher.connect(packet_type, handler)
    }

    /// Remove a handler
    pub fn disconnect_rtcp_handler(&mut self, token: HandlerToken) -> bool {
        self.dispatcher.disconnect(token)
    }

    /// Log a summary of the stream
    pub fn print_summary(&self) {
        info!(stream_id = %self.id, media = %self.media_type, "Stream summary");
        let Some(rtp) = self.sessions.rtp_session.as_ref() else {
            info!(stream_id = %self.id, "No RTP session, sessions were reclaimed");
            return;
        };
        info!(
            send_ssrc = rtp.send_ssrc(),
            send_ssrc_hex = %format!("{:x}", rtp.send_ssrc()),
            recv_ssrc = rtp.recv_ssrc(),
            recv_ssrc_hex = %format!("{:x}", rtp.recv_ssrc()),
            "SSRCs"
        );
        if let Some(ice) = self.ice_check_list.as_ref() {
            ice.print_route("ICE route:");
        }
        let stats = rtp.stats();
        info!(
            packet_sent = stats.packet_sent,
            bytes_sent = stats.bytes_sent,
            packet_recv = stats.packet_recv,
            bytes_recv = stats.bytes_recv,
            cum_packet_loss = stats.cum_packet_loss,
            duplicated = stats.duplicated,
            "RTP statistics"
        );
        if let Some(fec) = self.fec_stream.as_ref() {
            fec.log_stats();
        }
    }

    /// Move the owned sessions out. The stream is left without transport,
    /// security, FEC session or ticker, and its teardown releases nothing.
    pub fn reclaim_sessions(&mut self) -> StreamSessions {
        let mut reclaimed = {
            let _guard = self.queue.lock();
            std::mem::take(&mut self.sessions)
        };
        reclaimed.security.bind(None);
        if let Some(ticker) = reclaimed.ticker.as_mut() {
            ticker.detach(self.id);
        }
        self.fec_stream = None;
        info!(stream_id = %self.id, "Sessions reclaimed");
        reclaimed
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.queue.begin_teardown();
        if let Some(gate) = self.decoder.as_mut() {
            gate.close();
        }
        self.dispatcher.clear();
        if let Some(ticker) = self.sessions.ticker.as_mut() {
            ticker.detach(self.id);
        }
        debug!(stream_id = %self.id, owned = !self.sessions.is_empty(), "Stream session dropped");
    }
}
