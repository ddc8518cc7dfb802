//! Media stream session controller
//!
//! This crate drives one RTP media stream:
//! - Duplex RTP/RTCP transport binding
//! - Key exchange arbitration (ZRTP, DTLS-SRTP, SDES)
//! - Event queue drained once per tick
//! - RTCP feedback processing and TMMBR bitrate control
//! - FlexFEC session setup
//! - Liveness detection
//!
//! # Threading
//!
//! Everything runs on the thread calling [`StreamSession::iterate`].
//! Collaborators running elsewhere post through an [`EventSender`] or a
//! [`FrameProducer`]; both stop accepting once the stream is torn down.
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


pub mod error;
pub mod types;
pub mod clock;
pub mod crypto_suite;
pub mod profile;
pub mod rtcp;
pub mod events;
pub mod transport;
pub mod security;
pub mod quality;
pub mod rate_control;
pub mod video_quality;
pub mod bitrate;
pub mod fec;
pub mod codec;
pub mod ticker;
pub mod ice;
pub mod resource;
pub mod session;

// Re-export main types
pub use error::{StreamError, StreamResult};
pub use types::{MediaType, StreamDirection, StreamState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto_suite::{CryptoSuite, CryptoSuiteNameParams};
pub use profile::{PayloadType, RtpProfile};
pub use rtcp::{
    CompoundPacket, ReceiverReport, ReceptionReport, RtcpPacket, RtcpPacketType, SenderReport,
    TransportFeedback,
};
pub use events::{EventQueue, EventSender, HandlerToken, RtcpHandler, StreamEvent};
pub use transport::{
    create_duplex_rtp_session, RtpBundle, RtpSession, RtpStats, SessionMode, MAX_DATAGRAMS_PER_POLL,
};
pub use security::{
    DtlsRole, DtlsSrtpParams, EngineStatus, KeyExchange, SecurityContext, SecurityEngine,
    SecurityEngineFactory, SessionBinding, SrtpKeySource, ZrtpParams,
};
pub use quality::{ConnectionQuality, QualityIndicator};
pub use rate_control::{BitrateAlgorithm, RateControlConfig, RateController};
pub use video_quality::{VideoQualityConfig, VideoQualityController, VideoResolution};
pub use bitrate::{find_best_configuration, BitrateController, BitrateControllerState};
pub use fec::{extract_fec_params, FecParameters, FecStream};
pub use codec::{
    DecodeStatus, DecodedFrame, Decoder, DecoderGate, EncodedFrame, Encoder, FrameProducer,
    VideoConfiguration, VideoSize,
};
pub use ticker::{ExternalTicker, ExternalTickerFactory, Ticker, TickerFactory, TickerParams};
pub use ice::IceCheckList;
pub use resource::{MediaResource, MediaResourceType, MediaStreamIo};
pub use session::{SessionOptions, StreamSession, StreamSessions, StunSending};
