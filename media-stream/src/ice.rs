//! ICE check list seam
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
use uuid::Uuid;

use crate::transport::RtpSession;

/// ICE agent check list for one stream. Implemented by the host's ICE
/// engine.
pub trait IceCheckList: Send {
    /// Periodic processing, called once per tick
    fn process(&mut self, rtp_session: &RtpSession);

    /// A STUN packet arrived on one of the stream's sockets
    fn handle_stun(&mut self, rtp_session: &RtpSession, packet: &Bytes);

    /// The check list now serves this RTP session
    fn set_rtp_session(&mut self, rtp_session_id: Uuid);

    /// Log the selected route
    fn print_route(&self, message: &str);
}
