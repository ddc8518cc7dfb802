//! RTP profiles and payload type descriptions negotiated through SDP
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


use std::collections::BTreeMap;

/// A negotiated payload type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadType {
    /// Payload type number (0-127)
    pub number: u8,
    /// MIME subtype, e.g. `opus`, `H264`, `flexfec`
    pub mime: String,
    /// RTP clock rate (Hz)
    pub clock_rate: u32,
    /// Format parameters received from the remote party
    pub recv_fmtp: Option<String>,
    /// Format parameters we advertise
    pub send_fmtp: Option<String>,
}

impl PayloadType {
    /// Create a payload type without format parameters
    pub fn new(number: u8, mime: impl Into<String>, clock_rate: u32) -> Self {
        PayloadType {
            number,
            mime: mime.into(),
            clock_rate,
            recv_fmtp: None,
            send_fmtp: None,
        }
    }

    /// Attach received format parameters
    pub fn with_recv_fmtp(mut self, fmtp: impl Into<String>) -> Self {
        self.recv_fmtp = Some(fmtp.into());
        self
    }
}

/// Set of payload types bound to an RTP session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpProfile {
    /// Profile name (for logs)
    pub name: String,
    payloads: BTreeMap<u8, PayloadType>,
}

impl RtpProfile {
    /// Create an empty profile
    pub fn new(name: impl Into<String>) -> Self {
        RtpProfile {
            name: name.into(),
            payloads: BTreeMap::new(),
        }
    }

    /// Insert or replace a payload type
    pub fn set_payload(&mut self, payload: PayloadType) {
        self.payloads.insert(payload.number, payload);
    }

    /// Payload type by number
    pub fn payload(&self, number: u8) -> Option<&PayloadType> {
        self.payloads.get(&number)
    }

    /// First payload type whose MIME subtype matches (case-insensitive)
    pub fn payload_from_mime(&self, mime: &str) -> Option<&PayloadType> {
        self.payloads
            .values()
            .find(|pt| pt.mime.eq_ignore_ascii_case(mime))
    }

    /// Payload number for a MIME subtype
    pub fn payload_number_from_mime(&self, mime: &str) -> Option<u8> {
        self.payload_from_mime(mime).map(|pt| pt.number)
    }
}

/// Look up `key` in an `a=fmtp` parameter string (`k1=v1;k2=v2`)
pub fn fmtp_get_value<'a>(fmtp: &'a str, key: &str) -> Option<&'a str> {
    fmtp.split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmtp_lookup() {
        let fmtp = "repair-window=50000; L=4;D=2";
        assert_eq!(fmtp_get_value(fmtp, "repair-window"), Some("50000"));
        assert_eq!(fmtp_get_value(fmtp, "L"), Some("4"));
        assert_eq!(fmtp_get_value(fmtp, "D"), Some("2"));
        assert_eq!(fmtp_get_value(fmtp, "ToP"), None);
    }

    #[test]
    fn test_payload_from_mime() {
        let mut profile = RtpProfile::new("av");
        profile.set_payload(PayloadType::new(96, "VP8", 90000));
        profile.set_payload(PayloadType::new(118, "flexfec", 90000));

        assert_eq!(profile.payload_number_from_mime("FlexFEC"), Some(118));
        assert!(profile.payload_from_mime("red").is_none());
    }
}
