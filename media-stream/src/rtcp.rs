//! RTCP (RTP Control Protocol) parsing
//!
//! Implements RFC 3550 report packets and the RFC 4585/5104 feedback messages
//! a stream session reacts to. Compound packets are walked sub-packet by
//! sub-packet; a malformed sub-packet is reported and skipped.
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


use crate::error::{StreamError, StreamResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the Unix epoch
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// RTCP packet types (RFC 3550 Section 6, RFC 4585 Section 6.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacketType {
    /// Sender Report (SR) - 200
    SenderReport = 200,
    /// Receiver Report (RR) - 201
    ReceiverReport = 201,
    /// Source Description (SDES) - 202
    SourceDescription = 202,
    /// Goodbye (BYE) - 203
    Goodbye = 203,
    /// Application Defined (APP) - 204
    ApplicationDefined = 204,
    /// Transport layer feedback (RTPFB) - 205
    TransportFeedback = 205,
    /// Payload-specific feedback (PSFB) - 206
    PayloadFeedback = 206,
}

impl TryFrom<u8> for RtcpPacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            200 => Ok(Self::SenderReport),
            201 => Ok(Self::ReceiverReport),
            202 => Ok(Self::SourceDescription),
            203 => Ok(Self::Goodbye),
            204 => Ok(Self::ApplicationDefined),
            205 => Ok(Self::TransportFeedback),
            206 => Ok(Self::PayloadFeedback),
            _ => Err(value),
        }
    }
}

/// RTCP packet header (RFC 3550 Section 6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpHeader {
    /// Version (must be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Reception report count, source count or feedback message type
    pub count: u8,
    /// Packet type
    pub packet_type: RtcpPacketType,
    /// Length in 32-bit words minus 1
    pub length: u16,
}

impl RtcpHeader {
    /// Header size in bytes
    pub const SIZE: usize = 4;

    /// Parse RTCP header from bytes
    pub fn parse(data: &[u8]) -> StreamResult<(Self, &[u8])> {
        if data.len() < Self::SIZE {
            return Err(StreamError::ProtocolParse(
                "RTCP header too short".to_string()
            ));
        }

        let first_byte = data[0];
        let version = (first_byte >> 6) & 0x03;
        if version != 2 {
            return Err(StreamError::ProtocolParse(
                format!("Invalid RTCP version: {}", version)
            ));
        }
        let padding = (first_byte & 0x20) != 0;
        let count = first_byte & 0x1F;
        let length = u16::from_be_bytes([data[2], data[3]]);

        let packet_type = RtcpPacketType::try_from(data[1]).map_err(|pt| {
            StreamError::ProtocolParse(format!("Unknown RTCP packet type: {}", pt))
        })?;

        let header = RtcpHeader {
            version,
            padding,
            count,
            packet_type,
            length,
        };

        Ok((header, &data[Self::SIZE..]))
    }

    /// Total packet size in bytes, header included
    pub fn packet_len(&self) -> usize {
        (self.length as usize + 1) * 4
    }

    /// Serialize RTCP header to bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);

        let mut first_byte = (self.version & 0x03) << 6;
        if self.padding {
            first_byte |= 0x20;
        }
        first_byte |= self.count & 0x1F;

        buf.put_u8(first_byte);
        buf.put_u8(self.packet_type as u8);
        buf.put_u16(self.length);

        buf
    }
}

/// Reception report block (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionReport {
    /// SSRC of source
    pub ssrc: u32,
    /// Fraction lost (8 bits, fixed point /256)
    pub fraction_lost: u8,
    /// Cumulative number of packets lost (24 bits, signed)
    pub cumulative_packets_lost: i32,
    /// Extended highest sequence number received
    pub extended_sequence_number: u32,
    /// Interarrival jitter, in timestamp units
    pub jitter: u32,
    /// Last SR timestamp (LSR)
    pub last_sr_timestamp: u32,
    /// Delay since last SR (DLSR), 1/65536 s
    pub delay_since_last_sr: u32,
}

impl ReceptionReport {
    /// Wire size of one report block
    pub const SIZE: usize = 24;

    fn parse(data: &[u8]) -> StreamResult<Self> {
        if data.len() < Self::SIZE {
            return Err(StreamError::ProtocolParse(
                "Reception report block truncated".to_string()
            ));
        }
        let lost_raw = u32::from_be_bytes([0, data[5], data[6], data[7]]);
        // Sign-extend the 24-bit value
        let cumulative_packets_lost = ((lost_raw << 8) as i32) >> 8;

        Ok(ReceptionReport {
            ssrc: read_u32(data, 0),
            fraction_lost: data[4],
            cumulative_packets_lost,
            extended_sequence_number: read_u32(data, 8),
            jitter: read_u32(data, 12),
            last_sr_timestamp: read_u32(data, 16),
            delay_since_last_sr: read_u32(data, 20),
        })
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        // Cumulative packets lost (24 bits signed)
        let lost_bytes = self.cumulative_packets_lost.to_be_bytes();
        buf.put_u8(lost_bytes[1]);
        buf.put_u8(lost_bytes[2]);
        buf.put_u8(lost_bytes[3]);
        buf.put_u32(self.extended_sequence_number);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr_timestamp);
        buf.put_u32(self.delay_since_last_sr);
    }

    /// Fraction lost as a ratio in 0.0..=1.0
    pub fn loss_ratio(&self) -> f32 {
        self.fraction_lost as f32 / 256.0
    }
}

/// RTCP Sender Report (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone)]
pub struct SenderReport {
    /// SSRC of sender
    pub ssrc: u32,
    /// NTP timestamp (most significant word)
    pub ntp_timestamp_msw: u32,
    /// NTP timestamp (least significant word)
    pub ntp_timestamp_lsw: u32,
    /// RTP timestamp
    pub rtp_timestamp: u32,
    /// Sender's packet count
    pub sender_packet_count: u32,
    /// Sender's octet count
    pub sender_octet_count: u32,
    /// Reception report blocks (0-31)
    pub reception_reports: Vec<ReceptionReport>,
}

impl SenderReport {
    /// Create a new Sender Report stamped with the current wall clock
    pub fn new(
        ssrc: u32,
        rtp_timestamp: u32,
        sender_packet_count: u32,
        sender_octet_count: u32,
        reception_reports: Vec<ReceptionReport>,
    ) -> Self {
        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        SenderReport {
            ssrc,
            ntp_timestamp_msw: (unix_secs + NTP_UNIX_OFFSET) as u32,
            ntp_timestamp_lsw: 0,
            rtp_timestamp,
            sender_packet_count,
            sender_octet_count,
            reception_reports,
        }
    }

    fn parse(header: &RtcpHeader, body: &[u8]) -> StreamResult<Self> {
        if body.len() < 24 {
            return Err(StreamError::ProtocolParse("SR sender info truncated".to_string()));
        }
        let reception_reports = parse_report_blocks(header.count, &body[24..])?;
        Ok(SenderReport {
            ssrc: read_u32(body, 0),
            ntp_timestamp_msw: read_u32(body, 4),
            ntp_timestamp_lsw: read_u32(body, 8),
            rtp_timestamp: read_u32(body, 12),
            sender_packet_count: read_u32(body, 16),
            sender_octet_count: read_u32(body, 20),
            reception_reports,
        })
    }

    /// Serialize Sender Report to bytes (RFC 3550 compliant)
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(&report_header(RtcpPacketType::SenderReport, self.reception_reports.len()).serialize());

        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp_timestamp_msw);
        buf.put_u32(self.ntp_timestamp_lsw);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.sender_packet_count);
        buf.put_u32(self.sender_octet_count);

        for report in self.reception_reports.iter().take(31) {
            report.serialize_into(&mut buf);
        }

        patch_length(&mut buf);
        buf
    }
}

/// RTCP Receiver Report (RFC 3550 Section 6.4.2)
#[derive(Debug, Clone)]
pub struct ReceiverReport {
    /// SSRC of receiver
    pub ssrc: u32,
    /// Reception report blocks (0-31)
    pub reception_reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    /// Create a new Receiver Report
    pub fn new(ssrc: u32, reception_reports: Vec<ReceptionReport>) -> Self {
        ReceiverReport {
            ssrc,
            reception_reports,
        }
    }

    fn parse(header: &RtcpHeader, body: &[u8]) -> StreamResult<Self> {
        if body.len() < 4 {
            return Err(StreamError::ProtocolParse("RR truncated".to_string()));
        }
        Ok(ReceiverReport {
            ssrc: read_u32(body, 0),
            reception_reports: parse_report_blocks(header.count, &body[4..])?,
        })
    }

    /// Serialize Receiver Report to bytes (RFC 3550 compliant)
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(&report_header(RtcpPacketType::ReceiverReport, self.reception_reports.len()).serialize());

        buf.put_u32(self.ssrc);
        for report in self.reception_reports.iter().take(31) {
            report.serialize_into(&mut buf);
        }

        patch_length(&mut buf);
        buf
    }
}

/// Feedback message types carried in RTPFB packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpfbType {
    /// Generic NACK (RFC 4585)
    Nack,
    /// Temporary Maximum Media Stream Bit Rate Request (RFC 5104)
    Tmmbr,
    /// Temporary Maximum Media Stream Bit Rate Notification (RFC 5104)
    Tmmbn,
    /// Anything else (TWCC, ...)
    Other(u8),
}

impl From<u8> for RtpfbType {
    fn from(fmt: u8) -> Self {
        match fmt {
            1 => RtpfbType::Nack,
            3 => RtpfbType::Tmmbr,
            4 => RtpfbType::Tmmbn,
            other => RtpfbType::Other(other),
        }
    }
}

impl RtpfbType {
    fn fmt(self) -> u8 {
        match self {
            RtpfbType::Nack => 1,
            RtpfbType::Tmmbr => 3,
            RtpfbType::Tmmbn => 4,
            RtpfbType::Other(fmt) => fmt,
        }
    }
}

/// One TMMBR/TMMBN FCI entry (RFC 5104 Section 4.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmmbrEntry {
    /// SSRC the limit applies to
    pub ssrc: u32,
    /// Maximum total media bit rate (bps)
    pub max_bitrate: u64,
    /// Measured per-packet overhead (bytes)
    pub overhead: u16,
}

impl TmmbrEntry {
    const SIZE: usize = 8;

    fn parse(data: &[u8]) -> Self {
        let word = read_u32(data, 4);
        let exp = (word >> 26) & 0x3F;
        let mantissa = ((word >> 9) & 0x1_FFFF) as u64;
        TmmbrEntry {
            ssrc: read_u32(data, 0),
            max_bitrate: mantissa << exp,
            overhead: (word & 0x1FF) as u16,
        }
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        let mut exp = 0u32;
        while (self.max_bitrate >> exp) >= (1 << 17) {
            exp += 1;
        }
        let mantissa = (self.max_bitrate >> exp) as u32;
        buf.put_u32(self.ssrc);
        buf.put_u32((exp << 26) | (mantissa << 9) | (self.overhead as u32 & 0x1FF));
    }
}

/// RTPFB packet (RFC 4585 Section 6.2)
#[derive(Debug, Clone)]
pub struct TransportFeedback {
    /// Feedback message type
    pub feedback_type: RtpfbType,
    /// SSRC of packet sender
    pub sender_ssrc: u32,
    /// SSRC of media source
    pub media_ssrc: u32,
    /// Feedback control information
    pub fci: Bytes,
}

impl TransportFeedback {
    fn parse(header: &RtcpHeader, body: &Bytes) -> StreamResult<Self> {
        if body.len() < 8 {
            return Err(StreamError::ProtocolParse("RTPFB truncated".to_string()));
        }
        Ok(TransportFeedback {
            feedback_type: RtpfbType::from(header.count),
            sender_ssrc: read_u32(body, 0),
            media_ssrc: read_u32(body, 4),
            fci: body.slice(8..),
        })
    }

    /// Build a TMMBR request carrying a single entry
    pub fn tmmbr(sender_ssrc: u32, target_ssrc: u32, max_bitrate: u64) -> Self {
        let mut fci = BytesMut::with_capacity(TmmbrEntry::SIZE);
        TmmbrEntry {
            ssrc: target_ssrc,
            max_bitrate,
            overhead: 0,
        }
        .serialize_into(&mut fci);

        TransportFeedback {
            feedback_type: RtpfbType::Tmmbr,
            sender_ssrc,
            media_ssrc: 0,
            fci: fci.freeze(),
        }
    }

    /// TMMBR/TMMBN entries, empty for other feedback types
    pub fn tmmbr_entries(&self) -> StreamResult<Vec<TmmbrEntry>> {
        match self.feedback_type {
            RtpfbType::Tmmbr | RtpfbType::Tmmbn => {}
            _ => return Ok(Vec::new()),
        }
        if self.fci.is_empty() || self.fci.len() % TmmbrEntry::SIZE != 0 {
            return Err(StreamError::ProtocolParse(format!(
                "TMMBR FCI length {} is not a multiple of {}",
                self.fci.len(),
                TmmbrEntry::SIZE
            )));
        }
        Ok(self.fci.chunks(TmmbrEntry::SIZE).map(TmmbrEntry::parse).collect())
    }

    /// Maximum bitrate of the first TMMBR entry
    pub fn tmmbr_max_bitrate(&self) -> StreamResult<Option<u64>> {
        if self.feedback_type != RtpfbType::Tmmbr {
            return Ok(None);
        }
        Ok(self.tmmbr_entries()?.first().map(|e| e.max_bitrate))
    }

    /// Serialize RTPFB packet to bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: self.feedback_type.fmt(),
            packet_type: RtcpPacketType::TransportFeedback,
            length: 0,
        };
        buf.put_slice(&header.serialize());
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf.put_slice(&self.fci);
        patch_length(&mut buf);
        buf
    }
}

/// PSFB packet (RFC 4585 Section 6.3)
#[derive(Debug, Clone)]
pub struct PayloadFeedback {
    /// Feedback message type (1 = PLI, 2 = SLI, 3 = RPSI, 4 = FIR, 15 = AFB)
    pub fmt: u8,
    /// SSRC of packet sender
    pub sender_ssrc: u32,
    /// SSRC of media source
    pub media_ssrc: u32,
    /// Feedback control information
    pub fci: Bytes,
}

/// One parsed sub-packet of a compound RTCP packet
#[derive(Debug, Clone)]
pub enum RtcpPacket {
    /// SR
    SenderReport(SenderReport),
    /// RR
    ReceiverReport(ReceiverReport),
    /// RTPFB
    TransportFeedback(TransportFeedback),
    /// PSFB
    PayloadFeedback(PayloadFeedback),
    /// SDES, BYE, APP: passed through unparsed
    Other {
        /// Packet type
        packet_type: RtcpPacketType,
        /// Whole sub-packet, header included
        raw: Bytes,
    },
}

impl RtcpPacket {
    /// Packet type of this sub-packet
    pub fn packet_type(&self) -> RtcpPacketType {
        match self {
            RtcpPacket::SenderReport(_) => RtcpPacketType::SenderReport,
            RtcpPacket::ReceiverReport(_) => RtcpPacketType::ReceiverReport,
            RtcpPacket::TransportFeedback(_) => RtcpPacketType::TransportFeedback,
            RtcpPacket::PayloadFeedback(_) => RtcpPacketType::PayloadFeedback,
            RtcpPacket::Other { packet_type, .. } => *packet_type,
        }
    }

    /// Reception report blocks carried by SR/RR, empty otherwise
    pub fn reception_reports(&self) -> &[ReceptionReport] {
        match self {
            RtcpPacket::SenderReport(sr) => &sr.reception_reports,
            RtcpPacket::ReceiverReport(rr) => &rr.reception_reports,
            _ => &[],
        }
    }

    fn parse(packet: Bytes) -> StreamResult<Self> {
        let (header, _) = RtcpHeader::parse(&packet)?;
        let body = packet.slice(RtcpHeader::SIZE..);
        match header.packet_type {
            RtcpPacketType::SenderReport => Ok(RtcpPacket::SenderReport(SenderReport::parse(&header, &body)?)),
            RtcpPacketType::ReceiverReport => Ok(RtcpPacket::ReceiverReport(ReceiverReport::parse(&header, &body)?)),
            RtcpPacketType::TransportFeedback => {
                Ok(RtcpPacket::TransportFeedback(TransportFeedback::parse(&header, &body)?))
            }
            RtcpPacketType::PayloadFeedback => {
                if body.len() < 8 {
                    return Err(StreamError::ProtocolParse("PSFB truncated".to_string()));
                }
                Ok(RtcpPacket::PayloadFeedback(PayloadFeedback {
                    fmt: header.count,
                    sender_ssrc: read_u32(&body, 0),
                    media_ssrc: read_u32(&body, 4),
                    fci: body.slice(8..),
                }))
            }
            packet_type => Ok(RtcpPacket::Other { packet_type, raw: packet }),
        }
    }
}

/// Iterator over the sub-packets of a compound RTCP packet.
///
/// Framing uses each sub-packet's length field, so a sub-packet whose body
/// does not parse yields an `Err` and the walk resumes at the next one. A
/// header that cannot be framed (short, wrong version, length past the end of
/// the datagram) ends the walk after yielding its error.
pub struct CompoundPacket {
    data: Bytes,
    offset: usize,
    done: bool,
}

impl CompoundPacket {
    /// Start walking a received datagram
    pub fn new(data: Bytes) -> Self {
        CompoundPacket {
            data,
            offset: 0,
            done: false,
        }
    }

    /// Quick check for logging: does the first sub-packet look like SR/RR?
    pub fn first_type(data: &[u8]) -> Option<RtcpPacketType> {
        data.get(1).and_then(|pt| RtcpPacketType::try_from(*pt).ok())
    }
}

impl Iterator for CompoundPacket {
    type Item = StreamResult<RtcpPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }

        let remaining = &self.data[self.offset..];
        if remaining.len() < RtcpHeader::SIZE {
            self.done = true;
            return Some(Err(StreamError::ProtocolParse(format!(
                "{} trailing bytes after last RTCP sub-packet",
                remaining.len()
            ))));
        }
        let version = remaining[0] >> 6;
        if version != 2 {
            self.done = true;
            return Some(Err(StreamError::ProtocolParse(format!(
                "Invalid RTCP version: {}",
                version
            ))));
        }
        let len = (u16::from_be_bytes([remaining[2], remaining[3]]) as usize + 1) * 4;
        if len > remaining.len() {
            self.done = true;
            return Some(Err(StreamError::ProtocolParse(format!(
                "RTCP sub-packet claims {} bytes, {} available",
                len,
                remaining.len()
            ))));
        }

        let packet = self.data.slice(self.offset..self.offset + len);
        self.offset += len;
        Some(RtcpPacket::parse(packet))
    }
}

fn report_header(packet_type: RtcpPacketType, report_count: usize) -> RtcpHeader {
    RtcpHeader {
        version: 2,
        padding: false,
        count: report_count.min(31) as u8,
        packet_type,
        length: 0, // patched after serialization
    }
}

fn patch_length(buf: &mut BytesMut) {
    let length_words = (buf.len() / 4).saturating_sub(1) as u16;
    buf[2..4].copy_from_slice(&length_words.to_be_bytes());
}

fn parse_report_blocks(count: u8, data: &[u8]) -> StreamResult<Vec<ReceptionReport>> {
    let needed = count as usize * ReceptionReport::SIZE;
    if data.len() < needed {
        return Err(StreamError::ProtocolParse(format!(
            "{} report blocks need {} bytes, {} available",
            count,
            needed,
            data.len()
        )));
    }
    data.chunks(ReceptionReport::SIZE)
        .take(count as usize)
        .map(ReceptionReport::parse)
        .collect()
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(ssrc: u32, fraction_lost: u8, jitter: u32) -> ReceptionReport {
        ReceptionReport {
            ssrc,
            fraction_lost,
            cumulative_packets_lost: -3,
            extended_sequence_number: 1000,
            jitter,
            last_sr_timestamp: 0,
            delay_since_last_sr: 0,
        }
    }

    #[test]
    fn test_rtcp_header_parse() {
        let data = [
            0x81, 0xC8, // V=2, P=0, RC=1, PT=200 (SR)
            0x00, 0x06, // Length = 7 words (28 bytes)
        ];

        let (header, _) = RtcpHeader::parse(&data).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.padding, false);
        assert_eq!(header.count, 1);
        assert_eq!(header.packet_type, RtcpPacketType::SenderReport);
        assert_eq!(header.packet_len(), 28);
    }

    #[test]
    fn test_sender_report_serialize() {
        let report = SenderReport::new(12345, 1000, 100, 10000, vec![]);
        let serialized = report.serialize();
        assert_eq!(serialized.len(), 28); // Minimum SR size
    }

    #[test]
    fn test_report_blocks_parse() {
        let rr = ReceiverReport::new(42, vec![report(7, 64, 160)]);
        let mut walk = CompoundPacket::new(rr.serialize().freeze());

        match walk.next() {
            Some(Ok(RtcpPacket::ReceiverReport(parsed))) => {
                assert_eq!(parsed.ssrc, 42);
                assert_eq!(parsed.reception_reports.len(), 1);
                assert_eq!(parsed.reception_reports[0].cumulative_packets_lost, -3);
                assert_eq!(parsed.reception_reports[0].loss_ratio(), 0.25);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_tmmbr_bitrate_encoding() {
        for bitrate in [64_000u64, 300_000, 500_000, 2_000_000] {
            let fb = TransportFeedback::tmmbr(1, 2, bitrate);
            let bytes = fb.serialize().freeze();
            let parsed = match CompoundPacket::new(bytes).next() {
                Some(Ok(RtcpPacket::TransportFeedback(fb))) => fb,
                other => panic!("unexpected {:?}", other),
            };
            assert_eq!(parsed.feedback_type, RtpfbType::Tmmbr);
            assert_eq!(parsed.tmmbr_max_bitrate().unwrap(), Some(bitrate));
        }
    }

    #[test]
    fn test_malformed_subpacket_is_skipped() {
        let mut data = BytesMut::new();
        // RR claiming two report blocks but carrying none
        data.put_slice(&[0x82, 0xC9, 0x00, 0x01, 0, 0, 0, 1]);
        data.put_slice(&ReceiverReport::new(9, vec![report(1, 0, 0)]).serialize());

        let results: Vec<_> = CompoundPacket::new(data.freeze()).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert!(matches!(results[1], Ok(RtcpPacket::ReceiverReport(_))));
    }

    #[test]
    fn test_truncated_tail_ends_walk() {
        let mut data = BytesMut::new();
        data.put_slice(&ReceiverReport::new(9, vec![report(1, 0, 0)]).serialize());
        data.put_slice(&[0x80, 0xCD, 0x00, 0x09, 0xde, 0xad]);

        let results: Vec<_> = CompoundPacket::new(data.freeze()).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_captured_sr_sdes_compound() {
        // SR with no blocks followed by SDES CNAME "ab"
        let data = hex::decode(concat!(
            "80c80006", "00000001", "e6b8a1b2", "00000000", "00000640", "0000000a", "00000640",
            "81ca0002", "00000001", "01026162"
        ))
        .unwrap();

        let packets: Vec<_> = CompoundPacket::new(Bytes::from(data))
            .collect::<StreamResult<Vec<_>>>()
            .unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].packet_type(), RtcpPacketType::SenderReport);
        assert_eq!(packets[1].packet_type(), RtcpPacketType::SourceDescription);
    }
}
