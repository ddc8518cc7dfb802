//! Call quality indicator
//!
//! Rates the call on a 0-5 scale. The remote rating comes from the reception
//! reports the peer sends us; the listening-quality (lq) rating comes from
//! our own receive statistics, sampled at most once per second.
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

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rtcp::{ReceptionReport, RtcpPacket};
use crate::transport::{JitterStats, RtpStats};

/// Best possible rating
pub const MAX_RATING: f32 = 5.0;

/// Quality level derived from a rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionQuality {
    /// Rating >= 4
    Excellent,
    /// Rating >= 3
    Good,
    /// Rating >= 2
    Fair,
    /// Anything below
    Poor,
}

impl ConnectionQuality {
    /// Level for a 0-5 rating
    pub fn from_rating(rating: f32) -> Self {
        if rating >= 4.0 {
            ConnectionQuality::Excellent
        } else if rating >= 3.0 {
            ConnectionQuality::Good
        } else if rating >= 2.0 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }

    /// Get quality as string
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
        }
    }
}

/// Rating for a loss ratio (0.0-1.0) and a jitter in milliseconds
fn compute_rating(loss_ratio: f32, jitter_ms: f32) -> f32 {
    let loss_pct = loss_ratio.clamp(0.0, 1.0) * 100.0;
    let loss_factor = (-loss_pct / 10.0).exp();
    let jitter_factor = 1.0 / (1.0 + (jitter_ms.max(0.0) / 100.0).powi(2));
    (MAX_RATING * loss_factor * jitter_factor).clamp(0.0, MAX_RATING)
}

#[derive(Debug, Clone, Copy, Default)]
struct RunningAverage {
    sum: f64,
    count: u32,
}

impl RunningAverage {
    fn push(&mut self, value: f32) {
        self.sum += value as f64;
        self.count += 1;
    }

    fn get(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.sum / self.count as f64) as f32)
    }
}

/// Quality indicator for one stream
#[derive(Debug, Clone)]
pub struct QualityIndicator {
    clock_rate: u32,
    rating: f32,
    lq_rating: f32,
    ratings: RunningAverage,
    lq_ratings: RunningAverage,
    remote_loss_rate: f32,
    remote_jitter_ms: f32,
    local_loss_rate: f32,
    local_jitter_ms: f32,
    last_local_update: Option<u64>,
    last_recv: u64,
    last_lost: i64,
}

impl QualityIndicator {
    /// Create an indicator for a stream with the given RTP clock rate
    pub fn new(clock_rate: u32) -> Self {
        QualityIndicator {
            clock_rate: clock_rate.max(1),
            rating: MAX_RATING,
            lq_rating: MAX_RATING,
            ratings: RunningAverage::default(),
            lq_ratings: RunningAverage::default(),
            remote_loss_rate: 0.0,
            remote_jitter_ms: 0.0,
            local_loss_rate: 0.0,
            local_jitter_ms: 0.0,
            last_local_update: None,
            last_recv: 0,
            last_lost: 0,
        }
    }

    /// Change the clock rate used to convert jitter
    pub fn set_clock_rate(&mut self, clock_rate: u32) {
        self.clock_rate = clock_rate.max(1);
    }

    fn ts_to_ms(&self, ts: u32) -> f32 {
        ts as f32 * 1000.0 / self.clock_rate as f32
    }

    /// Feed one RTCP sub-packet. Only SR and RR carry what we need.
    pub fn update_from_feedback(&mut self, packet: &RtcpPacket) {
        let Some(report) = packet.reception_reports().first() else {
            return;
        };
        self.update_from_report(report);
    }

    fn update_from_report(&mut self, report: &ReceptionReport) {
        self.remote_loss_rate = report.loss_ratio() * 100.0;
        self.remote_jitter_ms = self.ts_to_ms(report.jitter);
        self.rating = compute_rating(report.loss_ratio(), self.remote_jitter_ms);
        self.ratings.push(self.rating);
        debug!(
            loss_pct = self.remote_loss_rate,
            jitter_ms = self.remote_jitter_ms,
            rating = self.rating,
            "Remote quality updated"
        );
    }

    /// Sample local receive statistics. Ignored when called again within
    /// the same second. Returns whether a sample was taken.
    pub fn update_local(&mut self, now_secs: u64, stats: &RtpStats, jitter: &JitterStats) -> bool {
        if self.last_local_update == Some(now_secs) {
            return false;
        }
        self.last_local_update = Some(now_secs);

        let recv = stats.packet_recv.saturating_sub(self.last_recv);
        let lost = (stats.cum_packet_loss - self.last_lost).max(0) as u64;
        self.last_recv = stats.packet_recv;
        self.last_lost = stats.cum_packet_loss;
        if recv + lost == 0 {
            return true;
        }

        self.local_loss_rate = lost as f32 * 100.0 / (recv + lost) as f32;
        self.local_jitter_ms = self.ts_to_ms(jitter.jitter);
        self.lq_rating = compute_rating(self.local_loss_rate / 100.0, self.local_jitter_ms);
        self.lq_ratings.push(self.lq_rating);
        true
    }

    /// Latest remote rating
    pub fn rating(&self) -> f32 {
        self.rating
    }

    /// Average of remote ratings so far
    pub fn average_rating(&self) -> f32 {
        self.ratings.get().unwrap_or(self.rating)
    }

    /// Latest listening-quality rating
    pub fn lq_rating(&self) -> f32 {
        self.lq_rating
    }

    /// Average of listening-quality ratings so far
    pub fn average_lq_rating(&self) -> f32 {
        self.lq_ratings.get().unwrap_or(self.lq_rating)
    }

    /// Loss reported by the peer (percent)
    pub fn remote_loss_rate(&self) -> f32 {
        self.remote_loss_rate
    }

    /// Loss we observe (percent)
    pub fn local_loss_rate(&self) -> f32 {
        self.local_loss_rate
    }

    /// Quality level for the current rating
    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::from_rating(self.rating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::ReceiverReport;

    fn report(fraction_lost: u8, jitter: u32) -> RtcpPacket {
        RtcpPacket::ReceiverReport(ReceiverReport::new(
            1,
            vec![ReceptionReport {
                ssrc: 2,
                fraction_lost,
                cumulative_packets_lost: 0,
                extended_sequence_number: 100,
                jitter,
                last_sr_timestamp: 0,
                delay_since_last_sr: 0,
            }],
        ))
    }

    #[test]
    fn test_clean_network_rates_max() {
        let mut qi = QualityIndicator::new(8000);
        qi.update_from_feedback(&report(0, 0));
        assert_eq!(qi.rating(), MAX_RATING);
        assert_eq!(qi.quality(), ConnectionQuality::Excellent);
    }

    #[test]
    fn test_loss_lowers_rating() {
        let mut qi = QualityIndicator::new(8000);
        // ~10% loss, 40 ms jitter
        qi.update_from_feedback(&report(26, 320));
        assert!(qi.rating() < 2.0);
        assert!((qi.remote_loss_rate() - 10.15).abs() < 0.1);

        qi.update_from_feedback(&report(0, 0));
        assert!(qi.average_rating() < MAX_RATING);
        assert!(qi.average_rating() > qi.rating() / 2.0);
    }

    #[test]
    fn test_local_sampling_throttled() {
        let mut qi = QualityIndicator::new(8000);
        let jitter = JitterStats::default();
        let mut stats = RtpStats {
            packet_recv: 90,
            cum_packet_loss: 10,
            ..Default::default()
        };
        assert!(qi.update_local(100, &stats, &jitter));
        assert!((qi.local_loss_rate() - 10.0).abs() < f32::EPSILON);

        stats.packet_recv = 200;
        assert!(!qi.update_local(100, &stats, &jitter));
        assert!(qi.update_local(101, &stats, &jitter));
        assert_eq!(qi.local_loss_rate(), 0.0);
        assert_eq!(qi.lq_rating(), MAX_RATING);
    }
}
