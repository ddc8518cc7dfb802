//! RTCP-driven rate control
//!
//! AIMD controller fed by reception reports. The simple algorithm reacts to
//! every report; the stateful one averages a short window before moving.
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
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::codec::Encoder;
use crate::rtcp::{ReceptionReport, RtcpPacket};

/// Rate control algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BitrateAlgorithm {
    /// React to every report
    #[default]
    Simple,
    /// Average a window of reports
    Stateful,
}

/// Rate control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateControlConfig {
    /// Initial send rate (bps)
    pub initial_rate_bps: f64,
    /// Minimum send rate (bps)
    pub min_rate_bps: f64,
    /// Maximum send rate (bps)
    pub max_rate_bps: f64,
    /// Packet loss threshold (0.0 - 1.0)
    pub packet_loss_threshold: f32,
    /// RTT threshold (milliseconds)
    pub rtt_threshold_ms: f64,
    /// Additive increase rate (bps per update)
    pub additive_increase_bps: f64,
    /// Multiplicative decrease factor (0.0 - 1.0)
    pub multiplicative_decrease: f32,
    /// Reports averaged by the stateful algorithm
    pub window: usize,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        RateControlConfig {
            initial_rate_bps: 500_000.0,
            min_rate_bps: 24_000.0,
            max_rate_bps: 10_000_000.0,
            packet_loss_threshold: 0.05,    // 5% loss
            rtt_threshold_ms: 300.0,
            additive_increase_bps: 16_000.0,
            multiplicative_decrease: 0.8,   // Reduce by 20%
            window: 3,
        }
    }
}

/// Network conditions taken from one reception report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackSample {
    /// Loss ratio (0.0 - 1.0)
    pub loss_ratio: f32,
    /// Round-trip time, when the report allowed computing it
    pub rtt_ms: Option<f64>,
}

/// Middle 32 bits of the current NTP time
fn ntp_middle_now() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs() + 2_208_988_800;
    let frac = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (((secs & 0xFFFF) << 16) | (frac >> 16)) as u32
}

/// Round-trip time from LSR/DLSR (RFC 3550 Section 6.4.1)
fn rtt_from_report(report: &ReceptionReport, now_middle: u32) -> Option<f64> {
    if report.last_sr_timestamp == 0 {
        return None;
    }
    let rtt = now_middle
        .wrapping_sub(report.last_sr_timestamp)
        .wrapping_sub(report.delay_since_last_sr);
    // Negative after wrap means clocks disagree
    if rtt > 0x8000_0000 {
        return None;
    }
    Some(rtt as f64 * 1000.0 / 65536.0)
}

/// Rate controller
#[derive(Debug, Clone)]
pub struct RateController {
    algorithm: BitrateAlgorithm,
    config: RateControlConfig,
    target_rate: f64,
    pending: VecDeque<FeedbackSample>,
    window: VecDeque<FeedbackSample>,
    last_pushed: Option<i32>,
}

impl RateController {
    /// Create a controller starting from the configured initial rate
    pub fn new(algorithm: BitrateAlgorithm, config: RateControlConfig) -> Self {
        let initial = config.initial_rate_bps as i32;
        Self::with_current_rate(algorithm, config, initial)
    }

    /// Create a controller for an encoder already running at `bitrate`.
    /// Nothing is pushed until feedback moves the target away from it.
    pub fn with_current_rate(algorithm: BitrateAlgorithm, config: RateControlConfig, bitrate: i32) -> Self {
        RateController {
            algorithm,
            config,
            target_rate: bitrate as f64,
            pending: VecDeque::new(),
            window: VecDeque::new(),
            last_pushed: Some(bitrate),
        }
    }

    /// Algorithm in use
    pub fn algorithm(&self) -> BitrateAlgorithm {
        self.algorithm
    }

    /// Current target (bps)
    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    /// Queue the feedback carried by an SR or RR
    pub fn process_rtcp(&mut self, packet: &RtcpPacket) {
        let Some(report) = packet.reception_reports().first() else {
            return;
        };
        let sample = FeedbackSample {
            loss_ratio: report.loss_ratio(),
            rtt_ms: rtt_from_report(report, ntp_middle_now()),
        };
        debug!(loss = sample.loss_ratio, rtt_ms = ?sample.rtt_ms, "Rate control feedback");
        self.pending.push_back(sample);
    }

    /// Queue a sample directly
    pub fn push_sample(&mut self, sample: FeedbackSample) {
        self.pending.push_back(sample);
    }

    fn adjust(&mut self, sample: FeedbackSample) {
        let rtt = sample.rtt_ms.unwrap_or(0.0);
        let congested = sample.loss_ratio > self.config.packet_loss_threshold
            || rtt > self.config.rtt_threshold_ms;

        if congested {
            self.target_rate *= self.config.multiplicative_decrease as f64;
        } else if sample.loss_ratio < 0.01 && rtt < self.config.rtt_threshold_ms * 0.8 {
            self.target_rate += self.config.additive_increase_bps;
        }
    }

    fn averaged(&self) -> FeedbackSample {
        let n = self.window.len().max(1) as f32;
        let loss_ratio = self.window.iter().map(|s| s.loss_ratio).sum::<f32>() / n;
        let rtts: Vec<f64> = self.window.iter().filter_map(|s| s.rtt_ms).collect();
        let rtt_ms = (!rtts.is_empty()).then(|| rtts.iter().sum::<f64>() / rtts.len() as f64);
        FeedbackSample { loss_ratio, rtt_ms }
    }

    /// Run once per tick. Consumes queued feedback and, when an adjustment
    /// moved the target, pushes it into `encoder`. `ceiling` caps the target.
    /// Returns the bitrate pushed, if any.
    pub fn update(&mut self, encoder: Option<&mut (dyn Encoder + 'static)>, ceiling: Option<i32>) -> Option<i32> {
        let mut adjusted = false;
        while let Some(sample) = self.pending.pop_front() {
            match self.algorithm {
                BitrateAlgorithm::Simple => {
                    self.adjust(sample);
                    adjusted = true;
                }
                BitrateAlgorithm::Stateful => {
                    self.window.push_back(sample);
                    if self.window.len() >= self.config.window.max(1) {
                        let averaged = self.averaged();
                        self.window.clear();
                        self.adjust(averaged);
                        adjusted = true;
                    }
                }
            }
        }
        if !adjusted {
            return None;
        }

        let mut max = self.config.max_rate_bps;
        if let Some(ceiling) = ceiling.filter(|c| *c > 0) {
            max = max.min(ceiling as f64);
        }
        self.target_rate = self.target_rate.max(self.config.min_rate_bps).min(max);

        let bitrate = self.target_rate as i32;
        if self.last_pushed == Some(bitrate) {
            return None;
        }
        let encoder = encoder?;
        if let Err(e) = encoder.set_bitrate(bitrate) {
            warn!(encoder = encoder.name(), error = %e, "Rate control could not set bitrate");
            return None;
        }
        debug!(encoder = encoder.name(), bitrate, "Rate control applied bitrate");
        self.last_pushed = Some(bitrate);
        Some(bitrate)
    }
}
