//! Bitrate control driven by TMMBR
//!
//! A TMMBR from the peer caps what we may send. The cap is corrected for
//! redundancy, limited to the configured maximum, and pushed into the
//! encoder and the transport.
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

use tracing::{debug, info, warn};

use crate::codec::{Encoder, VideoConfiguration, VideoSize};
use crate::rate_control::BitrateAlgorithm;
use crate::transport::RtpSession;
use crate::types::MediaType;
use crate::video_quality::{VideoQualityConfig, VideoQualityController};

/// Video preset under which the configuration ladder is searched directly
pub const CUSTOM_VIDEO_PRESET: &str = "custom";

/// Bitrate control state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitrateControllerState {
    /// Bitrate currently requested from the encoder (bps)
    pub target_bitrate: i32,
    /// Upper bound applied to any TMMBR (bps); 0 means none
    pub max_target_bitrate: i32,
    /// Last limit applied from TMMBR
    pub last_applied_limit: Option<i32>,
    /// RTCP-driven rate control algorithm
    pub algorithm: BitrateAlgorithm,
    /// Whether RTCP-driven rate control is on
    pub enabled: bool,
}

/// What a TMMBR acts upon
pub struct TmmbrTarget<'a> {
    /// Stream media type
    pub media_type: MediaType,
    /// Transport whose target upload bandwidth follows the limit
    pub transport: &'a mut RtpSession,
    /// Encoder, when the stream sends
    pub encoder: Option<&'a mut (dyn Encoder + 'static)>,
    /// Video preset name
    pub video_preset: Option<&'a str>,
    /// CPUs available to the encoder
    pub cpu_count: usize,
    /// Whether a FEC stream protects the media
    pub fec_active: bool,
}

/// Pick the configuration with the biggest picture not larger than `vsize`
/// that the CPU count and `bitrate` allow. Falls back to the entry with the
/// lowest requirement. `required_bitrate` of the result is
/// `min(bitrate, bitrate_limit)`.
pub fn find_best_configuration(
    list: &[VideoConfiguration],
    vsize: VideoSize,
    cpu_count: usize,
    bitrate: i32,
) -> Option<VideoConfiguration> {
    let mut best: Option<&VideoConfiguration> = None;
    for conf in list {
        let fits = conf.mincpu <= cpu_count
            && conf.required_bitrate <= bitrate
            && conf.vsize.pixels() <= vsize.pixels();
        if fits && best.map_or(true, |b| conf.vsize.pixels() > b.vsize.pixels()) {
            best = Some(conf);
        }
    }
    let best = best.or_else(|| list.iter().min_by_key(|c| c.required_bitrate))?;
    let mut chosen = *best;
    chosen.required_bitrate = bitrate.min(best.bitrate_limit);
    Some(chosen)
}

/// Bitrate controller
#[derive(Debug, Clone, Default)]
pub struct BitrateController {
    state: BitrateControllerState,
    video_quality_config: VideoQualityConfig,
    video_quality: Option<VideoQualityController>,
}

impl BitrateController {
    /// Create a controller
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the state
    pub fn state(&self) -> BitrateControllerState {
        self.state
    }

    /// Requested bitrate (bps)
    pub fn target_bitrate(&self) -> i32 {
        self.state.target_bitrate
    }

    /// Set the requested bitrate (bps)
    pub fn set_target_bitrate(&mut self, bitrate: i32) {
        self.state.target_bitrate = bitrate;
    }

    /// TMMBR upper bound (bps); 0 means none
    pub fn max_target_bitrate(&self) -> i32 {
        self.state.max_target_bitrate
    }

    /// Set the TMMBR upper bound (bps)
    pub fn set_max_target_bitrate(&mut self, bitrate: i32) {
        self.state.max_target_bitrate = bitrate;
    }

    /// Record the rate control settings
    pub fn set_rate_control(&mut self, enabled: bool, algorithm: BitrateAlgorithm) {
        self.state.enabled = enabled;
        self.state.algorithm = algorithm;
    }

    /// Configuration used when the video quality controller is created
    pub fn set_video_quality_config(&mut self, config: VideoQualityConfig) {
        self.video_quality_config = config;
    }

    /// Video quality controller, once created
    pub fn video_quality(&self) -> Option<&VideoQualityController> {
        self.video_quality.as_ref()
    }

    /// Apply a TMMBR maximum bitrate. Returns the limit applied, or `None`
    /// when the request was not applicable or did not change anything.
    pub fn process_tmmbr(&mut self, target: TmmbrTarget<'_>, max_bitrate: u64) -> Option<i32> {
        let mut value = max_bitrate;

        if target.media_type == MediaType::Audio {
            if let Some(estimator) = target.transport.audio_bandwidth_estimator() {
                if estimator.duplicate_rate > 0 {
                    // Duplicated packets are counted in the peer's measurement
                    value -= value / estimator.duplicate_rate;
                    if target.fec_active {
                        // Interaction with FEC repair traffic is unverified
                        debug!(
                            duplicate_rate = estimator.duplicate_rate,
                            "TMMBR corrected for duplicates while FEC is active"
                        );
                    }
                }
            }
        }

        let mut bitrate = value.min(i32::MAX as u64) as i32;
        debug!(media = %target.media_type, max_bitrate, bitrate, "TMMBR received");

        let Some(encoder) = target.encoder else {
            warn!(media = %target.media_type, "TMMBR not applicable because no encoder for this stream");
            return None;
        };

        let max = self.state.max_target_bitrate;
        if max > 0 && bitrate > max {
            info!(requested = bitrate, max, "TMMBR limit capped to max target bitrate");
            bitrate = max;
        }

        if self.state.last_applied_limit == Some(bitrate) {
            info!(bitrate, "TMMBR limit unchanged, skipping");
            return None;
        }

        if target.media_type != MediaType::Video {
            if let Err(e) = encoder.set_bitrate(bitrate) {
                warn!(encoder = encoder.name(), error = %e, "Failed to apply TMMBR bitrate");
            }
        }

        self.state.target_bitrate = bitrate;
        self.state.last_applied_limit = Some(bitrate);
        target.transport.set_target_upload_bandwidth(bitrate);

        if target.media_type == MediaType::Video {
            if target.video_preset == Some(CUSTOM_VIDEO_PRESET) {
                self.apply_custom_preset(encoder, target.cpu_count, bitrate);
            } else {
                let config = self.video_quality_config.clone();
                let vqc = self
                    .video_quality
                    .get_or_insert_with(|| VideoQualityController::for_encoder(config, &*encoder));
                vqc.update_from_tmmbr(bitrate, encoder);
            }
        }

        info!(media = %target.media_type, bitrate, "TMMBR limit applied");
        Some(bitrate)
    }

    fn apply_custom_preset(&self, encoder: &mut dyn Encoder, cpu_count: usize, bitrate: i32) {
        let (Some(list), Some(current)) = (encoder.configuration_list(), encoder.configuration()) else {
            warn!(encoder = encoder.name(), "Encoder has no configuration list, cannot apply TMMBR");
            return;
        };
        let Some(best) = find_best_configuration(&list, current.vsize, cpu_count, bitrate) else {
            warn!(encoder = encoder.name(), "Empty configuration list, cannot apply TMMBR");
            return;
        };
        let mut conf = current;
        conf.required_bitrate = best.required_bitrate;
        info!(bitrate = conf.required_bitrate, "Changing video encoder output bitrate");
        if let Err(e) = encoder.set_configuration(&conf) {
            warn!(encoder = encoder.name(), error = %e, "Failed to apply video configuration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StreamError, StreamResult};
    use crate::transport::SessionMode;

    #[derive(Default)]
    struct RecordingEncoder {
        bitrates: Vec<i32>,
        fail: bool,
        list: Option<Vec<VideoConfiguration>>,
        current: Option<VideoConfiguration>,
    }

    impl Encoder for RecordingEncoder {
        fn name(&self) -> &str {
            "recording"
        }
        fn set_bitrate(&mut self, bitrate: i32) -> StreamResult<()> {
            self.bitrates.push(bitrate);
            if self.fail {
                return Err(StreamError::Codec("rejected".to_string()));
            }
            Ok(())
        }
        fn configuration_list(&self) -> Option<Vec<VideoConfiguration>> {
            self.list.clone()
        }
        fn configuration(&self) -> Option<VideoConfiguration> {
            self.current
        }
        fn set_configuration(&mut self, conf: &VideoConfiguration) -> StreamResult<()> {
            self.current = Some(*conf);
            Ok(())
        }
    }

    fn vconf(w: u32, h: u32, required: i32, limit: i32, mincpu: usize) -> VideoConfiguration {
        VideoConfiguration {
            required_bitrate: required,
            bitrate_limit: limit,
            vsize: VideoSize::new(w, h),
            fps: 30.0,
            mincpu,
        }
    }

    fn target<'a>(
        media_type: MediaType,
        transport: &'a mut RtpSession,
        encoder: Option<&'a mut (dyn Encoder + 'static)>,
    ) -> TmmbrTarget<'a> {
        TmmbrTarget {
            media_type,
            transport,
            encoder,
            video_preset: None,
            cpu_count: 4,
            fec_active: false,
        }
    }

    #[test]
    fn test_cap_and_skip_unchanged() {
        let mut controller = BitrateController::new();
        controller.set_max_target_bitrate(300_000);
        let mut transport = RtpSession::new(SessionMode::SendRecv);
        let mut encoder = RecordingEncoder::default();

        let applied = controller.process_tmmbr(target(MediaType::Audio, &mut transport, Some(&mut encoder)), 500_000);
        assert_eq!(applied, Some(300_000));
        assert_eq!(transport.target_upload_bandwidth(), 300_000);

        let applied = controller.process_tmmbr(target(MediaType::Audio, &mut transport, Some(&mut encoder)), 500_000);
        assert_eq!(applied, None);
        assert_eq!(encoder.bitrates, vec![300_000]);
    }

    #[test]
    fn test_no_encoder_is_not_applicable() {
        let mut controller = BitrateController::new();
        let mut transport = RtpSession::new(SessionMode::RecvOnly);
        assert_eq!(controller.process_tmmbr(target(MediaType::Audio, &mut transport, None), 64_000), None);
        assert_eq!(controller.state().last_applied_limit, None);
        assert_eq!(transport.target_upload_bandwidth(), 0);
    }

    #[test]
    fn test_audio_duplicate_correction() {
        let mut controller = BitrateController::new();
        let mut transport = RtpSession::new(SessionMode::SendRecv);
        transport.enable_audio_bandwidth_estimator(4);
        let mut encoder = RecordingEncoder::default();
        let applied = controller.process_tmmbr(target(MediaType::Audio, &mut transport, Some(&mut encoder)), 100_000);
        assert_eq!(applied, Some(75_000));
    }

    #[test]
    fn test_huge_value_clamped() {
        let mut controller = BitrateController::new();
        let mut transport = RtpSession::new(SessionMode::SendRecv);
        let mut encoder = RecordingEncoder::default();
        let applied = controller.process_tmmbr(target(MediaType::Text, &mut transport, Some(&mut encoder)), u64::MAX >> 8);
        assert_eq!(applied, Some(i32::MAX));
    }

    #[test]
    fn test_encoder_failure_still_records_target() {
        let mut controller = BitrateController::new();
        let mut transport = RtpSession::new(SessionMode::SendRecv);
        let mut encoder = RecordingEncoder { fail: true, ..Default::default() };
        let applied = controller.process_tmmbr(target(MediaType::Audio, &mut transport, Some(&mut encoder)), 32_000);
        assert_eq!(applied, Some(32_000));
        assert_eq!(controller.target_bitrate(), 32_000);
    }

    #[test]
    fn test_find_best_configuration() {
        let list = vec![
            vconf(1920, 1080, 1_500_000, 3_000_000, 4),
            vconf(1280, 720, 800_000, 1_500_000, 2),
            vconf(640, 360, 200_000, 800_000, 1),
        ];
        let best = find_best_configuration(&list, VideoSize::new(1920, 1080), 2, 1_000_000).unwrap();
        assert_eq!(best.vsize, VideoSize::new(1280, 720));
        assert_eq!(best.required_bitrate, 1_000_000);

        let best = find_best_configuration(&list, VideoSize::new(1920, 1080), 8, 5_000_000).unwrap();
        assert_eq!(best.vsize, VideoSize::new(1920, 1080));
        assert_eq!(best.required_bitrate, 3_000_000);

        // Nothing fits: lowest requirement wins
        let best = find_best_configuration(&list, VideoSize::new(1920, 1080), 1, 50_000).unwrap();
        assert_eq!(best.vsize, VideoSize::new(640, 360));
        assert_eq!(best.required_bitrate, 50_000);
    }

    #[test]
    fn test_video_custom_preset_reconfigures() {
        let mut controller = BitrateController::new();
        let mut transport = RtpSession::new(SessionMode::SendRecv);
        let mut encoder = RecordingEncoder {
            list: Some(vec![
                vconf(1280, 720, 800_000, 1_500_000, 1),
                vconf(640, 360, 200_000, 800_000, 1),
            ]),
            current: Some(vconf(1280, 720, 1_500_000, 1_500_000, 1)),
            ..Default::default()
        };
        let mut tmmbr = target(MediaType::Video, &mut transport, Some(&mut encoder));
        tmmbr.video_preset = Some(CUSTOM_VIDEO_PRESET);
        assert_eq!(controller.process_tmmbr(tmmbr, 500_000), Some(500_000));

        // Resolution is kept, only the required bitrate moves
        let current = encoder.current.unwrap();
        assert_eq!(current.vsize, VideoSize::new(1280, 720));
        assert_eq!(current.required_bitrate, 500_000);
        assert!(encoder.bitrates.is_empty());
        assert!(controller.video_quality().is_none());
    }

    #[test]
    fn test_video_default_preset_uses_quality_controller() {
        let mut controller = BitrateController::new();
        let mut transport = RtpSession::new(SessionMode::SendRecv);
        let mut encoder = RecordingEncoder::default();
        controller.process_tmmbr(target(MediaType::Video, &mut transport, Some(&mut encoder)), 600_000);
        assert!(controller.video_quality().is_some());
        assert_eq!(controller.video_quality().unwrap().last_ceiling(), Some(600_000));
        // No configuration exposed: the controller falls back to set_bitrate
        assert_eq!(encoder.bitrates, vec![600_000]);
    }
}
