//! Video quality controller
//!
//! Moves a video encoder along a resolution ladder when the peer announces a
//! new bitrate ceiling through TMMBR.
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
use tracing::{info, warn};

use crate::codec::{Encoder, VideoSize};

/// Resolution ladder rungs, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VideoResolution {
    /// 360p (640x360)
    P360,
    /// 480p (854x480)
    P480,
    /// 720p (1280x720)
    P720,
    /// 1080p (1920x1080)
    P1080,
    /// 1440p (2560x1440)
    P1440,
    /// 4K (3840x2160)
    P4K,
    /// 5K (5120x2880)
    P5K,
    /// 8K (7680x4320)
    P8K,
}

const LADDER: [VideoResolution; 8] = [
    VideoResolution::P360,
    VideoResolution::P480,
    VideoResolution::P720,
    VideoResolution::P1080,
    VideoResolution::P1440,
    VideoResolution::P4K,
    VideoResolution::P5K,
    VideoResolution::P8K,
];

impl VideoResolution {
    /// Picture size
    pub fn size(&self) -> VideoSize {
        match self {
            VideoResolution::P360 => VideoSize::new(640, 360),
            VideoResolution::P480 => VideoSize::new(854, 480),
            VideoResolution::P720 => VideoSize::new(1280, 720),
            VideoResolution::P1080 => VideoSize::new(1920, 1080),
            VideoResolution::P1440 => VideoSize::new(2560, 1440),
            VideoResolution::P4K => VideoSize::new(3840, 2160),
            VideoResolution::P5K => VideoSize::new(5120, 2880),
            VideoResolution::P8K => VideoSize::new(7680, 4320),
        }
    }

    /// Largest rung not bigger than `size`
    pub fn from_size(size: VideoSize) -> Self {
        LADDER
            .iter()
            .rev()
            .find(|r| r.size().pixels() <= size.pixels())
            .copied()
            .unwrap_or(VideoResolution::P360)
    }

    /// Rough bitrate a rung needs (bps)
    pub fn estimated_bitrate(&self) -> i32 {
        match self {
            VideoResolution::P360 => 400_000,  // 400 kbps
            VideoResolution::P480 => 800_000,  // 800 kbps
            VideoResolution::P720 => 1_500_000,  // 1.5 Mbps
            VideoResolution::P1080 => 3_000_000,  // 3 Mbps
            VideoResolution::P1440 => 5_000_000,  // 5 Mbps
            VideoResolution::P4K => 8_000_000,  // 8 Mbps
            VideoResolution::P5K => 12_000_000,  // 12 Mbps
            VideoResolution::P8K => 20_000_000,  // 20 Mbps
        }
    }

    /// Next rung down (saturating)
    pub fn downgrade(&self) -> Self {
        match self {
            VideoResolution::P8K => VideoResolution::P5K,
            VideoResolution::P5K => VideoResolution::P4K,
            VideoResolution::P4K => VideoResolution::P1440,
            VideoResolution::P1440 => VideoResolution::P1080,
            VideoResolution::P1080 => VideoResolution::P720,
            VideoResolution::P720 => VideoResolution::P480,
            VideoResolution::P480 => VideoResolution::P360,
            VideoResolution::P360 => VideoResolution::P360, // Can't go lower
        }
    }

    /// Next rung up (saturating)
    pub fn upgrade(&self) -> Self {
        match self {
            VideoResolution::P360 => VideoResolution::P480,
            VideoResolution::P480 => VideoResolution::P720,
            VideoResolution::P720 => VideoResolution::P1080,
            VideoResolution::P1080 => VideoResolution::P1440,
            VideoResolution::P1440 => VideoResolution::P4K,
            VideoResolution::P4K => VideoResolution::P5K,
            VideoResolution::P5K => VideoResolution::P8K,
            VideoResolution::P8K => VideoResolution::P8K, // Can't go higher
        }
    }
}

/// Video quality controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoQualityConfig {
    /// Lowest rung used
    pub min_resolution: VideoResolution,
    /// Highest rung used
    pub max_resolution: VideoResolution,
    /// Ceiling must exceed the next rung's estimate by this factor to step up
    pub upgrade_headroom: f64,
}

impl Default for VideoQualityConfig {
    fn default() -> Self {
        VideoQualityConfig {
            min_resolution: VideoResolution::P360,
            max_resolution: VideoResolution::P1080,
            upgrade_headroom: 1.5,
        }
    }
}

/// Walks the resolution ladder on TMMBR
#[derive(Debug, Clone)]
pub struct VideoQualityController {
    config: VideoQualityConfig,
    current: VideoResolution,
    last_ceiling: Option<i32>,
}

impl VideoQualityController {
    /// Create a controller starting at `initial`
    pub fn new(config: VideoQualityConfig, initial: VideoResolution) -> Self {
        let current = initial.clamp(config.min_resolution, config.max_resolution);
        VideoQualityController {
            config,
            current,
            last_ceiling: None,
        }
    }

    /// Create a controller starting at the encoder's current picture size
    pub fn for_encoder(config: VideoQualityConfig, encoder: &dyn Encoder) -> Self {
        let initial = encoder
            .configuration()
            .map(|conf| VideoResolution::from_size(conf.vsize))
            .unwrap_or(config.max_resolution);
        Self::new(config, initial)
    }

    /// Current rung
    pub fn current_resolution(&self) -> VideoResolution {
        self.current
    }

    /// Last ceiling received (bps)
    pub fn last_ceiling(&self) -> Option<i32> {
        self.last_ceiling
    }

    /// Apply a new ceiling. Returns the new rung when it changed.
    pub fn update_from_tmmbr(&mut self, bitrate: i32, encoder: &mut dyn Encoder) -> Option<VideoResolution> {
        self.last_ceiling = Some(bitrate);
        let previous = self.current;

        if bitrate < self.current.estimated_bitrate() {
            while self.current > self.config.min_resolution && bitrate < self.current.estimated_bitrate() {
                self.current = self.current.downgrade();
            }
        } else {
            let next = self.current.upgrade();
            if next != self.current
                && next <= self.config.max_resolution
                && bitrate as f64 >= next.estimated_bitrate() as f64 * self.config.upgrade_headroom
            {
                self.current = next;
            }
        }

        self.apply(bitrate, encoder);

        if self.current != previous {
            info!(
                from = ?previous,
                to = ?self.current,
                bitrate,
                "Video resolution changed on TMMBR"
            );
            Some(self.current)
        } else {
            None
        }
    }

    fn apply(&self, bitrate: i32, encoder: &mut dyn Encoder) {
        match encoder.configuration() {
            Some(mut conf) => {
                conf.vsize = self.current.size();
                conf.required_bitrate = bitrate;
                if let Err(e) = encoder.set_configuration(&conf) {
                    warn!(encoder = encoder.name(), error = %e, "Could not reconfigure encoder");
                }
            }
            None => {
                if let Err(e) = encoder.set_bitrate(bitrate) {
                    warn!(encoder = encoder.name(), error = %e, "Could not set encoder bitrate");
                }
            }
        }
    }
}
