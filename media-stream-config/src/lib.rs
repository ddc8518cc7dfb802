//! Configuration management for media stream sessions
//!
//! Knobs are resolved once, at construction, into plain structs that are then
//! handed to the session. Nothing here is consulted again while a stream runs.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Minimum receive buffer size for RTP packets. Keep 1500 for interoperability.
pub const MINIMAL_MTU: usize = 1500;

/// Kernel socket buffer size applied to RTP sockets (send and receive)
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 2_000_000;

/// RTCP report interval used at the beginning of a session (ms)
pub const DEFAULT_RTCP_REPORT_INTERVAL_MS: u32 = 2500;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Priority knob holds something other than NORMAL/HIGH/REALTIME
    #[error("Undefined priority {0}")]
    UndefinedPriority(String),

    /// Underlying config source failed
    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),
}

/// Scheduling priority of the ticker driving a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickerPriority {
    /// Regular OS scheduling
    Normal,
    /// Elevated priority
    High,
    /// Realtime scheduling class
    Realtime,
}

impl TickerPriority {
    /// Get priority as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TickerPriority::Normal => "NORMAL",
            TickerPriority::High => "HIGH",
            TickerPriority::Realtime => "REALTIME",
        }
    }

    /// Type-specific default: audio runs high, video depends on the platform.
    pub fn default_for(is_video: bool) -> Self {
        if !is_video {
            return TickerPriority::High;
        }
        if cfg!(target_os = "ios") {
            TickerPriority::High
        } else {
            TickerPriority::Normal
        }
    }
}

impl fmt::Display for TickerPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TickerPriority {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("NORMAL") {
            Ok(TickerPriority::Normal)
        } else if s.eq_ignore_ascii_case("HIGH") {
            Ok(TickerPriority::High)
        } else if s.eq_ignore_ascii_case("REALTIME") {
            Ok(TickerPriority::Realtime)
        } else {
            Err(ConfigError::UndefinedPriority(s.to_string()))
        }
    }
}

/// Per-kind priority override knobs, kept as raw strings until resolved
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriorityOverrides {
    /// Override for audio (and text) streams
    pub audio: Option<String>,
    /// Override for video streams
    pub video: Option<String>,
}

/// Resolve the ticker priority for a stream.
///
/// Order: explicit value, then the override knob for the stream kind, then
/// the type default. An override that does not parse is logged and skipped.
pub fn resolve_priority(
    explicit: Option<TickerPriority>,
    is_video: bool,
    overrides: &PriorityOverrides,
) -> TickerPriority {
    if let Some(prio) = explicit {
        return prio;
    }

    let knob = if is_video {
        overrides.video.as_deref()
    } else {
        overrides.audio.as_deref()
    };

    if let Some(raw) = knob {
        match raw.parse::<TickerPriority>() {
            Ok(prio) => return prio,
            Err(e) => tracing::error!(value = raw, "{}", e),
        }
    }

    TickerPriority::default_for(is_video)
}

/// Raw environment snapshot, as deserialized by the `config` crate
#[derive(Debug, Default, Deserialize)]
struct EnvSnapshot {
    audio_prio: Option<String>,
    video_prio: Option<String>,
    mtu: Option<usize>,
    rtcp_report_interval_ms: Option<u32>,
    socket_buffer_size: Option<usize>,
}

/// Engine-wide configuration supplied to every session at construction
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ticker priority overrides
    pub priorities: PriorityOverrides,
    /// Network MTU
    pub mtu: usize,
    /// Initial RTCP report interval (ms)
    pub rtcp_report_interval_ms: u32,
    /// Kernel socket buffer size (bytes)
    pub socket_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            priorities: PriorityOverrides::default(),
            mtu: MINIMAL_MTU,
            rtcp_report_interval_ms: DEFAULT_RTCP_REPORT_INTERVAL_MS,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Reads `MS_AUDIO_PRIO`, `MS_VIDEO_PRIO`, `MS_MTU`,
    /// `MS_RTCP_REPORT_INTERVAL_MS` and `MS_SOCKET_BUFFER_SIZE`. A `.env`
    /// file is honoured when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let snapshot: EnvSnapshot = config::Config::builder()
            .add_source(config::Environment::with_prefix("MS").try_parsing(true))
            .build()?
            .try_deserialize()?;

        Ok(Self::from_snapshot(snapshot))
    }

    fn from_snapshot(snapshot: EnvSnapshot) -> Self {
        let defaults = EngineConfig::default();
        EngineConfig {
            priorities: PriorityOverrides {
                audio: snapshot.audio_prio,
                video: snapshot.video_prio,
            },
            mtu: snapshot.mtu.unwrap_or(defaults.mtu),
            rtcp_report_interval_ms: snapshot
                .rtcp_report_interval_ms
                .unwrap_or(defaults.rtcp_report_interval_ms),
            socket_buffer_size: snapshot
                .socket_buffer_size
                .unwrap_or(defaults.socket_buffer_size),
        }
    }

    /// Receive buffer size for RTP packets, never below [`MINIMAL_MTU`]
    pub fn recv_buffer_size(&self) -> usize {
        self.mtu.max(MINIMAL_MTU)
    }

    /// Resolve the ticker priority for a stream kind
    pub fn ticker_priority(&self, explicit: Option<TickerPriority>, is_video: bool) -> TickerPriority {
        resolve_priority(explicit, is_video, &self.priorities)
    }
}
