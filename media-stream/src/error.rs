//! Error types for the media stream controller
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


use thiserror::Error;

/// Result type for stream session operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur while driving a stream session
#[derive(Error, Debug)]
pub enum StreamError {
    /// Bad crypto suite, bad priority knob, bad key material
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Socket bind/join failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed RTCP sub-packet
    #[error("RTCP parse error: {0}")]
    ProtocolParse(String),

    /// Security engine reported a failure or an invalidated session
    #[error("Security engine error: {0}")]
    SecurityEngine(String),

    /// Allocation or construction of a sub-resource failed
    #[error("Resource error: {0}")]
    Resource(String),

    /// Operation not permitted in the current state
    #[error("Invalid stream state: {state}")]
    InvalidState { state: String },

    /// Encoder or decoder rejected a request
    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Transport(err.to_string())
    }
}

impl From<media_stream_config::ConfigError> for StreamError {
    fn from(err: media_stream_config::ConfigError) -> Self {
        StreamError::Configuration(err.to_string())
    }
}
