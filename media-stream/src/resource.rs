//! Media endpoints (sources and sinks) of a stream
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

/// Kind of media endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaResourceType {
    /// Not set
    Invalid,
    /// Platform default device
    Default,
    /// Discard everything
    Void,
    /// Another stream, via an inter-ticker channel
    Itc,
    /// A file
    File,
    /// A camera (argument: device id)
    Camera,
    /// A remote RTP endpoint (argument: session handle)
    Rtp,
    /// A sound card (argument: device id)
    Soundcard,
}

/// One endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaResource {
    /// Kind
    pub kind: MediaResourceType,
    /// Argument, required for some kinds
    pub arg: Option<String>,
}

impl MediaResource {
    /// Create a resource
    pub fn new(kind: MediaResourceType, arg: Option<String>) -> Self {
        MediaResource { kind, arg }
    }

    /// Whether the resource is usable as described
    pub fn is_consistent(&self) -> bool {
        match self.kind {
            MediaResourceType::Camera | MediaResourceType::Rtp | MediaResourceType::Soundcard => {
                self.arg.is_some()
            }
            MediaResourceType::Default
            | MediaResourceType::File
            | MediaResourceType::Itc
            | MediaResourceType::Void => true,
            MediaResourceType::Invalid => false,
        }
    }
}

/// Input and output endpoints of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamIo {
    /// Source
    pub input: MediaResource,
    /// Sink
    pub output: MediaResource,
}

impl MediaStreamIo {
    /// Both endpoints consistent
    pub fn is_consistent(&self) -> bool {
        self.input.is_consistent() && self.output.is_consistent()
    }
}
