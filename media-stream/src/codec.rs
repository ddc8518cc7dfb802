//! Encoder and decoder seams
//!
//! Codecs are external. The stream only needs to push bitrate or
//! configuration changes into an encoder and to pull decoded frames out of a
//! decoder, some of which deliver from their own threads.
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
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{StreamError, StreamResult};
use crate::events::TeardownHandle;

/// Default number of decoded frames buffered between decoder and stream
pub const DEFAULT_FRAME_SLOT_CAPACITY: usize = 8;

/// Picture size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoSize {
    /// Width (pixels)
    pub width: u32,
    /// Height (pixels)
    pub height: u32,
}

impl VideoSize {
    /// Create a size
    pub const fn new(width: u32, height: u32) -> Self {
        VideoSize { width, height }
    }

    /// Pixel count
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for VideoSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One entry of an encoder's configuration ladder
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoConfiguration {
    /// Bitrate the encoder is asked to produce (bps)
    pub required_bitrate: i32,
    /// Highest bitrate this entry is meant for (bps)
    pub bitrate_limit: i32,
    /// Picture size
    pub vsize: VideoSize,
    /// Frame rate
    pub fps: f32,
    /// Minimum CPU count needed
    pub mincpu: usize,
}

/// An encoder the stream can steer
pub trait Encoder: Send {
    /// Codec name, for logs
    fn name(&self) -> &str;

    /// Change the output bitrate (bps)
    fn set_bitrate(&mut self, bitrate: i32) -> StreamResult<()>;

    /// Configuration ladder, for video encoders that expose one
    fn configuration_list(&self) -> Option<Vec<VideoConfiguration>> {
        None
    }

    /// Current configuration
    fn configuration(&self) -> Option<VideoConfiguration> {
        None
    }

    /// Apply a configuration
    fn set_configuration(&mut self, _conf: &VideoConfiguration) -> StreamResult<()> {
        Err(StreamError::Codec(format!(
            "{} does not support configuration changes",
            self.name()
        )))
    }

    /// Emit a key frame as soon as possible
    fn request_key_frame(&mut self) {}
}

/// Compressed frame handed to a decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Bitstream
    pub data: Bytes,
    /// RTP timestamp
    pub timestamp: u32,
    /// Whether the frame can be decoded on its own
    pub key_frame: bool,
}

/// Decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Picture or PCM data
    pub data: Bytes,
    /// RTP timestamp of the source frame
    pub timestamp: u32,
    /// Picture size, for video
    pub size: Option<VideoSize>,
}

/// What a decoder delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderOutput {
    /// A frame is ready
    Frame(DecodedFrame),
    /// Decoding failed
    Failure(String),
}

/// Result of fetching from a decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A frame was decoded
    Ok(DecodedFrame),
    /// Nothing ready yet
    NoFrameAvailable,
    /// The decoder reported a failure
    DecodingFailure,
}

/// A decoder. Output goes through `output`, either synchronously from
/// `feed` or later from the decoder's own thread.
pub trait Decoder: Send {
    /// Codec name, for logs
    fn name(&self) -> &str;

    /// Submit a compressed frame
    fn feed(&mut self, frame: &EncodedFrame, output: &FrameProducer) -> StreamResult<()>;

    /// Drop internal state, e.g. after a security renegotiation
    fn reset(&mut self) {}
}

/// Producer side of a [`FrameSlot`]. Deliveries are made under the
/// stream's teardown lock and are dropped once teardown begins.
#[derive(Debug, Clone)]
pub struct FrameProducer {
    tx: mpsc::Sender<DecoderOutput>,
    teardown: TeardownHandle,
}

impl FrameProducer {
    /// Deliver an output. Returns `false` when dropped (stream gone or
    /// slot full).
    pub fn deliver(&self, output: DecoderOutput) -> bool {
        let delivered = self.teardown.with_live(|| match self.tx.try_send(output) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Decoded frame slot full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        match delivered {
            Some(delivered) => delivered,
            None => {
                debug!("Stream tearing down, discarding decoder output");
                false
            }
        }
    }
}

/// Bounded buffer between a decoder and the tick thread
#[derive(Debug)]
pub struct FrameSlot {
    rx: mpsc::Receiver<DecoderOutput>,
    teardown: TeardownHandle,
}

impl FrameSlot {
    /// Create a slot and its producer
    pub fn new(capacity: usize, teardown: TeardownHandle) -> (FrameSlot, FrameProducer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            FrameSlot {
                rx,
                teardown: teardown.clone(),
            },
            FrameProducer { tx, teardown },
        )
    }

    /// Take the oldest pending output
    pub fn try_take(&mut self) -> Option<DecoderOutput> {
        if self.teardown.is_closed() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Refuse further deliveries and drop pending ones
    pub fn close(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

/// Wraps a decoder. After a failure (when configured) or a security
/// renegotiation the gate freezes and drops everything up to the next key
/// frame.
pub struct DecoderGate {
    decoder: Box<dyn Decoder>,
    slot: FrameSlot,
    producer: FrameProducer,
    frozen: bool,
    freeze_on_error: bool,
}

impl DecoderGate {
    /// Wrap `decoder`
    pub fn new(
        decoder: Box<dyn Decoder>,
        capacity: usize,
        teardown: TeardownHandle,
        freeze_on_error: bool,
    ) -> Self {
        let (slot, producer) = FrameSlot::new(capacity, teardown);
        DecoderGate {
            decoder,
            slot,
            producer,
            frozen: false,
            freeze_on_error,
        }
    }

    /// Submit a frame. Returns `Ok(false)` when dropped while frozen.
    pub fn feed(&mut self, frame: &EncodedFrame) -> StreamResult<bool> {
        if self.frozen {
            if !frame.key_frame {
                debug!(decoder = self.decoder.name(), "Decoder frozen, waiting for a key frame");
                return Ok(false);
            }
            info!(decoder = self.decoder.name(), "Key frame received, decoder unfrozen");
            self.frozen = false;
        }
        self.decoder.feed(frame, &self.producer)?;
        Ok(true)
    }

    /// Pull the next decoder output
    pub fn fetch(&mut self) -> DecodeStatus {
        match self.slot.try_take() {
            Some(DecoderOutput::Frame(frame)) => DecodeStatus::Ok(frame),
            Some(DecoderOutput::Failure(reason)) => {
                warn!(decoder = self.decoder.name(), %reason, "Decoding failure");
                if self.freeze_on_error {
                    self.freeze();
                }
                DecodeStatus::DecodingFailure
            }
            None => DecodeStatus::NoFrameAvailable,
        }
    }

    /// Freeze until the next key frame
    pub fn freeze(&mut self) {
        if !self.frozen {
            info!(decoder = self.decoder.name(), "Decoder frozen until next key frame");
        }
        self.frozen = true;
        self.decoder.reset();
    }

    /// Whether the gate is frozen
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Producer for decoders that deliver from elsewhere
    pub fn producer(&self) -> FrameProducer {
        self.producer.clone()
    }

    /// Stop accepting output
    pub fn close(&mut self) {
        self.slot.close();
    }
}

impl fmt::Debug for DecoderGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderGate")
            .field("decoder", &self.decoder.name())
            .field("frozen", &self.frozen)
            .field("freeze_on_error", &self.freeze_on_error)
            .finish()
    }
}
