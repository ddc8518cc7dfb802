//! Event queue and feedback dispatcher shared between the transport and the tick thread
//!
//! The transport (and any other producer living outside the tick thread) posts
//! [`StreamEvent`]s through an [`EventSender`]. The stream drains the queue once
//! per tick. A single lock guards both the queue and the tearing-down flag, so
//! a delivery racing with teardown either lands before the flag is set or is
//! discarded.
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
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use crate::rtcp::{RtcpPacket, RtcpPacketType};

/// Event posted to a stream's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A compound RTCP packet was received
    RtcpReceived(Bytes),
    /// An RTCP report was emitted by the transport
    RtcpEmitted,
    /// A STUN packet arrived on the RTP or RTCP socket
    StunReceived(Bytes),
    /// ZRTP engine changed its encryption state
    ZrtpEncryptionChanged {
        /// Whether media is now encrypted
        secured: bool,
    },
    /// DTLS-SRTP engine changed its encryption state
    DtlsEncryptionChanged {
        /// Whether media is now encrypted
        secured: bool,
    },
    /// Anything the stream does not handle
    Unknown(u32),
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    tearing_down: bool,
    events: VecDeque<StreamEvent>,
}

/// Owner side of a stream's event queue
#[derive(Debug, Default)]
pub struct EventQueue {
    state: Arc<Mutex<QueueState>>,
}

impl EventQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer handle that can be moved to another thread
    pub fn sender(&self) -> EventSender {
        EventSender {
            state: Arc::downgrade(&self.state),
        }
    }

    /// Handle used by other asynchronous producers to honour the same
    /// teardown lock
    pub fn teardown_handle(&self) -> TeardownHandle {
        TeardownHandle {
            state: Arc::downgrade(&self.state),
        }
    }

    /// Take every pending event in arrival order
    pub fn drain(&self) -> Vec<StreamEvent> {
        let mut state = self.state.lock();
        if state.tearing_down {
            return Vec::new();
        }
        state.events.drain(..).collect()
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set the tearing-down flag and drop pending events. Later deliveries
    /// are discarded.
    pub fn begin_teardown(&self) {
        let mut state = self.state.lock();
        state.tearing_down = true;
        state.events.clear();
    }

    /// Whether teardown has begun
    pub fn is_tearing_down(&self) -> bool {
        self.state.lock().tearing_down
    }

    /// Hold the queue lock, excluding concurrent deliveries
    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }
}

/// Producer side of an [`EventQueue`]
#[derive(Debug, Clone)]
pub struct EventSender {
    state: Weak<Mutex<QueueState>>,
}

impl EventSender {
    /// Post an event. Returns `false` when the stream is gone or tearing
    /// down, in which case the event is dropped.
    pub fn post(&self, event: StreamEvent) -> bool {
        let Some(state) = self.state.upgrade() else {
            tracing::debug!(?event, "Event queue gone, discarding late event");
            return false;
        };
        let mut state = state.lock();
        if state.tearing_down {
            tracing::debug!(?event, "Stream tearing down, discarding late event");
            return false;
        }
        state.events.push_back(event);
        true
    }
}

/// Lets a producer run a delivery under the queue lock, only while the
/// stream is alive
#[derive(Debug, Clone)]
pub struct TeardownHandle {
    state: Weak<Mutex<QueueState>>,
}

impl TeardownHandle {
    /// Run `f` under the lock unless teardown has begun
    pub fn with_live<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let state = self.state.upgrade()?;
        let state = state.lock();
        if state.tearing_down {
            return None;
        }
        let result = f();
        drop(state);
        Some(result)
    }

    /// Whether the owning stream is gone or tearing down
    pub fn is_closed(&self) -> bool {
        self.state
            .upgrade()
            .map(|state| state.lock().tearing_down)
            .unwrap_or(true)
    }
}

/// Token returned by [`EventDispatcher::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

/// Observer invoked for each matching RTCP sub-packet
pub type RtcpHandler = Box<dyn FnMut(&RtcpPacket) + Send>;

struct Registration {
    token: HandlerToken,
    packet_type: RtcpPacketType,
    handler: RtcpHandler,
}

/// Routes RTCP sub-packets to registered observers, synchronously, in
/// registration order
#[derive(Default)]
pub struct EventDispatcher {
    next_token: u64,
    registrations: Vec<Registration>,
}

impl EventDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for sub-packets of `packet_type`
    pub fn connect(&mut self, packet_type: RtcpPacketType, handler: RtcpHandler) -> HandlerToken {
        let token = HandlerToken(self.next_token);
        self.next_token += 1;
        self.registrations.push(Registration {
            token,
            packet_type,
            handler,
        });
        token
    }

    /// Remove a registration. Returns `false` for an unknown token.
    pub fn disconnect(&mut self, token: HandlerToken) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.token != token);
        self.registrations.len() != before
    }

    /// Invoke every handler registered for this sub-packet's type
    pub fn dispatch(&mut self, packet: &RtcpPacket) -> usize {
        let packet_type = packet.packet_type();
        let mut invoked = 0;
        for registration in self
            .registrations
            .iter_mut()
            .filter(|r| r.packet_type == packet_type)
        {
            (registration.handler)(packet);
            invoked += 1;
        }
        invoked
    }

    /// Drop every registration
    pub fn clear(&mut self) {
        self.registrations.clear();
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}
