//! Flexible FEC (RFC 8627) parameters and XOR parity stream
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
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::profile::fmtp_get_value;

/// Default repair window (microseconds)
pub const DEFAULT_REPAIR_WINDOW: u32 = 100_000;
/// Default number of columns (packets per row)
pub const DEFAULT_L: u32 = 10;
/// Default number of rows (0 disables column parity)
pub const DEFAULT_D: u32 = 0;

/// FEC parameters negotiated in the `flexfec` fmtp line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecParameters {
    /// Repair window (microseconds)
    pub repair_window: u32,
    /// Columns, L
    pub l: u32,
    /// Rows, D
    pub d: u32,
}

impl Default for FecParameters {
    fn default() -> Self {
        FecParameters {
            repair_window: DEFAULT_REPAIR_WINDOW,
            l: DEFAULT_L,
            d: DEFAULT_D,
        }
    }
}

impl FecParameters {
    /// Repair packets per source packet. L = 0 means no row parity.
    pub fn repair_overhead(&self) -> f64 {
        let row = if self.l > 0 { 1.0 / self.l as f64 } else { 0.0 };
        let column = if self.d > 1 { 1.0 / self.d as f64 } else { 0.0 };
        row + column
    }
}

fn fmtp_u32(fmtp: Option<&str>, key: &str, default: u32) -> u32 {
    let Some(raw) = fmtp.and_then(|f| fmtp_get_value(f, key)) else {
        info!(key, default, "FEC parameter not provided, using default");
        return default;
    };
    match raw.parse::<u32>() {
        Ok(value) => {
            info!(key, value, "FEC parameter from fmtp");
            value
        }
        Err(_) => {
            info!(key, raw, default, "FEC parameter unparsable, using default");
            default
        }
    }
}

/// Read `repair-window`, `L` and `D` from the received fmtp line, falling
/// back to defaults for anything missing or unparsable
pub fn extract_fec_params(fmtp: Option<&str>) -> FecParameters {
    FecParameters {
        repair_window: fmtp_u32(fmtp, "repair-window", DEFAULT_REPAIR_WINDOW),
        l: fmtp_u32(fmtp, "L", DEFAULT_L),
        d: fmtp_u32(fmtp, "D", DEFAULT_D),
    }
}

/// Which parity a repair packet carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairKind {
    /// XOR of one row of L packets
    Row,
    /// XOR of one column across D rows
    Column,
}

/// Repair packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairPacket {
    /// Row or column
    pub kind: RepairKind,
    /// Sequence numbers protected
    pub protected: Vec<u16>,
    /// XOR of the protected payload lengths
    pub length_recovery: u16,
    /// XOR of the protected payloads
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default)]
struct ParityAccumulator {
    payload: Vec<u8>,
    length: u16,
    protected: Vec<u16>,
}

impl ParityAccumulator {
    fn absorb(&mut self, seq: u16, data: &[u8]) {
        if data.len() > self.payload.len() {
            self.payload.resize(data.len(), 0);
        }
        for (parity, byte) in self.payload.iter_mut().zip(data) {
            *parity ^= byte;
        }
        self.length ^= data.len() as u16;
        self.protected.push(seq);
    }

    fn finish(self, kind: RepairKind) -> RepairPacket {
        RepairPacket {
            kind,
            protected: self.protected,
            length_recovery: self.length,
            payload: Bytes::from(self.payload),
        }
    }
}

/// FEC statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecStats {
    /// Source packets protected
    pub source_packets: u64,
    /// Row repair packets produced
    pub row_repairs: u64,
    /// Column repair packets produced
    pub column_repairs: u64,
    /// Packets recovered
    pub recovered: u64,
    /// Repairs that could not be used
    pub unrecoverable: u64,
}

/// FEC stream bound to a media session and its FEC session
#[derive(Debug)]
pub struct FecStream {
    params: FecParameters,
    source_session: Uuid,
    fec_session: Uuid,
    row: ParityAccumulator,
    row_len: u32,
    columns: Vec<ParityAccumulator>,
    rows_done: u32,
    stats: FecStats,
    initialized: bool,
}

impl FecStream {
    /// Create a stream protecting `source_session` over `fec_session`
    pub fn new(params: FecParameters, source_session: Uuid, fec_session: Uuid) -> Self {
        FecStream {
            params,
            source_session,
            fec_session,
            row: ParityAccumulator::default(),
            row_len: 0,
            columns: Vec::new(),
            rows_done: 0,
            stats: FecStats::default(),
            initialized: false,
        }
    }

    /// Allocate parity state. Idempotent.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        if self.params.d > 1 {
            self.columns = vec![ParityAccumulator::default(); self.params.l as usize];
        }
        self.initialized = true;
        info!(
            source_session = %self.source_session,
            fec_session = %self.fec_session,
            repair_window = self.params.repair_window,
            l = self.params.l,
            d = self.params.d,
            "FEC stream initialized"
        );
    }

    /// Whether [`FecStream::init`] ran
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Parameters in use
    pub fn params(&self) -> FecParameters {
        self.params
    }

    /// Statistics
    pub fn stats(&self) -> FecStats {
        self.stats
    }

    /// Add a source packet. Returns the repair packets completed by it.
    pub fn protect(&mut self, seq: u16, payload: &[u8]) -> Vec<RepairPacket> {
        if !self.initialized {
            return Vec::new();
        }
        if self.params.l == 0 {
            self.stats.source_packets += 1;
            return Vec::new();
        }
        let mut repairs = Vec::new();
        let column = self.row_len as usize;

        self.row.absorb(seq, payload);
        if let Some(acc) = self.columns.get_mut(column) {
            acc.absorb(seq, payload);
        }
        self.row_len += 1;
        self.stats.source_packets += 1;

        if self.row_len >= self.params.l {
            repairs.push(std::mem::take(&mut self.row).finish(RepairKind::Row));
            self.stats.row_repairs += 1;
            self.row_len = 0;
            self.rows_done += 1;

            if !self.columns.is_empty() && self.rows_done >= self.params.d {
                for acc in self.columns.iter_mut() {
                    repairs.push(std::mem::take(acc).finish(RepairKind::Column));
                }
                self.stats.column_repairs += self.params.l as u64;
                self.rows_done = 0;
            }
        }
        repairs
    }

    /// Rebuild the single packet missing from `repair`'s protected set.
    /// `received` holds the protected packets that did arrive.
    pub fn recover(&mut self, repair: &RepairPacket, received: &[(u16, Bytes)]) -> Option<(u16, Bytes)> {
        let missing: Vec<u16> = repair
            .protected
            .iter()
            .filter(|seq| !received.iter().any(|(s, _)| s == *seq))
            .copied()
            .collect();
        let [lost] = missing.as_slice() else {
            if !missing.is_empty() {
                debug!(missing = missing.len(), "Too many losses for one repair packet");
                self.stats.unrecoverable += 1;
            }
            return None;
        };

        let mut payload = repair.payload.to_vec();
        let mut length = repair.length_recovery;
        for (seq, data) in received {
            if !repair.protected.contains(seq) {
                continue;
            }
            for (out, byte) in payload.iter_mut().zip(data.iter()) {
                *out ^= byte;
            }
            length ^= data.len() as u16;
        }
        payload.truncate(length as usize);
        self.stats.recovered += 1;
        Some((*lost, Bytes::from(payload)))
    }

    /// Log the statistics
    pub fn log_stats(&self) {
        info!(
            source_session = %self.source_session,
            source_packets = self.stats.source_packets,
            row_repairs = self.stats.row_repairs,
            column_repairs = self.stats.column_repairs,
            recovered = self.stats.recovered,
            unrecoverable = self.stats.unrecoverable,
            "FEC stream statistics"
        );
    }
}
