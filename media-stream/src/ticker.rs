//! Ticker seam
//!
//! A ticker drives a stream's periodic processing. The scheduler itself lives
//! outside this crate; streams only need to create one with the right name
//! and priority and attach to it.
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

use media_stream_config::TickerPriority;
use tracing::debug;
use uuid::Uuid;

use crate::error::StreamResult;
use crate::types::MediaType;

/// Ticker creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerParams {
    /// Thread name
    pub name: String,
    /// Scheduling priority
    pub priority: TickerPriority,
}

impl TickerParams {
    /// Parameters for a stream of `media_type`: named after the type with
    /// its first letter capitalized, e.g. `Audio MSTicker`
    pub fn for_stream(media_type: MediaType, priority: TickerPriority) -> Self {
        let kind = media_type.as_str();
        let mut chars = kind.chars();
        let capitalized = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => String::new(),
        };
        TickerParams {
            name: format!("{} MSTicker", capitalized),
            priority,
        }
    }
}

/// A running ticker
pub trait Ticker: Send {
    /// Thread name
    fn name(&self) -> &str;

    /// Scheduling priority
    fn priority(&self) -> TickerPriority;

    /// Attach a stream's processing
    fn attach(&mut self, stream_id: Uuid) -> StreamResult<()>;

    /// Detach a stream's processing
    fn detach(&mut self, stream_id: Uuid);
}

/// Creates tickers
pub trait TickerFactory: Send + Sync {
    /// Create and start a ticker
    fn create(&self, params: TickerParams) -> StreamResult<Box<dyn Ticker>>;
}

/// Ticker driven by the host, which calls the stream's iterate itself
#[derive(Debug, Clone)]
pub struct ExternalTicker {
    params: TickerParams,
    attached: Vec<Uuid>,
}

impl ExternalTicker {
    /// Streams currently attached
    pub fn attached(&self) -> &[Uuid] {
        &self.attached
    }
}

impl Ticker for ExternalTicker {
    fn name(&self) -> &str {
        &self.params.name
    }

    fn priority(&self) -> TickerPriority {
        self.params.priority
    }

    fn attach(&mut self, stream_id: Uuid) -> StreamResult<()> {
        if !self.attached.contains(&stream_id) {
            self.attached.push(stream_id);
        }
        debug!(ticker = %self.params.name, %stream_id, "Stream attached");
        Ok(())
    }

    fn detach(&mut self, stream_id: Uuid) {
        self.attached.retain(|id| *id != stream_id);
    }
}

/// Factory for [`ExternalTicker`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalTickerFactory;

impl TickerFactory for ExternalTickerFactory {
    fn create(&self, params: TickerParams) -> StreamResult<Box<dyn Ticker>> {
        Ok(Box::new(ExternalTicker {
            params,
            attached: Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_names() {
        assert_eq!(
            TickerParams::for_stream(MediaType::Audio, TickerPriority::High).name,
            "Audio MSTicker"
        );
        assert_eq!(
            TickerParams::for_stream(MediaType::Video, TickerPriority::Normal).name,
            "Video MSTicker"
        );
    }

    #[test]
    fn test_external_ticker_attach() {
        let params = TickerParams::for_stream(MediaType::Text, TickerPriority::High);
        let mut ticker = ExternalTickerFactory.create(params).unwrap();
        let id = Uuid::new_v4();
        ticker.attach(id).unwrap();
        ticker.attach(id).unwrap();
        ticker.detach(id);
        assert_eq!(ticker.priority(), TickerPriority::High);
        assert_eq!(ticker.name(), "Text MSTicker");
    }
}
