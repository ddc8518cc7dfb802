//! Media security contexts
//!
//! At most one key-exchange mechanism is active per stream: ZRTP, DTLS-SRTP or
//! SDES. ZRTP and DTLS engines are supplied by the host through
//! [`SecurityEngineFactory`]; SDES keys are handled here.
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

use base64::engine::{general_purpose, Engine};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto_suite::CryptoSuite;
use crate::error::{StreamError, StreamResult};
use crate::types::StreamDirection;

/// Key-exchange mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchange {
    /// ZRTP (RFC 6189)
    Zrtp,
    /// DTLS-SRTP (RFC 5764)
    DtlsSrtp,
    /// SDES (RFC 4568)
    Sdes,
}

impl KeyExchange {
    /// Get mechanism as string
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyExchange::Zrtp => "ZRTP",
            KeyExchange::DtlsSrtp => "DTLS-SRTP",
            KeyExchange::Sdes => "SDES",
        }
    }
}

impl fmt::Display for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of the SRTP keys in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpKeySource {
    /// No keys, or stream not started
    Unavailable,
    /// Keys from an unknown source
    Unknown,
    /// Exchanged through SDP
    Sdes,
    /// Derived by ZRTP
    Zrtp,
    /// Derived by DTLS-SRTP
    Dtls,
    /// Provided by EKT
    Ekt,
}

/// Engine state as seen by the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineStatus {
    /// Key agreement in progress
    #[default]
    Handshaking,
    /// Keys installed
    Secured,
    /// Session must be recreated from its parameters
    Invalidated,
    /// Unrecoverable failure
    Failed,
}

/// Identifies the sessions an engine is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    /// Owning stream
    pub stream_id: Uuid,
    /// Media RTP session
    pub rtp_session_id: Uuid,
    /// FEC session, when present
    pub fec_session_id: Option<Uuid>,
}

/// ZRTP configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZrtpParams {
    /// Our SIP URI, for the ZID cache
    pub self_uri: Option<String>,
    /// Peer SIP URI, for the ZID cache
    pub peer_uri: Option<String>,
    /// LIME key lifetime in seconds (0 = infinite)
    pub lime_key_time_span: u32,
    /// Start on the first Hello received
    pub auto_start: bool,
    /// Accept GoClear requests
    pub accept_go_clear: bool,
}

/// DTLS role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtlsRole {
    /// Not negotiated yet
    #[default]
    Unset,
    /// Sends ClientHello
    Client,
    /// Answers ClientHello
    Server,
}

/// DTLS-SRTP configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtlsSrtpParams {
    /// PEM certificate
    pub pem_certificate: Option<String>,
    /// PEM private key
    pub pem_key: Option<String>,
    /// Local role
    pub role: DtlsRole,
    /// Path MTU; 0 means use the engine-wide MTU
    pub mtu: usize,
}

/// A ZRTP or DTLS-SRTP engine
///
/// Engines keep a reference to the sessions they secure through
/// [`SessionBinding`]. The stream clears it before the engine is dropped.
pub trait SecurityEngine: Send {
    /// Mechanism implemented
    fn kind(&self) -> KeyExchange;

    /// Attach to (or detach from) the stream's sessions
    fn bind_sessions(&mut self, binding: Option<SessionBinding>);

    /// Current status
    fn status(&self) -> EngineStatus;

    /// Whether media in `direction` is encrypted
    fn secured(&self, direction: StreamDirection) -> bool;

    /// Key origin for `direction`; `inner` selects the inner layer of
    /// double encryption
    fn key_source(&self, direction: StreamDirection, inner: bool) -> SrtpKeySource;

    /// Crypto suite for `direction`
    fn crypto_suite(&self, direction: StreamDirection, inner: bool) -> CryptoSuite;

    /// Give a stalled handshake more time
    fn reset_transmission_timer(&mut self) {}
}

/// Creates ZRTP and DTLS-SRTP engines
pub trait SecurityEngineFactory: Send + Sync {
    /// Whether ZRTP is compiled in
    fn zrtp_available(&self) -> bool;

    /// Whether DTLS-SRTP is compiled in
    fn dtls_available(&self) -> bool;

    /// Create a ZRTP engine bound to `binding`
    fn create_zrtp(
        &self,
        binding: &SessionBinding,
        params: &ZrtpParams,
    ) -> StreamResult<Box<dyn SecurityEngine>>;

    /// Create a DTLS-SRTP engine bound to `binding`
    fn create_dtls(
        &self,
        binding: &SessionBinding,
        params: &DtlsSrtpParams,
    ) -> StreamResult<Box<dyn SecurityEngine>>;
}

/// Parameters an engine was created from, kept for recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineParams {
    /// ZRTP
    Zrtp(ZrtpParams),
    /// DTLS-SRTP
    Dtls(DtlsSrtpParams),
}

/// Engine plus the parameters it was built from
pub struct ManagedEngine {
    engine: Box<dyn SecurityEngine>,
    params: EngineParams,
}

impl ManagedEngine {
    /// The engine
    pub fn engine(&self) -> &dyn SecurityEngine {
        self.engine.as_ref()
    }

    /// Creation parameters
    pub fn params(&self) -> &EngineParams {
        &self.params
    }
}

impl fmt::Debug for ManagedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedEngine")
            .field("kind", &self.engine.kind())
            .field("status", &self.engine.status())
            .finish()
    }
}

/// One SDES master key, decoded
#[derive(Clone, PartialEq, Eq)]
struct SdesKey {
    suite: CryptoSuite,
    material: Vec<u8>,
}

impl fmt::Debug for SdesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material
        f.debug_struct("SdesKey")
            .field("suite", &self.suite)
            .field("len", &self.material.len())
            .finish()
    }
}

impl SdesKey {
    fn decode(suite: CryptoSuite, encoded: &str) -> StreamResult<Self> {
        let expected = suite.master_key_salt_len().ok_or_else(|| {
            StreamError::Configuration("Cannot key an invalid crypto suite".to_string())
        })?;
        let material = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| StreamError::Configuration(format!("SDES key is not base64: {}", e)))?;
        if material.len() != expected {
            return Err(StreamError::Configuration(format!(
                "SDES key for {} must be {} bytes, got {}",
                suite,
                expected,
                material.len()
            )));
        }
        Ok(SdesKey { suite, material })
    }
}

/// SDES keys for both directions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdesContext {
    send: Option<SdesKey>,
    recv: Option<SdesKey>,
}

impl SdesContext {
    /// Install the send key
    pub fn set_send_key(&mut self, suite: CryptoSuite, encoded: &str) -> StreamResult<()> {
        self.send = Some(SdesKey::decode(suite, encoded)?);
        Ok(())
    }

    /// Install the receive key
    pub fn set_recv_key(&mut self, suite: CryptoSuite, encoded: &str) -> StreamResult<()> {
        self.recv = Some(SdesKey::decode(suite, encoded)?);
        Ok(())
    }

    /// Whether media in `direction` is encrypted
    pub fn secured(&self, direction: StreamDirection) -> bool {
        let keyed = |key: &Option<SdesKey>| {
            key.as_ref()
                .map(|k| !k.suite.is_unencrypted())
                .unwrap_or(false)
        };
        match direction {
            StreamDirection::SendOnly => keyed(&self.send),
            StreamDirection::RecvOnly => keyed(&self.recv),
            StreamDirection::SendRecv => keyed(&self.send) && keyed(&self.recv),
        }
    }

    fn key_for(&self, direction: StreamDirection) -> Option<&SdesKey> {
        match direction {
            StreamDirection::SendOnly => self.send.as_ref(),
            StreamDirection::RecvOnly => self.recv.as_ref(),
            StreamDirection::SendRecv => self.send.as_ref().or(self.recv.as_ref()),
        }
    }

    /// Key origin for `direction`
    pub fn key_source(&self, direction: StreamDirection, inner: bool) -> SrtpKeySource {
        if inner {
            return SrtpKeySource::Unavailable;
        }
        match self.key_for(direction) {
            Some(_) => SrtpKeySource::Sdes,
            None => SrtpKeySource::Unavailable,
        }
    }

    /// Crypto suite for `direction`
    pub fn crypto_suite(&self, direction: StreamDirection, inner: bool) -> CryptoSuite {
        if inner {
            return CryptoSuite::Invalid;
        }
        self.key_for(direction)
            .map(|k| k.suite)
            .unwrap_or(CryptoSuite::Invalid)
    }
}

/// The stream's active security mechanism
#[derive(Debug, Default)]
pub enum SecurityContext {
    /// Plain RTP
    #[default]
    None,
    /// ZRTP engine
    Zrtp(ManagedEngine),
    /// DTLS-SRTP engine
    DtlsSrtp(ManagedEngine),
    /// SDES keys
    Sdes(SdesContext),
}

impl SecurityContext {
    /// Active mechanism, if any
    pub fn kind(&self) -> Option<KeyExchange> {
        match self {
            SecurityContext::None => None,
            SecurityContext::Zrtp(_) => Some(KeyExchange::Zrtp),
            SecurityContext::DtlsSrtp(_) => Some(KeyExchange::DtlsSrtp),
            SecurityContext::Sdes(_) => Some(KeyExchange::Sdes),
        }
    }

    /// True when a DTLS-SRTP engine is present
    pub fn has_dtls(&self) -> bool {
        matches!(self, SecurityContext::DtlsSrtp(_))
    }

    fn refuse(&self, requested: KeyExchange) -> StreamResult<bool> {
        let active = self.kind().map(|k| k.as_str()).unwrap_or("none");
        warn!(
            requested = %requested,
            active,
            "Refusing to enable a second security mechanism; disable the active one first"
        );
        Err(StreamError::InvalidState {
            state: format!("{} already active", active),
        })
    }

    /// Create a ZRTP engine. Returns `Ok(false)` when ZRTP is already
    /// active, in which case a stalled handshake gets more time.
    pub fn enable_zrtp(
        &mut self,
        factory: &dyn SecurityEngineFactory,
        binding: &SessionBinding,
        params: ZrtpParams,
    ) -> StreamResult<bool> {
        match self {
            SecurityContext::None => {}
            SecurityContext::Zrtp(managed) => {
                if managed.engine.status() != EngineStatus::Secured {
                    managed.engine.reset_transmission_timer();
                }
                return Ok(false);
            }
            _ => return self.refuse(KeyExchange::Zrtp),
        }
        if !factory.zrtp_available() {
            return Err(StreamError::SecurityEngine("ZRTP is not available".to_string()));
        }
        let engine = factory.create_zrtp(binding, &params)?;
        info!(stream_id = %binding.stream_id, "ZRTP context created");
        *self = SecurityContext::Zrtp(ManagedEngine {
            engine,
            params: EngineParams::Zrtp(params),
        });
        Ok(true)
    }

    /// Create a DTLS-SRTP engine. `default_mtu` replaces an MTU of 0.
    /// Returns `Ok(false)` when DTLS is already active.
    pub fn enable_dtls(
        &mut self,
        factory: &dyn SecurityEngineFactory,
        binding: &SessionBinding,
        mut params: DtlsSrtpParams,
        default_mtu: usize,
    ) -> StreamResult<bool> {
        match self {
            SecurityContext::None => {}
            SecurityContext::DtlsSrtp(_) => return Ok(false),
            _ => return self.refuse(KeyExchange::DtlsSrtp),
        }
        if !factory.dtls_available() {
            return Err(StreamError::SecurityEngine("DTLS-SRTP is not available".to_string()));
        }
        if params.mtu == 0 {
            params.mtu = default_mtu;
        }
        let engine = factory.create_dtls(binding, &params)?;
        info!(stream_id = %binding.stream_id, mtu = params.mtu, "DTLS-SRTP context created");
        *self = SecurityContext::DtlsSrtp(ManagedEngine {
            engine,
            params: EngineParams::Dtls(params),
        });
        Ok(true)
    }

    /// Install SDES keys (base64 inline key, master key followed by salt).
    /// Re-keying an SDES context is allowed.
    pub fn enable_sdes(&mut self, suite: CryptoSuite, send_key: &str, recv_key: &str) -> StreamResult<()> {
        let mut keys = match self {
            SecurityContext::None => SdesContext::default(),
            SecurityContext::Sdes(current) => current.clone(),
            _ => return self.refuse(KeyExchange::Sdes).map(|_| ()),
        };
        keys.set_send_key(suite, send_key)?;
        keys.set_recv_key(suite, recv_key)?;
        info!(suite = %suite, "SDES keys installed");
        *self = SecurityContext::Sdes(keys);
        Ok(())
    }

    /// Attach engines to (or detach them from) the stream's sessions
    pub fn bind(&mut self, binding: Option<SessionBinding>) {
        if let SecurityContext::Zrtp(managed) | SecurityContext::DtlsSrtp(managed) = self {
            managed.engine.bind_sessions(binding);
        }
    }

    /// Tear down the active mechanism, returning which one it was
    pub fn teardown(&mut self) -> Option<KeyExchange> {
        let kind = self.kind();
        // Dropping the old context unbinds its engine
        drop(std::mem::take(self));
        if let Some(kind) = kind {
            info!(mechanism = %kind, "Security context torn down");
        }
        kind
    }

    /// Engine status; SDES is secured as soon as keys are set
    pub fn status(&self) -> Option<EngineStatus> {
        match self {
            SecurityContext::None => None,
            SecurityContext::Zrtp(managed) | SecurityContext::DtlsSrtp(managed) => {
                Some(managed.engine.status())
            }
            SecurityContext::Sdes(_) => Some(EngineStatus::Secured),
        }
    }

    /// Recreate an invalidated engine from its stored parameters.
    /// Returns `Ok(true)` when a new engine was installed.
    pub fn recover(
        &mut self,
        factory: &dyn SecurityEngineFactory,
        binding: &SessionBinding,
    ) -> StreamResult<bool> {
        if self.status() != Some(EngineStatus::Invalidated) {
            return Ok(false);
        }
        let params = match self {
            SecurityContext::Zrtp(managed) | SecurityContext::DtlsSrtp(managed) => managed.params.clone(),
            _ => return Ok(false),
        };
        warn!(stream_id = %binding.stream_id, "Security session invalidated, recreating it");
        self.teardown();
        let engine = match &params {
            EngineParams::Zrtp(p) => factory.create_zrtp(binding, p)?,
            EngineParams::Dtls(p) => factory.create_dtls(binding, p)?,
        };
        let is_zrtp = matches!(params, EngineParams::Zrtp(_));
        let managed = ManagedEngine { engine, params };
        *self = if is_zrtp {
            SecurityContext::Zrtp(managed)
        } else {
            SecurityContext::DtlsSrtp(managed)
        };
        Ok(true)
    }

    /// Whether media in `direction` is encrypted
    pub fn secured(&self, direction: StreamDirection) -> bool {
        match self {
            SecurityContext::None => false,
            SecurityContext::Zrtp(managed) | SecurityContext::DtlsSrtp(managed) => {
                managed.engine.secured(direction)
            }
            SecurityContext::Sdes(keys) => keys.secured(direction),
        }
    }

    /// Key origin for `direction`
    pub fn key_source(&self, direction: StreamDirection, inner: bool) -> SrtpKeySource {
        match self {
            SecurityContext::None => SrtpKeySource::Unavailable,
            SecurityContext::Zrtp(managed) | SecurityContext::DtlsSrtp(managed) => {
                managed.engine.key_source(direction, inner)
            }
            SecurityContext::Sdes(keys) => keys.key_source(direction, inner),
        }
    }

    /// Crypto suite for `direction`
    pub fn crypto_suite(&self, direction: StreamDirection, inner: bool) -> CryptoSuite {
        match self {
            SecurityContext::None => CryptoSuite::Invalid,
            SecurityContext::Zrtp(managed) | SecurityContext::DtlsSrtp(managed) => {
                managed.engine.crypto_suite(direction, inner)
            }
            SecurityContext::Sdes(keys) => keys.crypto_suite(direction, inner),
        }
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        if let SecurityContext::Zrtp(managed) | SecurityContext::DtlsSrtp(managed) = self {
            managed.engine.bind_sessions(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct BindingLog {
        created: usize,
        bound: Vec<Option<SessionBinding>>,
    }

    struct FakeEngine {
        kind: KeyExchange,
        status: Arc<Mutex<EngineStatus>>,
        log: Arc<Mutex<BindingLog>>,
    }

    impl SecurityEngine for FakeEngine {
        fn kind(&self) -> KeyExchange {
            self.kind
        }
        fn bind_sessions(&mut self, binding: Option<SessionBinding>) {
            self.log.lock().bound.push(binding);
        }
        fn status(&self) -> EngineStatus {
            *self.status.lock()
        }
        fn secured(&self, _direction: StreamDirection) -> bool {
            *self.status.lock() == EngineStatus::Secured
        }
        fn key_source(&self, _direction: StreamDirection, _inner: bool) -> SrtpKeySource {
            match self.kind {
                KeyExchange::Zrtp => SrtpKeySource::Zrtp,
                _ => SrtpKeySource::Dtls,
            }
        }
        fn crypto_suite(&self, _direction: StreamDirection, _inner: bool) -> CryptoSuite {
            CryptoSuite::AeadAes128Gcm
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        status: Arc<Mutex<EngineStatus>>,
        log: Arc<Mutex<BindingLog>>,
        last_mtu: Mutex<usize>,
    }

    impl FakeFactory {
        fn engine(&self, kind: KeyExchange) -> Box<dyn SecurityEngine> {
            self.log.lock().created += 1;
            Box::new(FakeEngine {
                kind,
                status: self.status.clone(),
                log: self.log.clone(),
            })
        }
    }

    impl SecurityEngineFactory for FakeFactory {
        fn zrtp_available(&self) -> bool {
            true
        }
        fn dtls_available(&self) -> bool {
            true
        }
        fn create_zrtp(&self, _b: &SessionBinding, _p: &ZrtpParams) -> StreamResult<Box<dyn SecurityEngine>> {
            Ok(self.engine(KeyExchange::Zrtp))
        }
        fn create_dtls(&self, _b: &SessionBinding, p: &DtlsSrtpParams) -> StreamResult<Box<dyn SecurityEngine>> {
            *self.last_mtu.lock() = p.mtu;
            Ok(self.engine(KeyExchange::DtlsSrtp))
        }
    }

    fn binding() -> SessionBinding {
        SessionBinding {
            stream_id: Uuid::new_v4(),
            rtp_session_id: Uuid::new_v4(),
            fec_session_id: None,
        }
    }

    // 30 bytes: AES_CM_128 master key + salt
    const KEY_30: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwd";

    #[test]
    fn test_sdes_key_length_checked() {
        let mut ctx = SecurityContext::None;
        assert!(ctx.enable_sdes(CryptoSuite::Aes128Sha1_80, KEY_30, KEY_30).is_ok());
        assert!(ctx.secured(StreamDirection::SendRecv));
        assert_eq!(ctx.key_source(StreamDirection::SendOnly, false), SrtpKeySource::Sdes);
        assert_eq!(ctx.crypto_suite(StreamDirection::RecvOnly, false), CryptoSuite::Aes128Sha1_80);

        let mut other = SecurityContext::None;
        assert!(other.enable_sdes(CryptoSuite::Aes256Sha1_80, KEY_30, KEY_30).is_err());
        assert!(other.enable_sdes(CryptoSuite::Aes128Sha1_80, "not base64!", KEY_30).is_err());
    }

    #[test]
    fn test_sdes_null_cipher_not_secured() {
        let mut ctx = SecurityContext::None;
        ctx.enable_sdes(CryptoSuite::Aes128Sha1_80NoCipher, KEY_30, KEY_30).unwrap();
        assert!(!ctx.secured(StreamDirection::SendRecv));
        assert_eq!(ctx.key_source(StreamDirection::SendRecv, false), SrtpKeySource::Sdes);
    }

    #[test]
    fn test_only_one_mechanism_at_a_time() {
        let factory = FakeFactory::default();
        let binding = binding();
        let mut ctx = SecurityContext::None;

        assert!(ctx.enable_zrtp(&factory, &binding, ZrtpParams::default()).unwrap());
        assert!(!ctx.enable_zrtp(&factory, &binding, ZrtpParams::default()).unwrap());
        assert!(ctx.enable_dtls(&factory, &binding, DtlsSrtpParams::default(), 1500).is_err());
        assert!(ctx.enable_sdes(CryptoSuite::Aes128Sha1_80, KEY_30, KEY_30).is_err());
        assert_eq!(ctx.kind(), Some(KeyExchange::Zrtp));
        assert_eq!(factory.log.lock().created, 1);

        assert_eq!(ctx.teardown(), Some(KeyExchange::Zrtp));
        assert_eq!(factory.log.lock().bound.last(), Some(&None));
        assert!(ctx.enable_dtls(&factory, &binding, DtlsSrtpParams::default(), 1400).unwrap());
        assert_eq!(*factory.last_mtu.lock(), 1400);
    }

    #[test]
    fn test_recover_invalidated_engine() {
        let factory = FakeFactory::default();
        let binding = binding();
        let mut ctx = SecurityContext::None;
        let params = DtlsSrtpParams {
            mtu: 1200,
            role: DtlsRole::Client,
            ..Default::default()
        };
        ctx.enable_dtls(&factory, &binding, params, 1500).unwrap();
        assert!(!ctx.recover(&factory, &binding).unwrap());

        *factory.status.lock() = EngineStatus::Invalidated;
        assert!(ctx.recover(&factory, &binding).unwrap());
        assert_eq!(factory.log.lock().created, 2);
        assert_eq!(*factory.last_mtu.lock(), 1200);
        assert!(ctx.has_dtls());
    }

    #[test]
    fn test_drop_unbinds_engine() {
        let factory = FakeFactory::default();
        let mut ctx = SecurityContext::None;
        ctx.enable_zrtp(&factory, &binding(), ZrtpParams::default()).unwrap();
        drop(ctx);
        assert_eq!(factory.log.lock().bound, vec![None]);
    }
}
