//! Integration tests for key-exchange arbitration
//!
//! At most one of ZRTP, DTLS-SRTP and SDES may be active on a stream. The
//! engines are stubbed; only the stream's bookkeeping is under test.

use std::sync::Arc;

use media_stream::{
    CryptoSuite, DtlsSrtpParams, EngineStatus, KeyExchange, ManualClock, MediaType, RtpSession,
    SecurityContext, SecurityEngine, SecurityEngineFactory, SessionBinding, SessionMode,
    SessionOptions, SrtpKeySource, StreamDirection, StreamError, StreamResult, StreamSession,
    StreamSessions, ZrtpParams,
};
use media_stream_config::EngineConfig;
use parking_lot::Mutex;

/// 30-byte AES_CM_128 master key and salt
const KEY_30: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwd";

fn init() {
    let _ = media_stream_logging::init_console_logging("security-arbitration-test", "debug");
}

struct StubEngine {
    kind: KeyExchange,
    status: Arc<Mutex<EngineStatus>>,
}

impl SecurityEngine for StubEngine {
    fn kind(&self) -> KeyExchange {
        self.kind
    }

    fn bind_sessions(&mut self, _binding: Option<SessionBinding>) {}

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
struct StubFactory {
    status: Arc<Mutex<EngineStatus>>,
    dtls_mtu: Mutex<Option<usize>>,
    created: Mutex<Vec<KeyExchange>>,
}

impl SecurityEngineFactory for StubFactory {
    fn zrtp_available(&self) -> bool {
        true
    }

    fn dtls_available(&self) -> bool {
        true
    }

    fn create_zrtp(
        &self,
        _binding: &SessionBinding,
        _params: &ZrtpParams,
    ) -> StreamResult<Box<dyn SecurityEngine>> {
        self.created.lock().push(KeyExchange::Zrtp);
        Ok(Box::new(StubEngine {
            kind: KeyExchange::Zrtp,
            status: self.status.clone(),
        }))
    }

    fn create_dtls(
        &self,
        _binding: &SessionBinding,
        params: &DtlsSrtpParams,
    ) -> StreamResult<Box<dyn SecurityEngine>> {
        self.created.lock().push(KeyExchange::DtlsSrtp);
        *self.dtls_mtu.lock() = Some(params.mtu);
        Ok(Box::new(StubEngine {
            kind: KeyExchange::DtlsSrtp,
            status: self.status.clone(),
        }))
    }
}

fn stream(media_type: MediaType, factory: Arc<StubFactory>) -> anyhow::Result<StreamSession> {
    let mut stream = StreamSession::new(
        media_type,
        StreamSessions::new(RtpSession::new(SessionMode::SendRecv)),
        SessionOptions {
            engine: EngineConfig {
                mtu: 1400,
                ..Default::default()
            },
            clock: Arc::new(ManualClock::new(0)),
            security_factory: Some(factory),
            ..Default::default()
        },
    )?;
    stream.set_transport_polling(false);
    Ok(stream)
}

#[test]
fn test_second_mechanism_refused() -> anyhow::Result<()> {
    init();
    let factory = Arc::new(StubFactory::default());
    let mut stream = stream(MediaType::Audio, factory.clone())?;

    assert!(stream.enable_zrtp(ZrtpParams::default())?);
    let refused = stream.enable_dtls(DtlsSrtpParams::default());
    assert!(matches!(refused, Err(StreamError::InvalidState { .. })));
    assert!(stream.enable_sdes(CryptoSuite::Aes128Sha1_80, KEY_30, KEY_30).is_err());

    assert_eq!(stream.security().kind(), Some(KeyExchange::Zrtp));
    assert_eq!(*factory.created.lock(), vec![KeyExchange::Zrtp]);

    // Enabling the active mechanism again is not an error
    assert!(!stream.enable_zrtp(ZrtpParams::default())?);
    assert_eq!(factory.created.lock().len(), 1);
    Ok(())
}

#[test]
fn test_disable_then_switch() -> anyhow::Result<()> {
    init();
    let factory = Arc::new(StubFactory::default());
    let mut stream = stream(MediaType::Video, factory)?;

    stream.enable_sdes(CryptoSuite::Aes128Sha1_80, KEY_30, KEY_30)?;
    assert!(stream.enable_zrtp(ZrtpParams::default()).is_err());
    // SDES can be re-keyed in place
    stream.enable_sdes(CryptoSuite::Aes128Sha1_32, KEY_30, KEY_30)?;

    assert_eq!(stream.disable_security(), Some(KeyExchange::Sdes));
    assert!(matches!(stream.security(), SecurityContext::None));
    assert!(stream.enable_zrtp(ZrtpParams::default())?);
    Ok(())
}

#[test]
fn test_dtls_takes_engine_mtu() -> anyhow::Result<()> {
    init();
    let factory = Arc::new(StubFactory::default());
    let mut stream = stream(MediaType::Audio, factory.clone())?;
    assert!(stream.dtls_supported());

    assert!(stream.enable_dtls(DtlsSrtpParams::default())?);
    assert_eq!(*factory.dtls_mtu.lock(), Some(1400));
    assert!(stream.stun_sending().forced);

    assert!(!stream.enable_dtls(DtlsSrtpParams { mtu: 1200, ..Default::default() })?);
    assert_eq!(*factory.dtls_mtu.lock(), Some(1400));

    stream.disable_security();
    assert!(!stream.stun_sending().forced);
    Ok(())
}

#[test]
fn test_getters_before_start() -> anyhow::Result<()> {
    init();
    let factory = Arc::new(StubFactory::default());
    *factory.status.lock() = EngineStatus::Secured;
    let mut stream = stream(MediaType::Audio, factory)?;
    stream.enable_zrtp(ZrtpParams::default())?;

    assert!(!stream.secured());
    assert_eq!(
        stream.srtp_key_source(StreamDirection::SendRecv, false),
        SrtpKeySource::Unavailable
    );
    assert_eq!(
        stream.srtp_crypto_suite(StreamDirection::SendRecv, false),
        CryptoSuite::Invalid
    );

    stream.start()?;
    assert!(stream.secured());
    assert_eq!(stream.srtp_key_source(StreamDirection::SendRecv, false), SrtpKeySource::Zrtp);
    assert_eq!(
        stream.srtp_crypto_suite(StreamDirection::SendOnly, false),
        CryptoSuite::AeadAes128Gcm
    );
    Ok(())
}

#[test]
fn test_unknown_media_never_secured() -> anyhow::Result<()> {
    init();
    let factory = Arc::new(StubFactory::default());
    *factory.status.lock() = EngineStatus::Secured;
    let mut stream = stream(MediaType::Unknown, factory)?;
    stream.enable_zrtp(ZrtpParams::default())?;
    stream.start()?;

    assert!(!stream.secured());
    assert_eq!(
        stream.srtp_key_source(StreamDirection::SendRecv, false),
        SrtpKeySource::Unavailable
    );
    Ok(())
}

#[test]
fn test_sdes_secured_after_start() -> anyhow::Result<()> {
    init();
    let factory = Arc::new(StubFactory::default());
    let mut stream = stream(MediaType::Audio, factory)?;
    stream.enable_sdes(CryptoSuite::Aes128Sha1_80, KEY_30, KEY_30)?;
    stream.start()?;

    assert!(stream.secured());
    assert_eq!(stream.srtp_key_source(StreamDirection::SendRecv, false), SrtpKeySource::Sdes);
    assert_eq!(
        stream.srtp_crypto_suite(StreamDirection::SendRecv, false),
        CryptoSuite::Aes128Sha1_80
    );
    Ok(())
}

#[test]
fn test_no_factory_configured() -> anyhow::Result<()> {
    init();
    let mut stream = StreamSession::new(
        MediaType::Audio,
        StreamSessions::new(RtpSession::new(SessionMode::SendRecv)),
        SessionOptions::default(),
    )?;

    assert!(!stream.dtls_supported());
    assert!(matches!(
        stream.enable_zrtp(ZrtpParams::default()),
        Err(StreamError::SecurityEngine(_))
    ));
    assert!(stream.security().kind().is_none());
    Ok(())
}
