//! SRTP crypto suites and their SDP security descriptors
//!
//! Names and session parameters follow the IANA sdp-security-descriptions registry.
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


use std::fmt;

/// SRTP crypto suite negotiated through SDES, DTLS-SRTP or ZRTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoSuite {
    /// No valid suite; the result of any rejected name/params combination
    Invalid,
    /// AES_CM_128_HMAC_SHA1_80
    Aes128Sha1_80,
    /// AES_CM_128_HMAC_SHA1_32
    Aes128Sha1_32,
    /// AES_CM_128_HMAC_SHA1_80 UNAUTHENTICATED_SRTP
    Aes128Sha1_80NoAuth,
    /// AES_CM_128_HMAC_SHA1_32 UNAUTHENTICATED_SRTP
    Aes128Sha1_32NoAuth,
    /// AES_CM_128_HMAC_SHA1_80 UNENCRYPTED_SRTP
    Aes128Sha1_80SrtpNoCipher,
    /// AES_CM_128_HMAC_SHA1_80 UNENCRYPTED_SRTCP
    Aes128Sha1_80SrtcpNoCipher,
    /// AES_CM_128_HMAC_SHA1_80 UNENCRYPTED_SRTP UNENCRYPTED_SRTCP
    Aes128Sha1_80NoCipher,
    /// AES_256_CM_HMAC_SHA1_80
    Aes256Sha1_80,
    /// AES_CM_256_HMAC_SHA1_80 (legacy spelling of the 256-bit suite)
    AesCm256Sha1_80,
    /// AES_256_CM_HMAC_SHA1_32
    Aes256Sha1_32,
    /// AEAD_AES_128_GCM
    AeadAes128Gcm,
    /// AEAD_AES_256_GCM
    AeadAes256Gcm,
}

/// SDP `a=crypto` descriptor: suite name plus optional session parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoSuiteNameParams<'a> {
    /// Suite name, e.g. `AES_CM_128_HMAC_SHA1_80`
    pub name: &'a str,
    /// Whitespace separated session parameter tokens
    pub params: Option<&'a str>,
}

impl<'a> CryptoSuiteNameParams<'a> {
    /// Create a descriptor
    pub fn new(name: &'a str, params: Option<&'a str>) -> Self {
        CryptoSuiteNameParams { name, params }
    }
}

/// Session parameter flags that change the resulting suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SessionParamFlags {
    unencrypted_srtp: bool,
    unencrypted_srtcp: bool,
    unauthenticated_srtp: bool,
}

impl SessionParamFlags {
    /// Extract the recognized tokens. Unencrypted flags take precedence over
    /// UNAUTHENTICATED_SRTP; other tokens (KDR, FEC_ORDER, ...) are ignored.
    fn parse(params: Option<&str>) -> Self {
        let mut flags = SessionParamFlags::default();
        for token in params.unwrap_or("").split_whitespace() {
            match token {
                "UNENCRYPTED_SRTP" => flags.unencrypted_srtp = true,
                "UNENCRYPTED_SRTCP" => flags.unencrypted_srtcp = true,
                "UNAUTHENTICATED_SRTP" => flags.unauthenticated_srtp = true,
                _ => {}
            }
        }
        if flags.unencrypted_srtp || flags.unencrypted_srtcp {
            flags.unauthenticated_srtp = false;
        }
        flags
    }
}

struct SuiteEntry {
    suite: CryptoSuite,
    name: &'static str,
    params: Option<&'static str>,
    flags: SessionParamFlags,
}

const fn entry(
    suite: CryptoSuite,
    name: &'static str,
    params: Option<&'static str>,
    unencrypted_srtp: bool,
    unencrypted_srtcp: bool,
    unauthenticated_srtp: bool,
) -> SuiteEntry {
    SuiteEntry {
        suite,
        name,
        params,
        flags: SessionParamFlags {
            unencrypted_srtp,
            unencrypted_srtcp,
            unauthenticated_srtp,
        },
    }
}

/// Every valid (name, params) pair. Anything not listed here is `Invalid`.
static SUITE_TABLE: &[SuiteEntry] = &[
    entry(CryptoSuite::Aes128Sha1_80, "AES_CM_128_HMAC_SHA1_80", None, false, false, false),
    entry(CryptoSuite::Aes128Sha1_80SrtpNoCipher, "AES_CM_128_HMAC_SHA1_80", Some("UNENCRYPTED_SRTP"), true, false, false),
    entry(CryptoSuite::Aes128Sha1_80SrtcpNoCipher, "AES_CM_128_HMAC_SHA1_80", Some("UNENCRYPTED_SRTCP"), false, true, false),
    entry(CryptoSuite::Aes128Sha1_80NoCipher, "AES_CM_128_HMAC_SHA1_80", Some("UNENCRYPTED_SRTP UNENCRYPTED_SRTCP"), true, true, false),
    entry(CryptoSuite::Aes128Sha1_80NoAuth, "AES_CM_128_HMAC_SHA1_80", Some("UNAUTHENTICATED_SRTP"), false, false, true),
    entry(CryptoSuite::Aes128Sha1_32, "AES_CM_128_HMAC_SHA1_32", None, false, false, false),
    entry(CryptoSuite::Aes128Sha1_32NoAuth, "AES_CM_128_HMAC_SHA1_32", Some("UNAUTHENTICATED_SRTP"), false, false, true),
    entry(CryptoSuite::Aes256Sha1_32, "AES_256_CM_HMAC_SHA1_32", None, false, false, false),
    entry(CryptoSuite::Aes256Sha1_80, "AES_256_CM_HMAC_SHA1_80", None, false, false, false),
    entry(CryptoSuite::AesCm256Sha1_80, "AES_CM_256_HMAC_SHA1_80", None, false, false, false),
    entry(CryptoSuite::AeadAes128Gcm, "AEAD_AES_128_GCM", None, false, false, false),
    entry(CryptoSuite::AeadAes256Gcm, "AEAD_AES_256_GCM", None, false, false, false),
];

impl CryptoSuite {
    /// Resolve an SDP descriptor to a suite.
    ///
    /// Unknown names and parameter combinations the suite does not support
    /// yield [`CryptoSuite::Invalid`]; both are logged.
    pub fn build_from_name_params(descriptor: &CryptoSuiteNameParams<'_>) -> CryptoSuite {
        let flags = SessionParamFlags::parse(descriptor.params);

        let found = SUITE_TABLE
            .iter()
            .find(|e| e.name == descriptor.name && e.flags == flags);

        match found {
            Some(e) => e.suite,
            None => {
                tracing::error!(
                    name = descriptor.name,
                    params = descriptor.params.unwrap_or(""),
                    "Unsupported crypto suite"
                );
                CryptoSuite::Invalid
            }
        }
    }

    /// SDP descriptor for this suite, `None` for [`CryptoSuite::Invalid`]
    pub fn to_name_params(self) -> Option<CryptoSuiteNameParams<'static>> {
        SUITE_TABLE
            .iter()
            .find(|e| e.suite == self)
            .map(|e| CryptoSuiteNameParams::new(e.name, e.params))
    }

    /// True for suites that leave SRTP and/or SRTCP unencrypted
    pub fn is_unencrypted(self) -> bool {
        matches!(
            self,
            CryptoSuite::Aes128Sha1_80SrtpNoCipher
                | CryptoSuite::Aes128Sha1_80SrtcpNoCipher
                | CryptoSuite::Aes128Sha1_80NoCipher
        )
    }

    /// True for suites that leave SRTP unauthenticated
    pub fn is_unauthenticated(self) -> bool {
        matches!(
            self,
            CryptoSuite::Aes128Sha1_80NoAuth | CryptoSuite::Aes128Sha1_32NoAuth
        )
    }

    /// Length of the SDES inline key (master key followed by master salt)
    pub fn master_key_salt_len(self) -> Option<usize> {
        match self {
            CryptoSuite::Invalid => None,
            CryptoSuite::Aes128Sha1_80
            | CryptoSuite::Aes128Sha1_32
            | CryptoSuite::Aes128Sha1_80NoAuth
            | CryptoSuite::Aes128Sha1_32NoAuth
            | CryptoSuite::Aes128Sha1_80SrtpNoCipher
            | CryptoSuite::Aes128Sha1_80SrtcpNoCipher
            | CryptoSuite::Aes128Sha1_80NoCipher => Some(16 + 14),
            CryptoSuite::Aes256Sha1_80
            | CryptoSuite::AesCm256Sha1_80
            | CryptoSuite::Aes256Sha1_32 => Some(32 + 14),
            CryptoSuite::AeadAes128Gcm => Some(16 + 12),
            CryptoSuite::AeadAes256Gcm => Some(32 + 12),
        }
    }
}

impl fmt::Display for CryptoSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_name_params() {
            Some(CryptoSuiteNameParams { name, params: Some(p) }) => write!(f, "{} {}", name, p),
            Some(CryptoSuiteNameParams { name, params: None }) => f.write_str(name),
            None => f.write_str("INVALID"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_entry_round_trips() {
        for e in SUITE_TABLE {
            let desc = CryptoSuiteNameParams::new(e.name, e.params);
            let suite = CryptoSuite::build_from_name_params(&desc);
            assert_eq!(suite, e.suite, "{} {:?}", e.name, e.params);
            assert_eq!(suite.to_name_params(), Some(desc));
        }
    }

    #[test]
    fn test_aes_80_variants_are_distinct() {
        let params = [
            None,
            Some("UNENCRYPTED_SRTP"),
            Some("UNENCRYPTED_SRTCP"),
            Some("UNENCRYPTED_SRTP UNENCRYPTED_SRTCP"),
            Some("UNAUTHENTICATED_SRTP"),
        ];
        let mut suites: Vec<CryptoSuite> = params
            .iter()
            .map(|p| {
                CryptoSuite::build_from_name_params(&CryptoSuiteNameParams::new(
                    "AES_CM_128_HMAC_SHA1_80",
                    *p,
                ))
            })
            .collect();
        suites.dedup();
        assert_eq!(suites.len(), 5);
        assert!(!suites.contains(&CryptoSuite::Invalid));
    }

    #[test]
    fn test_invalid_combinations() {
        let sha1_32 = "AES_CM_128_HMAC_SHA1_32";
        for p in ["UNENCRYPTED_SRTP", "UNENCRYPTED_SRTCP", "UNENCRYPTED_SRTP UNENCRYPTED_SRTCP"] {
            let desc = CryptoSuiteNameParams::new(sha1_32, Some(p));
            assert_eq!(CryptoSuite::build_from_name_params(&desc), CryptoSuite::Invalid);
        }

        for name in [
            "AES_256_CM_HMAC_SHA1_32",
            "AES_256_CM_HMAC_SHA1_80",
            "AES_CM_256_HMAC_SHA1_80",
            "AEAD_AES_128_GCM",
            "AEAD_AES_256_GCM",
        ] {
            for p in ["UNENCRYPTED_SRTP", "UNENCRYPTED_SRTCP", "UNAUTHENTICATED_SRTP"] {
                let desc = CryptoSuiteNameParams::new(name, Some(p));
                assert_eq!(CryptoSuite::build_from_name_params(&desc), CryptoSuite::Invalid);
            }
        }

        let unknown = CryptoSuiteNameParams::new("F8_128_HMAC_SHA1_80", None);
        assert_eq!(CryptoSuite::build_from_name_params(&unknown), CryptoSuite::Invalid);
        assert!(CryptoSuite::Invalid.to_name_params().is_none());
    }

    #[test]
    fn test_unrelated_tokens_ignored() {
        let desc = CryptoSuiteNameParams::new("AES_CM_128_HMAC_SHA1_80", Some("KDR=20 UNENCRYPTED_SRTCP"));
        assert_eq!(
            CryptoSuite::build_from_name_params(&desc),
            CryptoSuite::Aes128Sha1_80SrtcpNoCipher
        );
    }

    #[test]
    fn test_unencrypted_dominates_unauthenticated() {
        let desc = CryptoSuiteNameParams::new(
            "AES_CM_128_HMAC_SHA1_80",
            Some("UNAUTHENTICATED_SRTP UNENCRYPTED_SRTP"),
        );
        assert_eq!(
            CryptoSuite::build_from_name_params(&desc),
            CryptoSuite::Aes128Sha1_80SrtpNoCipher
        );
    }

    #[test]
    fn test_cipher_and_auth_predicates() {
        assert!(CryptoSuite::Aes128Sha1_80NoCipher.is_unencrypted());
        assert!(!CryptoSuite::Aes128Sha1_80.is_unencrypted());
        assert!(CryptoSuite::Aes128Sha1_32NoAuth.is_unauthenticated());
        assert!(!CryptoSuite::AeadAes128Gcm.is_unauthenticated());
        assert_eq!(CryptoSuite::AeadAes256Gcm.master_key_salt_len(), Some(44));
    }
}
