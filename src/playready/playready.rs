// SPDX-License-Identifier: GPL-2.0-or-later

//! PlayReady content protection: deterministic content-key
//! derivation from a key seed, the WRMHEADER record that
//! license servers consume, and AES-128-CTR sample encryption.
//!
//! The header format is documented in "PlayReady Header
//! Object" at <http://www.microsoft.com/playready/documents/>.

mod encrypt;

pub use encrypt::{decrypt_samples, encrypt_samples, EncryptError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use common::hex_decode;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// PlayReady protection system id,
/// urn:uuid:9a04f079-9840-4286-ab92-e65be0885f95.
pub const PLAYREADY_SYSTEM_ID: [u8; 16] = [
    0x9a, 0x04, 0xf0, 0x79, 0x98, 0x40, 0x42, 0x86, 0xab, 0x92, 0xe6, 0x5b, 0xe0, 0x88, 0x5f, 0x95,
];

pub const PLAYREADY_SCHEME_ID_URI: &str = "urn:uuid:9a04f079-9840-4286-ab92-e65be0885f95";

/// Key seed of the public Microsoft demo license server. Only
/// useful for testing since anyone can derive its keys.
pub const DEMO_KEY_SEED: &str = "5D5068BEC9B384FF6044867159F16D6B755544FCD5116989B1ACC4278E88";

/// License server of the Microsoft demo deployment.
pub const DEMO_LICENSE_URL: &str = "http://playready.directtaps.net/pr/svc/rightsmanager.asmx";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrmType {
    Clear,
    PlayReady,
    Cenc,
}

impl DrmType {
    /// Tag used in URLs and cache keys.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            DrmType::Clear => "clear",
            DrmType::PlayReady => "pr",
            DrmType::Cenc => "cenc",
        }
    }

    #[must_use]
    pub fn scheme_id_uri(self) -> &'static str {
        match self {
            DrmType::Clear => "",
            DrmType::PlayReady => PLAYREADY_SCHEME_ID_URI,
            DrmType::Cenc => "urn:mpeg:dash:mp4protection:2011",
        }
    }

    #[must_use]
    pub fn is_encrypted(self) -> bool {
        self != DrmType::Clear
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown drm type: '{0}'")]
pub struct ParseDrmTypeError(String);

impl std::str::FromStr for DrmType {
    type Err = ParseDrmTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clear" => Ok(DrmType::Clear),
            "pr" => Ok(DrmType::PlayReady),
            _ => Err(ParseDrmTypeError(s.to_owned())),
        }
    }
}

/// 30-byte key seed shared between the origin and the license
/// server.
#[derive(Clone, Copy, Debug)]
pub struct KeySeed([u8; 30]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseKeySeedError {
    #[error("key seed must be 60 hex characters, got {0}")]
    WrongLength(usize),

    #[error("key seed is not hex: {0}")]
    Hex(#[from] common::ParseHexError),
}

impl KeySeed {
    pub fn from_hex(s: &str) -> Result<Self, ParseKeySeedError> {
        if s.len() != 60 {
            return Err(ParseKeySeedError::WrongLength(s.len()));
        }
        let bytes = hex_decode(s)?;
        let mut seed = [0; 30];
        seed.copy_from_slice(&bytes);
        Ok(Self(seed))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 30] {
        &self.0
    }

    /// Derive the content key for a key id: three SHA-256
    /// passes over seed and kid, each folded to 128 bits and
    /// combined by XOR.
    #[must_use]
    pub fn generate_content_key(&self, kid: &[u8; 16]) -> [u8; 16] {
        let hash_a = Sha256::new()
            .chain_update(self.0)
            .chain_update(kid)
            .finalize();
        let hash_b = Sha256::new()
            .chain_update(self.0)
            .chain_update(kid)
            .chain_update(self.0)
            .finalize();
        let hash_c = Sha256::new()
            .chain_update(self.0)
            .chain_update(kid)
            .chain_update(self.0)
            .chain_update(kid)
            .finalize();

        let mut key = [0; 16];
        for i in 0..16 {
            key[i] = hash_a[i]
                ^ hash_a[i + 16]
                ^ hash_b[i]
                ^ hash_b[i + 16]
                ^ hash_c[i]
                ^ hash_c[i + 16];
        }
        key
    }
}

/// WRMHEADER envelope: a 10-byte record header followed by the
/// XML serialized as UTF-16LE. This is the payload of both the
/// Smooth `<ProtectionHeader>` element (base64) and the DASH
/// pssh box (binary).
#[must_use]
pub fn protection_header(kid: &[u8; 16], la_url: &str) -> Vec<u8> {
    // Clients insist on the whole document being one line.
    let xml = format!(
        "<WRMHEADER xmlns=\"http://schemas.microsoft.com/DRM/2007/03/PlayReadyHeader\" \
         version=\"4.0.0.0\">\
         <DATA>\
         <PROTECTINFO><KEYLEN>16</KEYLEN><ALGID>AESCTR</ALGID></PROTECTINFO>\
         <KID>{}</KID>\
         <CUSTOMATTRIBUTES><IIS_DRM_VERSION>7.1.1064.0</IIS_DRM_VERSION></CUSTOMATTRIBUTES>\
         <LA_URL>{}</LA_URL>\
         <DS_ID>AH+03juKbUGbHl1V/QIwRA==</DS_ID>\
         </DATA>\
         </WRMHEADER>",
        BASE64.encode(kid),
        la_url,
    );

    let utf16: Vec<u16> = xml.encode_utf16().collect();
    let xml_len = u16::try_from(utf16.len() * 2).expect("header fits u16");
    let total_len = u32::from(xml_len) + 10;

    let mut out = Vec::with_capacity(usize::from(xml_len) + 10);
    out.extend_from_slice(&total_len.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // record count
    out.extend_from_slice(&1u16.to_le_bytes()); // record type: rights management header
    out.extend_from_slice(&xml_len.to_le_bytes());
    for unit in utf16 {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

#[must_use]
pub fn protection_header_base64(kid: &[u8; 16], la_url: &str) -> String {
    BASE64.encode(protection_header(kid, la_url))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    // Vector derived from the demo server key seed.
    const TEST_KID: [u8; 16] = [
        0xbc, 0x03, 0xbd, 0xa4, 0x54, 0xe9, 0xb6, 0xb6, 0x74, 0x3b, 0xc4, 0xc2, 0x26, 0xad, 0x22,
        0x68,
    ];

    #[test]
    fn test_generate_content_key() {
        let seed = KeySeed::from_hex(DEMO_KEY_SEED).unwrap();
        let want = [
            0xc4, 0x60, 0xac, 0x65, 0xee, 0xe2, 0x5a, 0x72, 0xbd, 0xb7, 0x06, 0xaf, 0x1e, 0x5b,
            0x52, 0xb6,
        ];
        assert_eq!(want, seed.generate_content_key(&TEST_KID));
        // Deterministic.
        assert_eq!(want, seed.generate_content_key(&TEST_KID));
    }

    #[test]
    fn test_key_seed_errors() {
        assert_eq!(
            ParseKeySeedError::WrongLength(4),
            KeySeed::from_hex("beef").unwrap_err()
        );
        let bad = "ZZ".repeat(30);
        assert!(matches!(
            KeySeed::from_hex(&bad).unwrap_err(),
            ParseKeySeedError::Hex(_)
        ));
    }

    #[test]
    fn test_protection_header_envelope() {
        let header = protection_header(&TEST_KID, "http://example.com/rightsmanager.asmx");

        let total_len = u32::from_le_bytes(header[0..4].try_into().unwrap());
        assert_eq!(header.len(), usize::try_from(total_len).unwrap());
        assert_eq!(1, u16::from_le_bytes(header[4..6].try_into().unwrap()));
        assert_eq!(1, u16::from_le_bytes(header[6..8].try_into().unwrap()));
        let xml_len = u16::from_le_bytes(header[8..10].try_into().unwrap());
        assert_eq!(header.len() - 10, usize::from(xml_len));

        let units: Vec<u16> = header[10..]
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let xml = String::from_utf16(&units).unwrap();
        assert!(xml.starts_with("<WRMHEADER"));
        assert!(xml.ends_with("</WRMHEADER>"));
        assert!(!xml.contains('\n'));
        assert!(xml.contains("<ALGID>AESCTR</ALGID>"));
        assert!(xml.contains("<KEYLEN>16</KEYLEN>"));
        assert!(xml.contains(&format!("<KID>{}</KID>", BASE64.encode(TEST_KID))));
        assert!(xml.contains("<LA_URL>http://example.com/rightsmanager.asmx</LA_URL>"));
    }

    #[test]
    fn test_protection_header_base64_roundtrip() {
        let encoded = protection_header_base64(&TEST_KID, "http://example.com/");
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(protection_header(&TEST_KID, "http://example.com/"), decoded);
    }

    #[test]
    fn test_drm_type() {
        assert_eq!(DrmType::PlayReady, DrmType::from_str("pr").unwrap());
        assert_eq!(DrmType::Clear, DrmType::from_str("clear").unwrap());
        assert!(DrmType::from_str("widevine").is_err());
        assert!(DrmType::PlayReady.is_encrypted());
        assert!(!DrmType::Clear.is_encrypted());
        assert_eq!("pr", DrmType::PlayReady.name());
    }
}
