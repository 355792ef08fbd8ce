//! Shared value types for the security core

use crate::error::{SecurityError, SecurityResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current on-disk format version of [`EncryptedPayload`]
pub const PAYLOAD_FORMAT_VERSION: u32 = 1;

/// Caller-supplied context describing who is acting.
///
/// Attached to audit events and used by session checks. Every field is
/// optional because background workers act without a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    /// Acting user
    pub user_id: Option<String>,
    /// Session the request arrived on
    pub session_id: Option<String>,
    /// Originating IP address
    pub ip_address: Option<String>,
    /// Originating user agent
    pub user_agent: Option<String>,
}

impl ActorContext {
    /// Context for the system itself (no user)
    #[must_use]
    pub fn system() -> Self {
        Self::default()
    }

    /// Context for a user
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Attach an IP address
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Attach a user agent
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Attach a session identifier
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// AEAD algorithms supported by the security core
///
/// Both algorithms use 256-bit keys, 96-bit nonces and 128-bit tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    /// AES-256 in Galois/Counter Mode
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    /// ChaCha20 stream cipher with Poly1305 MAC
    #[serde(rename = "ChaCha20-Poly1305")]
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    /// Key size in bytes
    #[must_use]
    pub const fn key_size_bytes(self) -> usize {
        match self {
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 32,
        }
    }

    /// Nonce size in bytes
    #[must_use]
    pub const fn nonce_size_bytes(self) -> usize {
        match self {
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 12,
        }
    }

    /// Authentication tag size in bytes
    #[must_use]
    pub const fn tag_size_bytes(self) -> usize {
        match self {
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 16,
        }
    }

    /// Canonical algorithm name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = SecurityError;

    fn from_str(s: &str) -> SecurityResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AES-256-GCM" | "AES256GCM" => Ok(Self::Aes256Gcm),
            "CHACHA20-POLY1305" | "CHACHA20POLY1305" => Ok(Self::ChaCha20Poly1305),
            other => Err(SecurityError::generation(format!(
                "unsupported encryption algorithm '{other}'"
            ))),
        }
    }
}

/// Digest algorithms for `hash` / `verify_integrity`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Length of the hex encoded digest
    #[must_use]
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }

    /// Infer the algorithm from a hex digest length
    #[must_use]
    pub const fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            64 => Some(Self::Sha256),
            96 => Some(Self::Sha384),
            128 => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// Output of an AEAD encryption.
///
/// Binary fields are base64 encoded when serialized. The algorithm and format
/// version are bound into the associated data, so altering either makes
/// decryption fail the same way a flipped ciphertext byte does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Encrypted data (without tag)
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// Nonce used for this encryption
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Authentication tag
    #[serde(with = "base64_bytes")]
    pub tag: Vec<u8>,
    /// Algorithm used
    pub algorithm: EncryptionAlgorithm,
    /// Encryption timestamp
    pub created_at: DateTime<Utc>,
    /// Format version
    pub version: u32,
}

impl EncryptedPayload {
    /// Associated data authenticated alongside the ciphertext
    #[must_use]
    pub fn associated_data(algorithm: EncryptionAlgorithm, version: u32) -> Vec<u8> {
        format!("{}|v{version}", algorithm.name()).into_bytes()
    }

    /// Total size of the payload's binary parts
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.ciphertext.len() + self.nonce.len() + self.tag.len()
    }

    /// Serialize to JSON bytes
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if encoding fails
    pub fn to_json(&self) -> SecurityResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from JSON bytes
    ///
    /// # Errors
    ///
    /// Returns `Format` if the bytes are not a valid payload record
    pub fn from_json(bytes: &[u8]) -> SecurityResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SecurityError::format(format!("invalid encrypted payload: {e}")))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(
            "aes-256-gcm".parse::<EncryptionAlgorithm>().ok(),
            Some(EncryptionAlgorithm::Aes256Gcm)
        );
        assert_eq!(
            "ChaCha20-Poly1305".parse::<EncryptionAlgorithm>().ok(),
            Some(EncryptionAlgorithm::ChaCha20Poly1305)
        );
        assert!("DES".parse::<EncryptionAlgorithm>().is_err());
    }

    #[test]
    fn test_payload_json_is_base64() {
        let payload = EncryptedPayload {
            ciphertext: vec![1, 2, 3],
            nonce: vec![0; 12],
            tag: vec![9; 16],
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            created_at: Utc::now(),
            version: PAYLOAD_FORMAT_VERSION,
        };
        let json = String::from_utf8(payload.to_json().unwrap()).unwrap();
        assert!(json.contains("\"ciphertext\":\"AQID\""));
        assert!(json.contains("\"algorithm\":\"AES-256-GCM\""));
        assert_eq!(EncryptedPayload::from_json(json.as_bytes()).unwrap(), payload);
    }

    #[test]
    fn test_malformed_payload_is_format_error() {
        let result = EncryptedPayload::from_json(b"{\"ciphertext\":1}");
        assert!(matches!(result, Err(SecurityError::Format { .. })));
    }

    #[test]
    fn test_hash_algorithm_from_hex_len() {
        assert_eq!(HashAlgorithm::from_hex_len(64), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_hex_len(128), Some(HashAlgorithm::Sha512));
        assert_eq!(HashAlgorithm::from_hex_len(10), None);
    }
}
