//! Key lifecycle types

use crate::error::{SecurityError, SecurityResult};
use crate::types::EncryptionAlgorithm;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Key identifier: `{type}_{purpose}_{YYYYMMDDHHMMSS}_{16 hex}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Wrap an existing identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier for a key of `key_type` serving `purpose`.
    ///
    /// `purpose` must already be sanitised.
    #[must_use]
    pub(crate) fn generate(key_type: KeyType, purpose: &str, now: DateTime<Utc>) -> Self {
        let mut suffix = [0u8; 8];
        OsRng.fill_bytes(&mut suffix);
        Self(format!(
            "{}_{}_{}_{}",
            key_type.as_str(),
            purpose,
            now.format("%Y%m%d%H%M%S"),
            hex::encode(suffix)
        ))
    }

    /// The identifier string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is safe to use as a file name stem
    pub(crate) fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for KeyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Normalise a purpose to `[a-z0-9-]`
///
/// # Errors
///
/// Returns `Generation` if nothing usable is left
pub(crate) fn sanitize_purpose(purpose: &str) -> SecurityResult<String> {
    let sanitized: String = purpose
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches('-').to_string();
    if sanitized.is_empty() {
        return Err(SecurityError::generation(format!(
            "invalid key purpose '{purpose}'"
        )));
    }
    Ok(sanitized)
}

/// What a key is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// General symmetric encryption
    Symmetric,
    /// Signing key pair
    Asymmetric,
    /// Root key
    Master,
    /// Database field encryption
    Database,
    /// Session data
    Session,
    /// File encryption
    File,
    /// Transport / messaging
    Communication,
    /// Backup encryption
    Backup,
}

impl KeyType {
    /// Name used inside key identifiers
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Symmetric => "symmetric",
            Self::Asymmetric => "asymmetric",
            Self::Master => "master",
            Self::Database => "database",
            Self::Session => "session",
            Self::File => "file",
            Self::Communication => "communication",
            Self::Backup => "backup",
        }
    }
}

/// Lifecycle state of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    /// Usable
    Active,
    /// Replaced by rotation
    Archived,
    /// Past its expiry
    Expired,
    /// Withdrawn, never usable again
    Revoked,
}

impl KeyStatus {
    /// Archived, expired and revoked keys never become active again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Algorithms keys can be generated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// AES-256-GCM
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    /// ChaCha20-Poly1305
    #[serde(rename = "ChaCha20-Poly1305")]
    ChaCha20Poly1305,
    /// Ed25519 signatures
    #[serde(rename = "Ed25519")]
    Ed25519,
}

impl KeyAlgorithm {
    /// Canonical name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "ChaCha20-Poly1305",
            Self::Ed25519 => "Ed25519",
        }
    }

    /// Whether the algorithm/size/type combination can be generated
    #[must_use]
    pub fn supports(self, key_type: KeyType, key_size_bits: u32) -> bool {
        let asymmetric = key_type == KeyType::Asymmetric;
        match self {
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => !asymmetric && key_size_bits == 256,
            Self::Ed25519 => asymmetric && key_size_bits == 256,
        }
    }

    /// AEAD algorithm for symmetric keys
    #[must_use]
    pub const fn encryption_algorithm(self) -> Option<EncryptionAlgorithm> {
        match self {
            Self::Aes256Gcm => Some(EncryptionAlgorithm::Aes256Gcm),
            Self::ChaCha20Poly1305 => Some(EncryptionAlgorithm::ChaCha20Poly1305),
            Self::Ed25519 => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = SecurityError;

    fn from_str(s: &str) -> SecurityResult<Self> {
        if s.eq_ignore_ascii_case("ed25519") {
            return Ok(Self::Ed25519);
        }
        s.parse::<EncryptionAlgorithm>().map(|algorithm| match algorithm {
            EncryptionAlgorithm::Aes256Gcm => Self::Aes256Gcm,
            EncryptionAlgorithm::ChaCha20Poly1305 => Self::ChaCha20Poly1305,
        })
    }
}

/// Parameters of a key to generate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    /// Key type
    pub key_type: KeyType,
    /// Purpose, e.g. `database`
    pub purpose: String,
    /// Algorithm
    pub algorithm: KeyAlgorithm,
    /// Key size in bits
    pub key_size_bits: u32,
    /// Days until rotation (0 = never); `None` uses the configured default
    pub rotation_interval_days: Option<u32>,
}

impl KeySpec {
    /// AES-256-GCM key of the given type
    #[must_use]
    pub fn new(key_type: KeyType, purpose: impl Into<String>) -> Self {
        let algorithm = if key_type == KeyType::Asymmetric {
            KeyAlgorithm::Ed25519
        } else {
            KeyAlgorithm::Aes256Gcm
        };
        Self {
            key_type,
            purpose: purpose.into(),
            algorithm,
            key_size_bits: 256,
            rotation_interval_days: None,
        }
    }

    /// Use another algorithm
    #[must_use]
    pub const fn with_algorithm(mut self, algorithm: KeyAlgorithm, key_size_bits: u32) -> Self {
        self.algorithm = algorithm;
        self.key_size_bits = key_size_bits;
        self
    }

    /// Set the rotation interval
    #[must_use]
    pub const fn with_rotation_interval(mut self, days: u32) -> Self {
        self.rotation_interval_days = Some(days);
        self
    }
}

/// Persisted description of a key. Never contains material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Identifier
    pub key_id: KeyId,
    /// Type
    pub key_type: KeyType,
    /// Algorithm
    pub algorithm: KeyAlgorithm,
    /// Size in bits
    pub key_size_bits: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry, if the key rotates
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful `get_key`
    pub last_used_at: Option<DateTime<Utc>>,
    /// Successful `get_key` calls
    pub usage_count: u64,
    /// Lifecycle state
    pub status: KeyStatus,
    /// Sanitised purpose
    pub purpose: String,
    /// Days between rotations (0 = never)
    pub rotation_interval_days: u32,
    /// SHA-256 hex of the material
    pub checksum: String,
    /// Hex public key for asymmetric keys
    pub public_key: Option<String>,
    /// Key this one replaced
    pub replaces: Option<KeyId>,
    /// Key that replaced this one
    pub replaced_by: Option<KeyId>,
    /// Time of the last status change
    pub status_changed_at: DateTime<Utc>,
    /// Reason for the last status change
    pub status_reason: Option<String>,
}

impl KeyMetadata {
    /// Whether `now` is past the expiry
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// Whether rotation is due at `now`
    #[must_use]
    pub fn rotation_due_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub(crate) fn set_status(&mut self, status: KeyStatus, reason: impl Into<String>) {
        self.status = status;
        self.status_changed_at = Utc::now();
        self.status_reason = Some(reason.into());
    }
}

/// Raw key bytes handed to callers.
///
/// Zeroized on drop; `Debug` never prints the bytes.
#[derive(Clone)]
pub struct KeyMaterial {
    key_id: KeyId,
    algorithm: KeyAlgorithm,
    bytes: Zeroizing<Vec<u8>>,
}

impl KeyMaterial {
    pub(crate) const fn new(key_id: KeyId, algorithm: KeyAlgorithm, bytes: Zeroizing<Vec<u8>>) -> Self {
        Self {
            key_id,
            algorithm,
            bytes,
        }
    }

    /// Key identifier
    #[must_use]
    pub const fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Algorithm
    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Signing key for Ed25519 material
    #[must_use]
    pub fn signing_key(&self) -> Option<ed25519_dalek::SigningKey> {
        if self.algorithm != KeyAlgorithm::Ed25519 {
            return None;
        }
        let bytes: [u8; 32] = self.bytes.as_slice().try_into().ok()?;
        Some(ed25519_dalek::SigningKey::from_bytes(&bytes))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Typed update of the mutable metadata fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMetadataPatch {
    /// New rotation interval in days
    pub rotation_interval_days: Option<u32>,
    /// New expiry (`Some(None)` removes it)
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

impl KeyMetadataPatch {
    /// Set the rotation interval
    #[must_use]
    pub const fn rotation_interval_days(mut self, days: u32) -> Self {
        self.rotation_interval_days = Some(days);
        self
    }

    /// Set or clear the expiry
    #[must_use]
    pub const fn expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the patch changes nothing
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rotation_interval_days.is_none() && self.expires_at.is_none()
    }
}

/// Outcome of one rotation sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationSweep {
    /// Keys that were due
    pub due: usize,
    /// (old, new) pairs rotated
    pub rotated: Vec<(KeyId, KeyId)>,
    /// Keys that failed to rotate and why
    pub failed: Vec<(KeyId, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_format() {
        let now = Utc::now();
        let id = KeyId::generate(KeyType::Database, "customer-data", now);
        let parts: Vec<&str> = id.as_str().split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "database");
        assert_eq!(parts[1], "customer-data");
        assert_eq!(parts[2].len(), 14);
        assert_eq!(parts[3].len(), 16);
        assert!(id.is_path_safe());
        assert!(!KeyId::from("../etc/passwd").is_path_safe());
    }

    #[test]
    fn test_purpose_sanitizing() {
        assert_eq!(sanitize_purpose("Audit Details").unwrap(), "audit-details");
        assert_eq!(sanitize_purpose("db_main").unwrap(), "db-main");
        assert!(sanitize_purpose("  __ ").is_err());
    }

    #[test]
    fn test_supported_combinations() {
        assert!(KeyAlgorithm::Aes256Gcm.supports(KeyType::Database, 256));
        assert!(!KeyAlgorithm::Aes256Gcm.supports(KeyType::Database, 128));
        assert!(!KeyAlgorithm::Aes256Gcm.supports(KeyType::Asymmetric, 256));
        assert!(KeyAlgorithm::Ed25519.supports(KeyType::Asymmetric, 256));
        assert!(!KeyAlgorithm::Ed25519.supports(KeyType::Session, 256));
        assert!("ed25519".parse::<KeyAlgorithm>().is_ok());
        assert!(matches!(
            "RSA-2048".parse::<KeyAlgorithm>(),
            Err(SecurityError::Generation { .. })
        ));
    }

    #[test]
    fn test_key_material_debug_is_redacted() {
        let material = KeyMaterial::new(
            KeyId::from("k"),
            KeyAlgorithm::Aes256Gcm,
            Zeroizing::new(vec![0x42; 32]),
        );
        let debug = format!("{material:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("66"));
    }
}
