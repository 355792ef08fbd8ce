//! # Crypto manager
//!
//! Named-key encryption for application data. The manager keeps a small
//! in-memory cache of raw key bytes keyed by name; a name that has never been
//! seen gets a fresh random key on first encryption. Durable key lifecycle is
//! the [`KeyManager`](crate::keys::KeyManager)'s job; material it hands out
//! can be used directly through [`CryptoManager::encrypt_with_key`].
//!
//! Every operation emits an `ENCRYPTION_OPERATIONS` audit event describing
//! sizes and algorithms. Key material never reaches the audit trail.

mod nonce;

use crate::audit::{AuditCategory, AuditLogger, AuditOutcome, AuditRecord, AuditSeverity};
use crate::config::CryptoConfig;
use crate::encryption::key_derivation::{self, DerivedKey, KdfParams};
use crate::encryption::{aead, utils};
use crate::error::{SecurityError, SecurityResult};
use crate::types::{EncryptedPayload, EncryptionAlgorithm, HashAlgorithm};
use chrono::Utc;
use dashmap::DashMap;
use nonce::{KeyedNonceWindows, NonceWindow};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

const SOURCE: &str = "crypto_manager";

/// Caller-held keys whose nonces are tracked at once
pub const MAX_TRACKED_EXTERNAL_KEYS: usize = 1024;

struct CachedKey {
    material: Zeroizing<Vec<u8>>,
    nonces: NonceWindow,
}

/// Stateless-per-call cryptographic operations over named keys
pub struct CryptoManager {
    algorithm: EncryptionAlgorithm,
    kdf: KdfParams,
    nonce_history: usize,
    keys: DashMap<String, CachedKey>,
    /// Nonce windows for caller-held keys, keyed by key fingerprint
    external_nonces: Mutex<KeyedNonceWindows>,
    audit: Arc<AuditLogger>,
}

impl CryptoManager {
    /// Create a manager
    #[must_use]
    pub fn new(config: &CryptoConfig, audit: Arc<AuditLogger>) -> Self {
        info!("Crypto manager using {}", config.algorithm);
        Self {
            algorithm: config.algorithm,
            kdf: config.kdf.clone(),
            nonce_history: config.nonce_history,
            keys: DashMap::new(),
            external_nonces: Mutex::new(KeyedNonceWindows::new(
                MAX_TRACKED_EXTERNAL_KEYS,
                config.nonce_history,
            )),
            audit,
        }
    }

    /// Algorithm used for new encryptions
    #[must_use]
    pub const fn algorithm(&self) -> EncryptionAlgorithm {
        self.algorithm
    }

    /// Derive a key from a password, generating a 32-byte salt when none is given
    ///
    /// # Errors
    ///
    /// Returns `Format` for salts shorter than 16 bytes
    pub fn derive_key(&self, password: &[u8], salt: Option<&[u8]>) -> SecurityResult<DerivedKey> {
        let derived = key_derivation::derive_with_optional_salt(password, salt, &self.kdf)?;
        self.audit_operation(
            AuditRecord::new(
                AuditCategory::EncryptionOperations,
                "key_derivation",
                AuditSeverity::Debug,
                SOURCE,
                "Derived key from password",
            )
            .detail("kdf", format!("{:?}", self.kdf.algorithm))
            .detail("iterations", self.kdf.iterations)
            .detail("salt_generated", salt.is_none()),
        );
        Ok(derived)
    }

    /// Encrypt under the named key, creating the key on first use
    ///
    /// # Errors
    ///
    /// Returns `NonceReuse` if the generated nonce was already used with this
    /// key; the caller must treat that as fatal
    pub fn encrypt(&self, plaintext: &[u8], key_name: &str) -> SecurityResult<EncryptedPayload> {
        let nonce = utils::generate_nonce(self.algorithm);
        let material = {
            let mut entry = self
                .keys
                .entry(key_name.to_string())
                .or_insert_with(|| self.fresh_key());
            if !entry.nonces.insert(&nonce) {
                drop(entry);
                return Err(self.nonce_reuse(key_name));
            }
            entry.material.clone()
        };

        let payload = aead::seal_with_nonce(self.algorithm, &material, plaintext, nonce)?;
        self.audit_operation(
            AuditRecord::new(
                AuditCategory::EncryptionOperations,
                "encrypt",
                AuditSeverity::Debug,
                SOURCE,
                "Encrypted data",
            )
            .detail("key_name", key_name)
            .detail("algorithm", self.algorithm.name())
            .detail("plaintext_size", plaintext.len())
            .detail("ciphertext_size", payload.total_size()),
        );
        Ok(payload)
    }

    /// Decrypt with the named key
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is not cached, `Format` for malformed
    /// payloads and `Integrity` if authentication fails
    pub fn decrypt(
        &self,
        payload: &EncryptedPayload,
        key_name: &str,
    ) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let material = self
            .keys
            .get(key_name)
            .map(|entry| entry.material.clone())
            .ok_or_else(|| SecurityError::not_found("encryption key", key_name))?;

        self.open_audited(payload, &material, key_name)
    }

    /// Encrypt under caller-held key material
    ///
    /// # Errors
    ///
    /// Returns `Format` for keys of the wrong length and `NonceReuse` on a
    /// repeated nonce
    pub fn encrypt_with_key(
        &self,
        plaintext: &[u8],
        key: &[u8],
        label: &str,
    ) -> SecurityResult<EncryptedPayload> {
        let nonce = utils::generate_nonce(self.algorithm);
        let fingerprint = utils::sha256_hex(key);
        let fresh = self.external_nonces.lock().insert(&fingerprint, &nonce);
        if !fresh {
            return Err(self.nonce_reuse(label));
        }

        let payload = aead::seal_with_nonce(self.algorithm, key, plaintext, nonce)?;
        self.audit_operation(
            AuditRecord::new(
                AuditCategory::EncryptionOperations,
                "encrypt",
                AuditSeverity::Debug,
                SOURCE,
                "Encrypted data with supplied key",
            )
            .detail("key_name", label)
            .detail("algorithm", self.algorithm.name())
            .detail("plaintext_size", plaintext.len()),
        );
        Ok(payload)
    }

    /// Decrypt with caller-held key material
    ///
    /// # Errors
    ///
    /// Returns `Format` for malformed payloads and `Integrity` if
    /// authentication fails
    pub fn decrypt_with_key(
        &self,
        payload: &EncryptedPayload,
        key: &[u8],
        label: &str,
    ) -> SecurityResult<Zeroizing<Vec<u8>>> {
        self.open_audited(payload, key, label)
    }

    fn open_audited(
        &self,
        payload: &EncryptedPayload,
        key: &[u8],
        key_name: &str,
    ) -> SecurityResult<Zeroizing<Vec<u8>>> {
        match aead::open(payload, key) {
            Ok(plaintext) => {
                self.audit_operation(
                    AuditRecord::new(
                        AuditCategory::EncryptionOperations,
                        "decrypt",
                        AuditSeverity::Debug,
                        SOURCE,
                        "Decrypted data",
                    )
                    .detail("key_name", key_name)
                    .detail("algorithm", payload.algorithm.name())
                    .detail("ciphertext_size", payload.total_size()),
                );
                Ok(plaintext)
            }
            Err(e) => {
                let integrity = matches!(e, SecurityError::Integrity { .. });
                let (category, severity) = if integrity {
                    (AuditCategory::SecurityEvents, AuditSeverity::Error)
                } else {
                    (AuditCategory::EncryptionOperations, AuditSeverity::Warning)
                };
                self.audit_operation(
                    AuditRecord::new(
                        category,
                        "decrypt_failed",
                        severity,
                        SOURCE,
                        "Decryption failed",
                    )
                    .detail("key_name", key_name)
                    .detail("algorithm", payload.algorithm.name())
                    .detail("reason", e.to_string())
                    .outcome(AuditOutcome::Failure),
                );
                Err(e)
            }
        }
    }

    /// Hex digest of `data`
    #[must_use]
    pub fn hash(&self, data: &[u8], algorithm: HashAlgorithm) -> String {
        let digest = utils::digest_hex(algorithm, data);
        self.audit_operation(
            AuditRecord::new(
                AuditCategory::EncryptionOperations,
                "hash",
                AuditSeverity::Debug,
                SOURCE,
                "Hashed data",
            )
            .detail("algorithm", format!("{algorithm:?}"))
            .detail("size", data.len()),
        );
        digest
    }

    /// Compare `data` against an expected hex digest in constant time.
    ///
    /// The algorithm is inferred from the digest length; unknown lengths
    /// never verify.
    #[must_use]
    pub fn verify_integrity(&self, data: &[u8], expected_hex: &str) -> bool {
        let Some(algorithm) = HashAlgorithm::from_hex_len(expected_hex.len()) else {
            return false;
        };
        let actual = utils::digest_hex(algorithm, data);
        let verified = utils::constant_time_eq(
            actual.as_bytes(),
            expected_hex.to_ascii_lowercase().as_bytes(),
        );
        self.audit_operation(
            AuditRecord::new(
                AuditCategory::EncryptionOperations,
                "verify_integrity",
                AuditSeverity::Debug,
                SOURCE,
                "Verified data integrity",
            )
            .detail("algorithm", format!("{algorithm:?}"))
            .detail("verified", verified)
            .outcome(if verified {
                AuditOutcome::Success
            } else {
                AuditOutcome::Failure
            }),
        );
        verified
    }

    /// Replace the named key with fresh material.
    ///
    /// The old bytes stay available for decryption under the returned alias
    /// `{name}@archived-{timestamp}`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is not cached
    pub fn rotate_key(&self, key_name: &str) -> SecurityResult<String> {
        let archived = {
            let mut entry = self
                .keys
                .get_mut(key_name)
                .ok_or_else(|| SecurityError::not_found("encryption key", key_name))?;
            let fresh = self.fresh_key();
            entry.nonces = fresh.nonces;
            std::mem::replace(&mut entry.material, fresh.material)
        };

        let alias = format!(
            "{key_name}@archived-{}",
            Utc::now().format("%Y%m%d%H%M%S%3f")
        );
        self.keys.insert(
            alias.clone(),
            CachedKey {
                material: archived,
                nonces: NonceWindow::new(self.nonce_history),
            },
        );

        info!("Rotated cached key {} (archived as {})", key_name, alias);
        self.audit_operation(
            AuditRecord::new(
                AuditCategory::EncryptionOperations,
                "key_rotated",
                AuditSeverity::Info,
                SOURCE,
                "Rotated cached encryption key",
            )
            .detail("key_name", key_name)
            .detail("archived_as", alias.as_str()),
        );
        Ok(alias)
    }

    /// Drop a key from the cache. Returns whether it existed.
    pub fn remove_key(&self, key_name: &str) -> bool {
        let removed = self.keys.remove(key_name).is_some();
        if removed {
            debug!("Removed cached key {}", key_name);
        }
        removed
    }

    /// Whether a key is cached under `key_name`
    #[must_use]
    pub fn has_key(&self, key_name: &str) -> bool {
        self.keys.contains_key(key_name)
    }

    /// Number of cached keys
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Caller-held keys with a tracked nonce window
    #[must_use]
    pub fn tracked_external_keys(&self) -> usize {
        self.external_nonces.lock().len()
    }

    /// Wipe every cached key. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let count = self.keys.len();
        self.keys.clear();
        self.external_nonces.lock().clear();
        debug!("Cleared {} cached keys", count);
        count
    }

    fn fresh_key(&self) -> CachedKey {
        CachedKey {
            material: utils::random_secret(self.algorithm.key_size_bytes()),
            nonces: NonceWindow::new(self.nonce_history),
        }
    }

    fn nonce_reuse(&self, key_name: &str) -> SecurityError {
        error!("Nonce reuse detected for key {}", key_name);
        self.audit.log_event(
            AuditRecord::new(
                AuditCategory::SecurityEvents,
                "nonce_reuse",
                AuditSeverity::Critical,
                SOURCE,
                "Nonce reuse detected, encryption refused",
            )
            .detail("key_name", key_name)
            .outcome(AuditOutcome::Error),
        );
        SecurityError::NonceReuse {
            key: key_name.to_string(),
        }
    }

    fn audit_operation(&self, record: AuditRecord) {
        self.audit.log_event(record);
    }

    #[cfg(test)]
    fn register_nonce(&self, key_name: &str, nonce: &[u8]) -> SecurityResult<()> {
        let mut entry = self
            .keys
            .entry(key_name.to_string())
            .or_insert_with(|| self.fresh_key());
        if entry.nonces.insert(nonce) {
            Ok(())
        } else {
            drop(entry);
            Err(self.nonce_reuse(key_name))
        }
    }
}
