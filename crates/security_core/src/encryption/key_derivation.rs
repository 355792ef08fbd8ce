//! Password based key derivation (PBKDF2-HMAC and Argon2id)

use super::utils;
use crate::error::{SecurityError, SecurityResult};
use argon2::{Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use zeroize::Zeroizing;

/// Length of every derived key in bytes
pub const DERIVED_KEY_LEN: usize = 32;

/// Salt length used when the caller does not supply one
pub const DEFAULT_SALT_LEN: usize = 32;

/// Shortest salt accepted
pub const MIN_SALT_LEN: usize = 16;

/// Lowest PBKDF2 iteration count accepted
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Key derivation function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    /// PBKDF2 with HMAC-SHA256
    Pbkdf2Sha256,
    /// PBKDF2 with HMAC-SHA512
    Pbkdf2Sha512,
    /// Argon2id (RFC 9106)
    Argon2id,
}

/// Parameters for a derivation.
///
/// `iterations` is the PBKDF2 round count or the Argon2 time cost;
/// `memory_kib` and `parallelism` only apply to Argon2id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Derivation function
    pub algorithm: KdfAlgorithm,
    /// Iterations (PBKDF2) or time cost (Argon2)
    pub iterations: u32,
    /// Argon2 memory cost in KiB
    pub memory_kib: u32,
    /// Argon2 lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Pbkdf2Sha256,
            iterations: 210_000,
            memory_kib: 65_536, // 64MB
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Argon2id parameters
    #[must_use]
    pub const fn argon2id(time_cost: u32, memory_kib: u32, parallelism: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            iterations: time_cost,
            memory_kib,
            parallelism,
        }
    }

    /// Validate parameters
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if any parameter is out of range
    pub fn validate(&self) -> SecurityResult<()> {
        let invalid = |reason: &str| SecurityError::Configuration {
            field: "kdf".to_string(),
            reason: reason.to_string(),
        };

        match self.algorithm {
            KdfAlgorithm::Pbkdf2Sha256 | KdfAlgorithm::Pbkdf2Sha512 => {
                if self.iterations < MIN_PBKDF2_ITERATIONS {
                    return Err(invalid("PBKDF2 iterations below 100000"));
                }
            }
            KdfAlgorithm::Argon2id => {
                if self.memory_kib < 1024 {
                    return Err(invalid("Argon2 memory cost too low (minimum 1024 KiB)"));
                }
                if self.iterations == 0 {
                    return Err(invalid("Argon2 time cost cannot be zero"));
                }
                if self.parallelism == 0 {
                    return Err(invalid("Argon2 parallelism cannot be zero"));
                }
            }
        }
        Ok(())
    }
}

/// A derived key together with the salt that produced it
pub struct DerivedKey {
    /// Derived key bytes, wiped on drop
    pub key: Zeroizing<[u8; DERIVED_KEY_LEN]>,
    /// Salt used for derivation
    pub salt: Vec<u8>,
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("key", &"[REDACTED]")
            .field("salt", &hex::encode(&self.salt))
            .finish()
    }
}

/// Derive a 256-bit key from `password` and `salt`.
///
/// The result is deterministic for a given (password, salt, params).
///
/// # Errors
///
/// Returns `Configuration` for invalid parameters, `Format` if the salt is
/// shorter than 16 bytes and `Internal` if the KDF itself fails.
pub fn derive(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> SecurityResult<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
    params.validate()?;
    if salt.len() < MIN_SALT_LEN {
        return Err(SecurityError::format(format!(
            "salt too short (minimum {MIN_SALT_LEN} bytes)"
        )));
    }

    let mut output = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    match params.algorithm {
        KdfAlgorithm::Pbkdf2Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, params.iterations, output.as_mut_slice());
        }
        KdfAlgorithm::Pbkdf2Sha512 => {
            pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, params.iterations, output.as_mut_slice());
        }
        KdfAlgorithm::Argon2id => {
            let argon_params = Params::new(
                params.memory_kib,
                params.iterations,
                params.parallelism,
                Some(DERIVED_KEY_LEN),
            )
            .map_err(|e| SecurityError::Internal {
                reason: format!("invalid Argon2 parameters: {e}"),
            })?;
            Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon_params)
                .hash_password_into(password, salt, output.as_mut_slice())
                .map_err(|e| SecurityError::Internal {
                    reason: format!("Argon2 key derivation failed: {e}"),
                })?;
        }
    }

    Ok(output)
}

/// Derive a key, generating a fresh salt when none is supplied
///
/// # Errors
///
/// See [`derive`]
pub fn derive_with_optional_salt(
    password: &[u8],
    salt: Option<&[u8]>,
    params: &KdfParams,
) -> SecurityResult<DerivedKey> {
    let salt = salt.map_or_else(|| utils::generate_salt(DEFAULT_SALT_LEN), <[u8]>::to_vec);
    let key = derive(password, &salt, params)?;
    Ok(DerivedKey { key, salt })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_pbkdf2() -> KdfParams {
        KdfParams {
            iterations: MIN_PBKDF2_ITERATIONS,
            ..KdfParams::default()
        }
    }

    #[test]
    fn test_pbkdf2_is_deterministic() -> SecurityResult<()> {
        let salt = utils::generate_salt(32);
        let params = fast_pbkdf2();

        let key1 = derive(b"correct horse", &salt, &params)?;
        let key2 = derive(b"correct horse", &salt, &params)?;
        assert_eq!(*key1, *key2);

        let other = derive(b"correct horse", &utils::generate_salt(32), &params)?;
        assert_ne!(*key1, *other);
        Ok(())
    }

    #[test]
    fn test_sha512_differs_from_sha256() -> SecurityResult<()> {
        let salt = [7u8; 32];
        let sha256 = derive(b"pw", &salt, &fast_pbkdf2())?;
        let sha512 = derive(
            b"pw",
            &salt,
            &KdfParams {
                algorithm: KdfAlgorithm::Pbkdf2Sha512,
                ..fast_pbkdf2()
            },
        )?;
        assert_ne!(*sha256, *sha512);
        Ok(())
    }

    #[test]
    fn test_argon2id_derivation() -> SecurityResult<()> {
        let params = KdfParams::argon2id(1, 1024, 1);
        let salt = [3u8; 16];
        let key1 = derive(b"test_password_123", &salt, &params)?;
        let key2 = derive(b"test_password_123", &salt, &params)?;
        assert_eq!(*key1, *key2);
        Ok(())
    }

    #[test]
    fn test_generated_salt() -> SecurityResult<()> {
        let derived = derive_with_optional_salt(b"pw", None, &fast_pbkdf2())?;
        assert_eq!(derived.salt.len(), DEFAULT_SALT_LEN);
        assert!(!format!("{derived:?}").contains(&hex::encode(*derived.key)));
        Ok(())
    }

    #[test]
    fn test_rejects_weak_parameters() {
        let weak = KdfParams {
            iterations: 1_000,
            ..KdfParams::default()
        };
        assert!(matches!(
            derive(b"pw", &[0u8; 32], &weak),
            Err(SecurityError::Configuration { .. })
        ));
        assert!(matches!(
            derive(b"pw", &[0u8; 8], &fast_pbkdf2()),
            Err(SecurityError::Format { .. })
        ));
    }
}
