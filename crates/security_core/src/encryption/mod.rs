//! Encryption primitives shared by the security core components
//!
//! Nothing in here holds state: callers pass key bytes in and get payloads or
//! plaintext back. Key caching and lifecycle live in [`crate::crypto`] and
//! [`crate::keys`].

pub mod aead;
pub mod key_derivation;

pub use aead::{open, seal};

/// Utility functions for encryption operations
pub mod utils {
    use crate::types::{EncryptionAlgorithm, HashAlgorithm};
    use rand::rngs::OsRng;
    use rand::RngCore;
    use sha2::{Digest, Sha256, Sha384, Sha512};
    use subtle::ConstantTimeEq;
    use zeroize::Zeroizing;

    /// Generates a random nonce of the size the algorithm requires.
    ///
    /// Nonces come from the operating system CSPRNG; with 96 random bits the
    /// collision probability stays negligible for the number of messages a
    /// single key encrypts before rotation.
    #[must_use]
    pub fn generate_nonce(algorithm: EncryptionAlgorithm) -> Vec<u8> {
        let mut nonce = vec![0u8; algorithm.nonce_size_bytes()];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    /// Generates a random salt of the given size
    #[must_use]
    pub fn generate_salt(size: usize) -> Vec<u8> {
        let mut salt = vec![0u8; size];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Random secret bytes that are wiped on drop
    #[must_use]
    pub fn random_secret(size: usize) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(vec![0u8; size]);
        OsRng.fill_bytes(bytes.as_mut_slice());
        bytes
    }

    /// Compares two byte slices in constant time.
    ///
    /// Slices of different length compare unequal without inspecting content.
    #[must_use]
    pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
        a.ct_eq(b).into()
    }

    /// Hex encoded digest of `data`
    #[must_use]
    pub fn digest_hex(algorithm: HashAlgorithm, data: &[u8]) -> String {
        match algorithm {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            HashAlgorithm::Sha384 => hex::encode(Sha384::digest(data)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }

    /// Hex encoded SHA-256 digest of `data`
    #[must_use]
    pub fn sha256_hex(data: &[u8]) -> String {
        digest_hex(HashAlgorithm::Sha256, data)
    }
}
