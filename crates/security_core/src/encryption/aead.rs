//! AEAD sealing and opening for AES-256-GCM and ChaCha20-Poly1305

use super::utils;
use crate::error::{SecurityError, SecurityResult};
use crate::types::{EncryptedPayload, EncryptionAlgorithm, PAYLOAD_FORMAT_VERSION};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use chrono::Utc;
use zeroize::Zeroizing;

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// # Errors
///
/// Returns `Format` if the key has the wrong length and `Internal` if the
/// cipher rejects the input.
pub fn seal(
    algorithm: EncryptionAlgorithm,
    key: &[u8],
    plaintext: &[u8],
) -> SecurityResult<EncryptedPayload> {
    let nonce = utils::generate_nonce(algorithm);
    seal_with_nonce(algorithm, key, plaintext, nonce)
}

/// Encrypt with a caller-chosen nonce. Nonce uniqueness is the caller's job.
pub(crate) fn seal_with_nonce(
    algorithm: EncryptionAlgorithm,
    key: &[u8],
    plaintext: &[u8],
    nonce: Vec<u8>,
) -> SecurityResult<EncryptedPayload> {
    check_key(algorithm, key)?;
    if nonce.len() != algorithm.nonce_size_bytes() {
        return Err(SecurityError::format(format!(
            "nonce must be {} bytes, got {}",
            algorithm.nonce_size_bytes(),
            nonce.len()
        )));
    }

    let aad = EncryptedPayload::associated_data(algorithm, PAYLOAD_FORMAT_VERSION);
    let (ciphertext, tag) = match algorithm {
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key)
                .map_err(|e| SecurityError::format(format!("invalid AES key: {e}")))?;
            encrypt_detached(&cipher, &nonce, plaintext, &aad, algorithm)?
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| SecurityError::format(format!("invalid ChaCha20 key: {e}")))?;
            encrypt_detached(&cipher, &nonce, plaintext, &aad, algorithm)?
        }
    };

    Ok(EncryptedPayload {
        ciphertext,
        nonce,
        tag,
        algorithm,
        created_at: Utc::now(),
        version: PAYLOAD_FORMAT_VERSION,
    })
}

/// Decrypt a payload under `key`.
///
/// # Errors
///
/// Returns `Format` for unknown format versions, wrong nonce/tag/key lengths
/// and `Integrity` when the authentication tag does not verify. Tag
/// comparison happens inside the AEAD implementation in constant time.
pub fn open(payload: &EncryptedPayload, key: &[u8]) -> SecurityResult<Zeroizing<Vec<u8>>> {
    let algorithm = payload.algorithm;
    if payload.version != PAYLOAD_FORMAT_VERSION {
        return Err(SecurityError::format(format!(
            "unsupported payload version {}",
            payload.version
        )));
    }
    if payload.nonce.len() != algorithm.nonce_size_bytes() {
        return Err(SecurityError::format(format!(
            "nonce must be {} bytes, got {}",
            algorithm.nonce_size_bytes(),
            payload.nonce.len()
        )));
    }
    if payload.tag.len() != algorithm.tag_size_bytes() {
        return Err(SecurityError::format(format!(
            "tag must be {} bytes, got {}",
            algorithm.tag_size_bytes(),
            payload.tag.len()
        )));
    }
    check_key(algorithm, key)?;

    let aad = EncryptedPayload::associated_data(algorithm, payload.version);
    let mut sealed = Vec::with_capacity(payload.ciphertext.len() + payload.tag.len());
    sealed.extend_from_slice(&payload.ciphertext);
    sealed.extend_from_slice(&payload.tag);

    let plaintext = match algorithm {
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key)
                .map_err(|e| SecurityError::format(format!("invalid AES key: {e}")))?;
            decrypt_combined(&cipher, &payload.nonce, &sealed, &aad)?
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| SecurityError::format(format!("invalid ChaCha20 key: {e}")))?;
            decrypt_combined(&cipher, &payload.nonce, &sealed, &aad)?
        }
    };

    Ok(Zeroizing::new(plaintext))
}

fn check_key(algorithm: EncryptionAlgorithm, key: &[u8]) -> SecurityResult<()> {
    if key.len() == algorithm.key_size_bytes() {
        Ok(())
    } else {
        Err(SecurityError::format(format!(
            "{algorithm} requires a {}-byte key, got {}",
            algorithm.key_size_bytes(),
            key.len()
        )))
    }
}

fn encrypt_detached<C: Aead>(
    cipher: &C,
    nonce: &[u8],
    plaintext: &[u8],
    aad: &[u8],
    algorithm: EncryptionAlgorithm,
) -> SecurityResult<(Vec<u8>, Vec<u8>)> {
    let mut sealed = cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| SecurityError::Internal {
            reason: format!("{algorithm} encryption failed: {e}"),
        })?;

    // The AEAD crates append the tag; the payload keeps it separately
    let tag_len = algorithm.tag_size_bytes();
    if sealed.len() < tag_len {
        return Err(SecurityError::Internal {
            reason: "ciphertext too short to contain authentication tag".to_string(),
        });
    }
    let tag = sealed.split_off(sealed.len() - tag_len);
    Ok((sealed, tag))
}

fn decrypt_combined<C: Aead>(
    cipher: &C,
    nonce: &[u8],
    sealed: &[u8],
    aad: &[u8],
) -> SecurityResult<Vec<u8>> {
    cipher
        .decrypt(GenericArray::from_slice(nonce), Payload { msg: sealed, aad })
        .map_err(|_| SecurityError::integrity("authentication tag verification failed"))
}
